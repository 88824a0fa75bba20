use uuid::Uuid;

/// Time-ordered identifier used as the primary key for every row.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Eight character household invite code drawn from `[A-Z0-9]`.
pub fn new_invite_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_v7_ids_sort_by_creation() {
        let a = new_uuid_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_uuid_v7();
        assert!(a < b);
    }

    #[test]
    fn invite_codes_are_short_and_upper_case() {
        let code = new_invite_code();
        assert_eq!(code.len(), 8);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
