use anyhow::Result;
use kamehouse_lib::users::{self, UpdateProfileInput};
#[path = "util.rs"]
mod util;

#[tokio::test]
async fn profile_updates_keep_unset_fields() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "tien").await;

    let updated = users::update_profile(
        pool,
        &user.id,
        UpdateProfileInput {
            display_name: Some("  Tien Shinhan ".to_string()),
            avatar: None,
        },
    )
    .await?;
    assert_eq!(updated.display_name.as_deref(), Some("Tien Shinhan"));
    assert_eq!(updated.avatar, None);

    let updated = users::update_profile(
        pool,
        &user.id,
        UpdateProfileInput {
            display_name: None,
            avatar: Some("https://example.com/tien.png".to_string()),
        },
    )
    .await?;
    assert_eq!(updated.display_name.as_deref(), Some("Tien Shinhan"));
    assert!(updated.avatar.is_some());

    let err = users::update_profile(
        pool,
        &user.id,
        UpdateProfileInput {
            display_name: Some("   ".to_string()),
            avatar: None,
        },
    )
    .await
    .expect_err("blank display name");
    assert_eq!(err.code(), "VALIDATION/INVALID");
    Ok(())
}

#[tokio::test]
async fn public_profiles_are_limited_to_housemates() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let tien = util::register(&state, "tien").await;
    let chiaotzu = util::register(&state, "chiaotzu").await;
    let stranger = util::register(&state, "tao").await;
    util::household_with(pool, &tien, &[&chiaotzu]).await;

    let profile = users::public_profile(pool, &chiaotzu.id, &tien.id).await?;
    assert_eq!(profile.username, "tien");

    let err = users::public_profile(pool, &stranger.id, &tien.id)
        .await
        .expect_err("not a housemate");
    assert_eq!(err.code(), "USER/FORBIDDEN");

    let err = users::public_profile(pool, &tien.id, "ghost").await.expect_err("unknown user");
    assert_eq!(err.code(), "USER/NOT_FOUND");
    Ok(())
}
