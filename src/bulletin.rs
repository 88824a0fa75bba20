use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    auth::AuthUser,
    categories::HouseholdQuery,
    db::run_in_tx,
    households::{ensure_manager, ensure_member},
    id::new_uuid_v7,
    logging::LogScope,
    notifications::{self, kinds},
    state::AppState,
    time::now_ms,
    util::{ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

const MAX_EMOJI_CHARS: usize = 16;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: i64,
    pub reacted_by_me: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub id: String,
    pub household_id: String,
    pub author_id: String,
    pub author_name: String,
    pub title: String,
    pub body: String,
    pub is_pinned: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub reactions: Vec<ReactionSummary>,
}

impl TryFrom<&SqliteRow> for Announcement {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            author_id: row.try_get("author_id")?,
            author_name: row.try_get("author_name")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            is_pinned: row.try_get::<i64, _>("is_pinned")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            reactions: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAnnouncementInput {
    pub household_id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub is_pinned: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAnnouncementInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinInput {
    /// Omit to toggle.
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionInput {
    pub emoji: String,
}

const SELECT_ANNOUNCEMENT: &str = "SELECT a.*, COALESCE(u.display_name, u.username) AS author_name \
     FROM announcements a JOIN users u ON u.id = a.author_id";

fn validate_text(field: &str, value: &str, max: usize) -> AppResult<String> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > max {
        return Err(AppError::validation(
            field,
            format!("{field} must be between 1 and {max} characters."),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_emoji(emoji: &str) -> AppResult<String> {
    let trimmed = emoji.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_EMOJI_CHARS || trimmed.chars().any(char::is_whitespace) {
        return Err(AppError::validation("emoji", "Reactions must be a single emoji."));
    }
    Ok(trimmed.to_string())
}

async fn reactions_for(
    pool: &SqlitePool,
    announcement_ids: &[String],
    viewer_id: &str,
) -> AppResult<HashMap<String, Vec<ReactionSummary>>> {
    let mut out: HashMap<String, Vec<ReactionSummary>> = HashMap::new();
    if announcement_ids.is_empty() {
        return Ok(out);
    }
    let placeholders = vec!["?"; announcement_ids.len()].join(", ");
    let sql = format!(
        "SELECT announcement_id, emoji, COUNT(*) AS total, MAX(user_id = ?) AS mine, MIN(created_at) AS first_at \
         FROM announcement_reactions WHERE announcement_id IN ({placeholders}) \
         GROUP BY announcement_id, emoji ORDER BY announcement_id, first_at, emoji"
    );
    let mut query = sqlx::query(&sql).bind(viewer_id);
    for id in announcement_ids {
        query = query.bind(id);
    }
    for row in query.fetch_all(pool).await? {
        let announcement_id: String = row.try_get("announcement_id")?;
        out.entry(announcement_id).or_default().push(ReactionSummary {
            emoji: row.try_get("emoji")?,
            count: row.try_get("total")?,
            reacted_by_me: row.try_get::<i64, _>("mine")? != 0,
        });
    }
    Ok(out)
}

async fn load(pool: &SqlitePool, id: &str, viewer_id: &str) -> AppResult<Announcement> {
    let row = sqlx::query(&format!("{SELECT_ANNOUNCEMENT} WHERE a.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            AppError::not_found("ANNOUNCEMENT", "Announcement not found").with_context("id", id.to_string())
        })?;
    let mut announcement = Announcement::try_from(&row)?;
    let mut reactions = reactions_for(pool, &[announcement.id.clone()], viewer_id).await?;
    announcement.reactions = reactions.remove(&announcement.id).unwrap_or_default();
    Ok(announcement)
}

pub async fn find_one(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Announcement> {
    let announcement = load(pool, id, user_id).await?;
    ensure_member(pool, &announcement.household_id, user_id).await?;
    Ok(announcement)
}

pub async fn create(
    pool: &SqlitePool,
    user: &AuthUser,
    input: CreateAnnouncementInput,
) -> AppResult<Announcement> {
    let role = ensure_member(pool, &input.household_id, &user.id).await?;
    let title = validate_text("title", &input.title, 100)?;
    let body = validate_text("body", &input.body, 2000)?;
    if input.is_pinned && !role.can_manage() {
        return Err(AppError::forbidden(
            "HOUSEHOLD",
            "Only household owners and admins can pin announcements.",
        ));
    }

    let scope = LogScope::new("bulletin", "create", Some(&input.household_id), Some(&user.id));
    let id = new_uuid_v7();
    let now = now_ms();
    let announcement_id = id.clone();
    let author_id = user.id.clone();
    let household_id = input.household_id;
    let is_pinned = input.is_pinned;
    let notice = format!("New announcement: {title}");
    let message = format!("{} posted on the bulletin board.", user.username);
    let posted = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO announcements (id, household_id, author_id, title, body, is_pinned, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&announcement_id)
            .bind(&household_id)
            .bind(&author_id)
            .bind(&title)
            .bind(&body)
            .bind(is_pinned)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            notifications::notify_household(
                &mut **tx,
                &household_id,
                &author_id,
                kinds::ANNOUNCEMENT,
                &notice,
                &message,
                Some("/bulletin"),
            )
            .await?;
            Ok::<_, AppError>(())
        })
    })
    .await;
    scope.finish(posted, |_| json!({ "announcement_id": id, "pinned": is_pinned }))?;
    load(pool, &id, &user.id).await
}

/// Announcements of a household, pinned first, then newest first.
pub async fn list(pool: &SqlitePool, household_id: &str, user_id: &str) -> AppResult<Vec<Announcement>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(&format!(
        "{SELECT_ANNOUNCEMENT} WHERE a.household_id = ? ORDER BY a.is_pinned DESC, a.created_at DESC, a.id DESC"
    ))
    .bind(household_id)
    .fetch_all(pool)
    .await?;
    let mut announcements = rows
        .iter()
        .map(Announcement::try_from)
        .collect::<AppResult<Vec<_>>>()?;
    let ids: Vec<String> = announcements.iter().map(|a| a.id.clone()).collect();
    let mut reactions = reactions_for(pool, &ids, user_id).await?;
    for announcement in &mut announcements {
        announcement.reactions = reactions.remove(&announcement.id).unwrap_or_default();
    }
    Ok(announcements)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    input: UpdateAnnouncementInput,
) -> AppResult<Announcement> {
    let existing = find_one(pool, id, user_id).await?;
    if existing.author_id != user_id {
        return Err(AppError::forbidden(
            "ANNOUNCEMENT",
            "Only the author can edit an announcement.",
        ));
    }
    let title = input
        .title
        .as_deref()
        .map(|t| validate_text("title", t, 100))
        .transpose()?;
    let body = input
        .body
        .as_deref()
        .map(|b| validate_text("body", b, 2000))
        .transpose()?;
    sqlx::query(
        "UPDATE announcements SET title = COALESCE(?, title), body = COALESCE(?, body), updated_at = ? \
         WHERE id = ?",
    )
    .bind(title)
    .bind(body)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    load(pool, id, user_id).await
}

pub async fn delete(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<()> {
    let existing = find_one(pool, id, user_id).await?;
    if existing.author_id != user_id {
        ensure_manager(pool, &existing.household_id, user_id).await?;
    }
    sqlx::query("DELETE FROM announcements WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_pinned(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    pinned: Option<bool>,
) -> AppResult<Announcement> {
    let existing = find_one(pool, id, user_id).await?;
    ensure_manager(pool, &existing.household_id, user_id).await?;
    let pinned = pinned.unwrap_or(!existing.is_pinned);
    sqlx::query("UPDATE announcements SET is_pinned = ?, updated_at = ? WHERE id = ?")
        .bind(pinned)
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    load(pool, id, user_id).await
}

/// Add the caller's reaction, or remove it if it is already there.
pub async fn toggle_reaction(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    emoji: &str,
) -> AppResult<Announcement> {
    let emoji = validate_emoji(emoji)?;
    find_one(pool, id, user_id).await?;
    let removed = sqlx::query(
        "DELETE FROM announcement_reactions WHERE announcement_id = ? AND user_id = ? AND emoji = ?",
    )
    .bind(id)
    .bind(user_id)
    .bind(&emoji)
    .execute(pool)
    .await?
    .rows_affected();
    if removed == 0 {
        sqlx::query(
            "INSERT INTO announcement_reactions (announcement_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(&emoji)
        .bind(now_ms())
        .execute(pool)
        .await?;
    }
    load(pool, id, user_id).await
}

pub async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateAnnouncementInput>,
) -> AppResult<(StatusCode, Json<Announcement>)> {
    let announcement = create(&state.pool, &auth, input).await?;
    Ok((StatusCode::CREATED, Json(announcement)))
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<HouseholdQuery>,
) -> AppResult<Json<Vec<Announcement>>> {
    Ok(Json(list(&state.pool, &query.household_id, &auth.id).await?))
}

pub async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<UpdateAnnouncementInput>,
) -> AppResult<Json<Announcement>> {
    Ok(Json(update(&state.pool, &id, &auth.id, input).await?))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<StatusCode> {
    delete(&state.pool, &id, &auth.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pin_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    body: Option<ApiJson<PinInput>>,
) -> AppResult<Json<Announcement>> {
    let pinned = body.and_then(|ApiJson(input)| input.is_pinned);
    Ok(Json(set_pinned(&state.pool, &id, &auth.id, pinned).await?))
}

pub async fn reaction_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<ReactionInput>,
) -> AppResult<Json<Announcement>> {
    Ok(Json(
        toggle_reaction(&state.pool, &id, &auth.id, &input.emoji).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_must_be_a_single_token() {
        assert_eq!(validate_emoji(" 🎉 ").unwrap(), "🎉");
        assert!(validate_emoji("").is_err());
        assert!(validate_emoji("a b").is_err());
    }

    #[test]
    fn text_limits_are_enforced() {
        assert!(validate_text("title", &"x".repeat(101), 100).is_err());
        assert_eq!(validate_text("body", " hi ", 2000).unwrap(), "hi");
    }
}
