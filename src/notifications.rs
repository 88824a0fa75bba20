use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqliteExecutor, SqlitePool};

use crate::{
    auth::AuthUser,
    id::new_uuid_v7,
    state::AppState,
    time::now_ms,
    util::{ApiPath, ApiQuery},
    AppError, AppResult,
};

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

pub mod kinds {
    pub const LEVEL_UP: &str = "level_up";
    pub const ROOM_LEVEL_UP: &str = "room_level_up";
    pub const ACHIEVEMENT: &str = "achievement";
    pub const MEMBER_JOINED: &str = "member_joined";
    pub const ANNOUNCEMENT: &str = "announcement";
    pub const FAVOR: &str = "favor";
    pub const LETS_PAYMENT: &str = "lets_payment";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub household_id: Option<String>,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: i64,
}

impl TryFrom<&SqliteRow> for Notification {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            household_id: row.try_get("household_id")?,
            kind: row.try_get("kind")?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            link: row.try_get("link")?,
            is_read: row.try_get::<i64, _>("is_read")? != 0,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub household_id: Option<String>,
    pub kind: &'static str,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub count: i64,
}

/// Insert one notification through any executor (pool or open transaction).
pub async fn push<'e, E>(executor: E, notification: NewNotification) -> AppResult<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO notifications (id, user_id, household_id, kind, title, message, link, is_read, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(new_uuid_v7())
    .bind(&notification.user_id)
    .bind(&notification.household_id)
    .bind(notification.kind)
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(&notification.link)
    .bind(now_ms())
    .execute(executor)
    .await?;
    Ok(())
}

/// Notify every member of `household_id` except `except_user_id`, inside
/// the caller's transaction.
pub async fn notify_household(
    conn: &mut SqliteConnection,
    household_id: &str,
    except_user_id: &str,
    kind: &'static str,
    title: &str,
    message: &str,
    link: Option<&str>,
) -> AppResult<usize> {
    let recipients: Vec<String> = sqlx::query_scalar(
        "SELECT user_id FROM household_members WHERE household_id = ? AND user_id <> ?",
    )
    .bind(household_id)
    .bind(except_user_id)
    .fetch_all(&mut *conn)
    .await?;

    for user_id in &recipients {
        push(
            &mut *conn,
            NewNotification {
                user_id: user_id.clone(),
                household_id: Some(household_id.to_string()),
                kind,
                title: title.to_string(),
                message: message.to_string(),
                link: link.map(str::to_string),
            },
        )
        .await?;
    }
    Ok(recipients.len())
}

pub async fn list(
    pool: &SqlitePool,
    user_id: &str,
    query: &ListNotificationsQuery,
) -> AppResult<Vec<Notification>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let sql = if query.unread_only {
        "SELECT * FROM notifications WHERE user_id = ? AND is_read = 0 \
         ORDER BY created_at DESC, id DESC LIMIT ?"
    } else {
        "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
    };
    let rows = sqlx::query(sql)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(Notification::try_from).collect()
}

pub async fn unread_count(pool: &SqlitePool, user_id: &str) -> AppResult<UnreadCount> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(UnreadCount { count })
}

fn not_found(id: &str) -> AppError {
    AppError::not_found("NOTIFICATION", "Notification not found").with_context("id", id.to_string())
}

pub async fn mark_read(pool: &SqlitePool, user_id: &str, id: &str) -> AppResult<Notification> {
    let res = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(not_found(id));
    }
    let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Notification::try_from(&row)
}

pub async fn mark_all_read(pool: &SqlitePool, user_id: &str) -> AppResult<u64> {
    let res = sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete(pool: &SqlitePool, user_id: &str, id: &str) -> AppResult<()> {
    let res = sqlx::query("DELETE FROM notifications WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(not_found(id));
    }
    Ok(())
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<ListNotificationsQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    Ok(Json(list(&state.pool, &auth.id, &query).await?))
}

pub async fn unread_count_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<UnreadCount>> {
    Ok(Json(unread_count(&state.pool, &auth.id).await?))
}

pub async fn mark_read_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Notification>> {
    Ok(Json(mark_read(&state.pool, &auth.id, &id).await?))
}

pub async fn mark_all_read_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<serde_json::Value>> {
    let updated = mark_all_read(&state.pool, &auth.id).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<StatusCode> {
    delete(&state.pool, &auth.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
