use axum::extract::State;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    auth::AuthUser,
    gamification::{self, LevelProgress},
    state::AppState,
    time::now_ms,
    util::{ApiJson, ApiPath},
    AppError, AppResult,
};
use axum::Json;

pub const USER_COLUMNS: &str = "id, email, username, display_name, avatar, level, xp, gold, gems, \
     health, max_health, streak, longest_streak, last_active_at, tasks_completed, created_at, updated_at";

/// A user together with their game state. The password hash never leaves the database layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub level: i64,
    pub xp: i64,
    pub gold: i64,
    pub gems: i64,
    pub health: i64,
    pub max_health: i64,
    pub streak: i64,
    pub longest_streak: i64,
    pub last_active_at: Option<i64>,
    pub tasks_completed: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&SqliteRow> for User {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            username: row.try_get("username")?,
            display_name: row.try_get("display_name")?,
            avatar: row.try_get("avatar")?,
            level: row.try_get("level")?,
            xp: row.try_get("xp")?,
            gold: row.try_get("gold")?,
            gems: row.try_get("gems")?,
            health: row.try_get("health")?,
            max_health: row.try_get("max_health")?,
            streak: row.try_get("streak")?,
            longest_streak: row.try_get("longest_streak")?,
            last_active_at: row.try_get("last_active_at")?,
            tasks_completed: row.try_get("tasks_completed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Profile as seen by other household members.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub level: i64,
    pub xp: i64,
    pub streak: i64,
    pub tasks_completed: i64,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
            avatar: user.avatar,
            level: user.level,
            xp: user.xp,
            streak: user.streak,
            tasks_completed: user.tasks_completed,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileInput {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

pub async fn get_user(pool: &SqlitePool, id: &str) -> AppResult<User> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            AppError::not_found("USER", "User not found").with_context("id", id.to_string())
        })?;
    User::try_from(&row)
}

pub async fn update_profile(
    pool: &SqlitePool,
    user_id: &str,
    input: UpdateProfileInput,
) -> AppResult<User> {
    if let Some(name) = &input.display_name {
        let len = name.trim().chars().count();
        if len == 0 || len > 50 {
            return Err(AppError::validation(
                "displayName",
                "Display name must be between 1 and 50 characters.",
            ));
        }
    }
    if let Some(avatar) = &input.avatar {
        if avatar.chars().count() > 500 {
            return Err(AppError::validation(
                "avatar",
                "Avatar reference may be at most 500 characters.",
            ));
        }
    }

    sqlx::query(
        "UPDATE users SET display_name = COALESCE(?, display_name), \
         avatar = COALESCE(?, avatar), updated_at = ? WHERE id = ?",
    )
    .bind(input.display_name.as_deref().map(str::trim))
    .bind(input.avatar.as_deref())
    .bind(now_ms())
    .bind(user_id)
    .execute(pool)
    .await?;

    get_user(pool, user_id).await
}

pub async fn level_progress(pool: &SqlitePool, user_id: &str) -> AppResult<LevelProgress> {
    let user = get_user(pool, user_id).await?;
    Ok(gamification::level_progress(
        user.xp,
        user.streak,
        user.longest_streak,
    ))
}

/// Whether the two users are members of at least one common household.
pub async fn share_household(pool: &SqlitePool, a: &str, b: &str) -> AppResult<bool> {
    let shared: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM household_members m1 \
         JOIN household_members m2 ON m1.household_id = m2.household_id \
         WHERE m1.user_id = ? AND m2.user_id = ? LIMIT 1",
    )
    .bind(a)
    .bind(b)
    .fetch_optional(pool)
    .await?;
    Ok(shared.is_some())
}

pub async fn public_profile(
    pool: &SqlitePool,
    viewer_id: &str,
    target_id: &str,
) -> AppResult<PublicUser> {
    let user = get_user(pool, target_id).await?;
    if viewer_id != target_id && !share_household(pool, viewer_id, target_id).await? {
        return Err(AppError::forbidden(
            "USER",
            "You can only view members of your households.",
        ));
    }
    Ok(user.into())
}

pub async fn me_handler(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<User>> {
    Ok(Json(get_user(&state.pool, &auth.id).await?))
}

pub async fn update_me_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<UpdateProfileInput>,
) -> AppResult<Json<User>> {
    Ok(Json(update_profile(&state.pool, &auth.id, input).await?))
}

pub async fn progress_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<LevelProgress>> {
    Ok(Json(level_progress(&state.pool, &auth.id).await?))
}

pub async fn get_user_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<PublicUser>> {
    Ok(Json(public_profile(&state.pool, &auth.id, &id).await?))
}
