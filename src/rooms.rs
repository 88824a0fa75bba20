use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    auth::AuthUser,
    categories::HouseholdQuery,
    households::ensure_member,
    id::new_uuid_v7,
    logging::LogScope,
    state::AppState,
    time::now_ms,
    util::{ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub household_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub xp: i64,
    pub level: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&SqliteRow> for Room {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            name: row.try_get("name")?,
            icon: row.try_get("icon")?,
            color: row.try_get("color")?,
            xp: row.try_get("xp")?,
            level: row.try_get("level")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomInput {
    pub household_id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > 50 {
        return Err(AppError::validation(
            "name",
            "Room names must be between 1 and 50 characters.",
        ));
    }
    Ok(trimmed.to_string())
}

/// Load a room without any membership check.
pub async fn load(pool: &SqlitePool, id: &str) -> AppResult<Room> {
    let row = sqlx::query("SELECT * FROM rooms WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("ROOM", "Room not found").with_context("id", id.to_string()))?;
    Room::try_from(&row)
}

pub async fn create(pool: &SqlitePool, user_id: &str, input: CreateRoomInput) -> AppResult<Room> {
    ensure_member(pool, &input.household_id, user_id).await?;
    let name = validate_name(&input.name)?;
    let id = new_uuid_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO rooms (id, household_id, name, icon, color, xp, level, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, 1, ?, ?)",
    )
    .bind(&id)
    .bind(&input.household_id)
    .bind(&name)
    .bind(&input.icon)
    .bind(&input.color)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    load(pool, &id).await
}

pub async fn list_by_household(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Vec<Room>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query("SELECT * FROM rooms WHERE household_id = ? ORDER BY name COLLATE NOCASE, id")
        .bind(household_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(Room::try_from).collect()
}

pub async fn find_one(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Room> {
    let room = load(pool, id).await?;
    ensure_member(pool, &room.household_id, user_id).await?;
    Ok(room)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    input: UpdateRoomInput,
) -> AppResult<Room> {
    find_one(pool, id, user_id).await?;
    let name = input.name.as_deref().map(validate_name).transpose()?;
    sqlx::query(
        "UPDATE rooms SET name = COALESCE(?, name), icon = COALESCE(?, icon), \
         color = COALESCE(?, color), updated_at = ? WHERE id = ?",
    )
    .bind(name)
    .bind(&input.icon)
    .bind(&input.color)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    load(pool, id).await
}

pub async fn delete(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<()> {
    let room = find_one(pool, id, user_id).await?;
    let scope = LogScope::new("rooms", "delete", Some(&room.household_id), Some(user_id));
    let result = sqlx::query("DELETE FROM rooms WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::from);
    scope.finish(result, |_| json!({ "room_id": id }))
}

pub async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateRoomInput>,
) -> AppResult<(StatusCode, Json<Room>)> {
    let room = create(&state.pool, &auth.id, input).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<HouseholdQuery>,
) -> AppResult<Json<Vec<Room>>> {
    Ok(Json(
        list_by_household(&state.pool, &query.household_id, &auth.id).await?,
    ))
}

pub async fn get_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Room>> {
    Ok(Json(find_one(&state.pool, &id, &auth.id).await?))
}

pub async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<UpdateRoomInput>,
) -> AppResult<Json<Room>> {
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
