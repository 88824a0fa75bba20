use std::collections::HashSet;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::{
    auth::AuthUser,
    db::run_in_tx,
    households::ensure_member,
    id::new_uuid_v7,
    logging::LogScope,
    state::AppState,
    time::now_ms,
    util::{nullable, ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

static COLOR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("valid color regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub household_id: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub order: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&SqliteRow> for Category {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            icon: row.try_get("icon")?,
            color: row.try_get("color")?,
            order: row.try_get("sort_order")?,
            is_active: row
                .try_get::<i64, _>("is_active")
                .map(|value| value != 0)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryInput {
    pub household_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCategoryInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub icon: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub color: Option<Option<String>>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderInput {
    pub category_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdQuery {
    pub household_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category_id: String,
    pub is_active: bool,
    pub active_tasks: i64,
    pub total_completions: i64,
    pub total_xp_earned: i64,
    pub last_completed_at: Option<i64>,
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > 50 {
        return Err(AppError::validation(
            "name",
            "Category names must be between 1 and 50 characters.",
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_color(color: Option<&str>) -> AppResult<()> {
    match color {
        Some(value) if !COLOR_PATTERN.is_match(value) => Err(AppError::validation(
            "color",
            "Colors must be hex values like #A1B2C3.",
        )
        .with_context("color", value.to_string())),
        _ => Ok(()),
    }
}

fn not_found(id: &str) -> AppError {
    AppError::not_found("CATEGORY", "Category not found").with_context("id", id.to_string())
}

async fn load(pool: &SqlitePool, id: &str) -> AppResult<Category> {
    let row = sqlx::query("SELECT * FROM task_categories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| not_found(id))?;
    Category::try_from(&row)
}

pub async fn create(
    pool: &SqlitePool,
    user_id: &str,
    input: CreateCategoryInput,
) -> AppResult<Category> {
    ensure_member(pool, &input.household_id, user_id).await?;
    let name = validate_name(&input.name)?;
    validate_color(input.color.as_deref())?;

    let order = match input.order {
        Some(order) => order,
        None => {
            let max: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(sort_order) FROM task_categories WHERE household_id = ?",
            )
            .bind(&input.household_id)
            .fetch_one(pool)
            .await?;
            max.map_or(0, |value| value + 1)
        }
    };

    let id = new_uuid_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO task_categories \
         (id, household_id, name, description, icon, color, sort_order, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(&input.household_id)
    .bind(&name)
    .bind(&input.description)
    .bind(&input.icon)
    .bind(&input.color)
    .bind(order)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "create"))?;

    load(pool, &id).await
}

/// Active categories of a household in display order.
pub async fn list_by_household(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
) -> AppResult<Vec<Category>> {
    ensure_member(pool, household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM task_categories WHERE household_id = ? AND is_active = 1 \
         ORDER BY sort_order, created_at, id",
    )
    .bind(household_id)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "list")
            .with_context("household_id", household_id.to_string())
    })?;
    rows.iter().map(Category::try_from).collect()
}

/// Fetch one category by id. Archived categories are still returned.
pub async fn find_one(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Category> {
    let category = load(pool, id).await?;
    ensure_member(pool, &category.household_id, user_id).await?;
    Ok(category)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    input: UpdateCategoryInput,
) -> AppResult<Category> {
    let existing = find_one(pool, id, user_id).await?;
    let name = input.name.as_deref().map(validate_name).transpose()?;
    validate_color(input.color.clone().flatten().as_deref())?;

    sqlx::query(
        "UPDATE task_categories SET \
           name = COALESCE(?, name), \
           description = CASE WHEN ? THEN ? ELSE description END, \
           icon = CASE WHEN ? THEN ? ELSE icon END, \
           color = CASE WHEN ? THEN ? ELSE color END, \
           sort_order = COALESCE(?, sort_order), \
           is_active = COALESCE(?, is_active), \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(name)
    .bind(input.description.is_some())
    .bind(input.description.flatten())
    .bind(input.icon.is_some())
    .bind(input.icon.flatten())
    .bind(input.color.is_some())
    .bind(input.color.flatten())
    .bind(input.order)
    .bind(input.is_active.map(i64::from))
    .bind(now_ms())
    .bind(&existing.id)
    .execute(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "update"))?;

    load(pool, id).await
}

/// Archive a category. Tasks keep their reference to it.
pub async fn soft_delete(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<()> {
    let existing = find_one(pool, id, user_id).await?;
    let scope = LogScope::new(
        "categories",
        "soft_delete",
        Some(&existing.household_id),
        Some(user_id),
    );
    let result = sqlx::query("UPDATE task_categories SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::from);
    scope.finish(result, |_| json!({ "category_id": id }))
}

/// Rewrite the order of the given categories to their position in `ids`.
pub async fn reorder(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
    ids: Vec<String>,
) -> AppResult<Vec<Category>> {
    ensure_member(pool, household_id, user_id).await?;
    let mut seen = HashSet::new();
    if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
        return Err(AppError::validation("categoryIds", "Category ids must be unique.")
            .with_context("id", dup.clone()));
    }

    let scope = LogScope::new("categories", "reorder", Some(household_id), Some(user_id));
    let household = household_id.to_string();
    let count = ids.len();
    let result = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            let now = now_ms();
            for (index, id) in ids.iter().enumerate() {
                let res = sqlx::query(
                    "UPDATE task_categories SET sort_order = ?, updated_at = ? \
                     WHERE id = ? AND household_id = ?",
                )
                .bind(index as i64)
                .bind(now)
                .bind(id)
                .bind(&household)
                .execute(&mut **tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(not_found(id).with_context("household_id", household.clone()));
                }
            }
            Ok::<_, AppError>(())
        })
    })
    .await;
    scope.finish(result, |_| json!({ "count": count }))?;

    list_by_household(pool, household_id, user_id).await
}

pub async fn stats(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<CategoryStats> {
    let category = find_one(pool, id, user_id).await?;
    let active_tasks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE category_id = ? AND is_active = 1",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, COALESCE(SUM(xp_earned), 0) AS xp, MAX(completed_at) AS last \
         FROM task_completions WHERE category_id = ?",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(CategoryStats {
        category_id: category.id,
        is_active: category.is_active,
        active_tasks,
        total_completions: row.try_get("total")?,
        total_xp_earned: row.try_get("xp")?,
        last_completed_at: row.try_get("last")?,
    })
}

pub async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateCategoryInput>,
) -> AppResult<(StatusCode, Json<Category>)> {
    let category = create(&state.pool, &auth.id, input).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<HouseholdQuery>,
) -> AppResult<Json<Vec<Category>>> {
    Ok(Json(
        list_by_household(&state.pool, &query.household_id, &auth.id).await?,
    ))
}

pub async fn get_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Category>> {
    Ok(Json(find_one(&state.pool, &id, &auth.id).await?))
}

pub async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<UpdateCategoryInput>,
) -> AppResult<Json<Category>> {
    Ok(Json(update(&state.pool, &id, &auth.id, input).await?))
}

pub async fn delete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<StatusCode> {
    soft_delete(&state.pool, &id, &auth.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reorder_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(household_id): ApiPath<String>,
    ApiJson(input): ApiJson<ReorderInput>,
) -> AppResult<Json<Vec<Category>>> {
    Ok(Json(
        reorder(&state.pool, &household_id, &auth.id, input.category_ids).await?,
    ))
}

pub async fn stats_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<CategoryStats>> {
    Ok(Json(stats(&state.pool, &id, &auth.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(validate_name("  Kitchen ").unwrap(), "Kitchen");
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn colors_must_be_hex() {
        assert!(validate_color(None).is_ok());
        assert!(validate_color(Some("#aabbcc")).is_ok());
        let err = validate_color(Some("red")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION/INVALID");
    }
}
