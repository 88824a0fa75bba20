use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::{
    auth::AuthUser,
    gamification::{self, TaskCompletionResult},
    households::{ensure_member, membership_role},
    id::new_uuid_v7,
    logging::LogScope,
    recurrence::{self, Frequency},
    rooms,
    state::AppState,
    time::{ensure_schedulable, now_ms},
    util::{nullable, ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

pub const TASK_INACTIVE: &str = "TASK/INACTIVE";
pub const HOUSEHOLD_MISMATCH: &str = "VALIDATION/HOUSEHOLD_MISMATCH";
pub const MAX_ESTIMATED_MINUTES: i64 = 1440;
const DEFAULT_OCCURRENCES: usize = 5;
const MAX_OCCURRENCES: usize = 50;

/// A chore template. Completing it feeds the gamification flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub household_id: String,
    pub room_id: Option<String>,
    pub category_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub difficulty: i64,
    pub estimated_minutes: i64,
    pub frequency: Frequency,
    pub interval_days: Option<i64>,
    pub assigned_to: Option<String>,
    pub due_at: Option<i64>,
    pub last_completed_at: Option<i64>,
    pub completion_count: i64,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<&SqliteRow> for Task {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let frequency: String = row.try_get("frequency")?;
        Ok(Self {
            id: row.try_get("id")?,
            household_id: row.try_get("household_id")?,
            room_id: row.try_get("room_id")?,
            category_id: row.try_get("category_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            difficulty: row.try_get("difficulty")?,
            estimated_minutes: row.try_get("estimated_minutes")?,
            frequency: frequency.parse()?,
            interval_days: row.try_get("interval_days")?,
            assigned_to: row.try_get("assigned_to")?,
            due_at: row.try_get("due_at")?,
            last_completed_at: row.try_get("last_completed_at")?,
            completion_count: row.try_get("completion_count")?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub household_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub difficulty: Option<i64>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default)]
    pub interval_days: Option<i64>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub room_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub category_id: Option<Option<String>>,
    #[serde(default)]
    pub difficulty: Option<i64>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub interval_days: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub assigned_to: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub due_at: Option<Option<i64>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    pub household_id: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DueTasksQuery {
    pub household_id: String,
    #[serde(default)]
    pub before: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OccurrencesQuery {
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Occurrences {
    pub task_id: String,
    pub frequency: Frequency,
    pub dates: Vec<i64>,
}

/// What completing a task did to its schedule.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskAdvance {
    pub task_id: String,
    pub next_due_at: Option<i64>,
    pub archived: bool,
}

fn validate_title(title: &str) -> AppResult<String> {
    let trimmed = title.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > 100 {
        return Err(AppError::validation(
            "title",
            "Task titles must be between 1 and 100 characters.",
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_difficulty(difficulty: i64) -> AppResult<()> {
    if (1..=5).contains(&difficulty) {
        Ok(())
    } else {
        Err(AppError::validation("difficulty", "Difficulty must be between 1 and 5.")
            .with_context("difficulty", difficulty.to_string()))
    }
}

pub fn validate_minutes(minutes: i64) -> AppResult<()> {
    if (0..=MAX_ESTIMATED_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(AppError::validation(
            "estimatedMinutes",
            "Estimated minutes must be between 0 and 1440.",
        )
        .with_context("estimated_minutes", minutes.to_string()))
    }
}

fn mismatch(field: &str, id: &str) -> AppError {
    AppError::new(
        HOUSEHOLD_MISMATCH,
        format!("The {field} belongs to a different household."),
    )
    .with_context("field", field.to_string())
    .with_context("id", id.to_string())
}

/// Room, category and assignee must all belong to `household_id`.
async fn check_links(
    pool: &SqlitePool,
    household_id: &str,
    room_id: Option<&str>,
    category_id: Option<&str>,
    assigned_to: Option<&str>,
) -> AppResult<()> {
    if let Some(room_id) = room_id {
        if rooms::load(pool, room_id).await?.household_id != household_id {
            return Err(mismatch("room", room_id));
        }
    }
    if let Some(category_id) = category_id {
        let row: Option<String> =
            sqlx::query_scalar("SELECT household_id FROM task_categories WHERE id = ?")
                .bind(category_id)
                .fetch_optional(pool)
                .await?;
        match row {
            None => {
                return Err(AppError::not_found("CATEGORY", "Category not found")
                    .with_context("id", category_id.to_string()))
            }
            Some(owner) if owner != household_id => return Err(mismatch("category", category_id)),
            Some(_) => {}
        }
    }
    if let Some(user_id) = assigned_to {
        if membership_role(pool, household_id, user_id).await?.is_none() {
            return Err(AppError::new(
                "VALIDATION/ASSIGNEE_NOT_MEMBER",
                "Tasks can only be assigned to household members.",
            )
            .with_context("user_id", user_id.to_string()));
        }
    }
    Ok(())
}

/// Load a task without any membership check.
pub async fn load(pool: &SqlitePool, id: &str) -> AppResult<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("TASK", "Task not found").with_context("id", id.to_string()))?;
    Task::try_from(&row)
}

pub async fn create(pool: &SqlitePool, user_id: &str, input: CreateTaskInput) -> AppResult<Task> {
    ensure_member(pool, &input.household_id, user_id).await?;
    let title = validate_title(&input.title)?;
    let difficulty = input.difficulty.unwrap_or(1);
    let minutes = input.estimated_minutes.unwrap_or(0);
    validate_difficulty(difficulty)?;
    validate_minutes(minutes)?;
    recurrence::validate(input.frequency, input.interval_days)?;
    if let Some(due_at) = input.due_at {
        ensure_schedulable("dueAt", due_at)?;
    }
    check_links(
        pool,
        &input.household_id,
        input.room_id.as_deref(),
        input.category_id.as_deref(),
        input.assigned_to.as_deref(),
    )
    .await?;

    let id = new_uuid_v7();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO tasks (id, household_id, room_id, category_id, title, description, difficulty, \
         estimated_minutes, frequency, interval_days, assigned_to, due_at, last_completed_at, \
         completion_count, is_active, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, 1, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&input.household_id)
    .bind(&input.room_id)
    .bind(&input.category_id)
    .bind(&title)
    .bind(&input.description)
    .bind(difficulty)
    .bind(minutes)
    .bind(input.frequency.as_str())
    .bind(input.interval_days)
    .bind(&input.assigned_to)
    .bind(input.due_at)
    .bind(user_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    load(pool, &id).await
}

pub async fn list(pool: &SqlitePool, user_id: &str, query: &ListTasksQuery) -> AppResult<Vec<Task>> {
    ensure_member(pool, &query.household_id, user_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE household_id = ? \
           AND (? IS NULL OR room_id = ?) \
           AND (? IS NULL OR category_id = ?) \
           AND (? = 1 OR is_active = 1) \
         ORDER BY due_at IS NULL, due_at, created_at, id",
    )
    .bind(&query.household_id)
    .bind(&query.room_id)
    .bind(&query.room_id)
    .bind(&query.category_id)
    .bind(&query.category_id)
    .bind(i64::from(query.include_inactive))
    .fetch_all(pool)
    .await?;
    rows.iter().map(Task::try_from).collect()
}

/// Active tasks due at or before `before` (defaults to now), earliest first.
pub async fn due(pool: &SqlitePool, user_id: &str, query: &DueTasksQuery) -> AppResult<Vec<Task>> {
    ensure_member(pool, &query.household_id, user_id).await?;
    let before = query.before.unwrap_or_else(now_ms);
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE household_id = ? AND is_active = 1 \
           AND due_at IS NOT NULL AND due_at <= ? \
         ORDER BY due_at, id",
    )
    .bind(&query.household_id)
    .bind(before)
    .fetch_all(pool)
    .await?;
    rows.iter().map(Task::try_from).collect()
}

pub async fn find_one(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<Task> {
    let task = load(pool, id).await?;
    ensure_member(pool, &task.household_id, user_id).await?;
    Ok(task)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    input: UpdateTaskInput,
) -> AppResult<Task> {
    let existing = find_one(pool, id, user_id).await?;
    let title = input.title.as_deref().map(validate_title).transpose()?;
    if let Some(difficulty) = input.difficulty {
        validate_difficulty(difficulty)?;
    }
    if let Some(minutes) = input.estimated_minutes {
        validate_minutes(minutes)?;
    }
    let frequency = input.frequency.unwrap_or(existing.frequency);
    let interval_days = match (input.frequency, input.interval_days) {
        (_, Some(days)) => Some(days),
        (Some(Frequency::Custom), None) | (None, None) => existing.interval_days,
        (Some(_), None) => None,
    };
    recurrence::validate(frequency, interval_days)?;
    if let Some(Some(due_at)) = input.due_at {
        ensure_schedulable("dueAt", due_at)?;
    }
    // Links are checked only when set; `null` clears them.
    check_links(
        pool,
        &existing.household_id,
        input.room_id.clone().flatten().as_deref(),
        input.category_id.clone().flatten().as_deref(),
        input.assigned_to.clone().flatten().as_deref(),
    )
    .await?;

    sqlx::query(
        "UPDATE tasks SET \
           title = COALESCE(?, title), \
           description = CASE WHEN ? THEN ? ELSE description END, \
           room_id = CASE WHEN ? THEN ? ELSE room_id END, \
           category_id = CASE WHEN ? THEN ? ELSE category_id END, \
           difficulty = COALESCE(?, difficulty), \
           estimated_minutes = COALESCE(?, estimated_minutes), \
           frequency = ?, \
           interval_days = ?, \
           assigned_to = CASE WHEN ? THEN ? ELSE assigned_to END, \
           due_at = CASE WHEN ? THEN ? ELSE due_at END, \
           is_active = COALESCE(?, is_active), \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(title)
    .bind(input.description.is_some())
    .bind(input.description.flatten())
    .bind(input.room_id.is_some())
    .bind(input.room_id.flatten())
    .bind(input.category_id.is_some())
    .bind(input.category_id.flatten())
    .bind(input.difficulty)
    .bind(input.estimated_minutes)
    .bind(frequency.as_str())
    .bind(interval_days)
    .bind(input.assigned_to.is_some())
    .bind(input.assigned_to.flatten())
    .bind(input.due_at.is_some())
    .bind(input.due_at.flatten())
    .bind(input.is_active.map(i64::from))
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    load(pool, id).await
}

pub async fn delete(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<()> {
    let task = find_one(pool, id, user_id).await?;
    let scope = LogScope::new("tasks", "delete", Some(&task.household_id), Some(user_id));
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(AppError::from);
    scope.finish(result, |_| json!({ "task_id": id }))
}

/// Schedule after a completion at `completed_at`: one-off tasks archive,
/// recurring ones move to the first occurrence after both the completion and
/// the current due date.
pub fn plan_advance(task: &Task, completed_at: i64) -> AppResult<TaskAdvance> {
    if !task.frequency.is_recurring() {
        return Ok(TaskAdvance {
            task_id: task.id.clone(),
            next_due_at: None,
            archived: true,
        });
    }
    let anchor = task.due_at.unwrap_or(task.created_at);
    let after = task.due_at.map_or(completed_at, |due| due.max(completed_at));
    let next_due_at = recurrence::next_due(task.frequency, task.interval_days, anchor, after)?;
    Ok(TaskAdvance {
        task_id: task.id.clone(),
        next_due_at,
        archived: false,
    })
}

/// Apply [`plan_advance`] inside an open transaction.
pub async fn advance_in_tx(
    conn: &mut SqliteConnection,
    task: &Task,
    completed_at: i64,
) -> AppResult<TaskAdvance> {
    let advance = plan_advance(task, completed_at)?;
    sqlx::query(
        "UPDATE tasks SET last_completed_at = ?, completion_count = completion_count + 1, \
         due_at = CASE WHEN ? THEN due_at ELSE ? END, \
         is_active = CASE WHEN ? THEN 0 ELSE is_active END, updated_at = ? \
         WHERE id = ?",
    )
    .bind(completed_at)
    .bind(advance.archived)
    .bind(advance.next_due_at)
    .bind(advance.archived)
    .bind(completed_at)
    .bind(&task.id)
    .execute(&mut *conn)
    .await?;
    debug!(
        target: "kamehouse",
        event = "task_advanced",
        task_id = %task.id,
        next_due_at = ?advance.next_due_at,
        archived = advance.archived
    );
    Ok(advance)
}

pub async fn occurrences(
    pool: &SqlitePool,
    id: &str,
    user_id: &str,
    count: Option<usize>,
) -> AppResult<Occurrences> {
    let task = find_one(pool, id, user_id).await?;
    let count = count.unwrap_or(DEFAULT_OCCURRENCES);
    if !(1..=MAX_OCCURRENCES).contains(&count) {
        return Err(AppError::validation("count", "Count must be between 1 and 50."));
    }
    let anchor = task.due_at.unwrap_or(task.created_at);
    // The current due date is itself the first upcoming occurrence.
    let mut dates = Vec::with_capacity(count);
    if let Some(due) = task.due_at.filter(|_| task.is_active) {
        dates.push(due);
    }
    if task.is_active && dates.len() < count {
        let after = task.due_at.unwrap_or_else(now_ms);
        dates.extend(recurrence::occurrences_after(
            task.frequency,
            task.interval_days,
            anchor,
            after,
            count - dates.len(),
        )?);
    }
    Ok(Occurrences {
        task_id: task.id,
        frequency: task.frequency,
        dates,
    })
}

/// Complete a task in its own room through the gamification flow.
pub async fn complete(pool: &SqlitePool, id: &str, user_id: &str) -> AppResult<TaskCompletionResult> {
    let task = find_one(pool, id, user_id).await?;
    let room_id = task.room_id.clone().ok_or_else(|| {
        AppError::validation("roomId", "Assign the task to a room before completing it.")
            .with_context("task_id", task.id.clone())
    })?;
    gamification::complete_task(
        pool,
        user_id,
        &room_id,
        gamification::TaskCompleteInput {
            task_id: Some(task.id),
            difficulty: None,
            estimated_minutes: None,
        },
    )
    .await
}

pub async fn create_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(input): ApiJson<CreateTaskInput>,
) -> AppResult<(StatusCode, Json<Task>)> {
    let task = create(&state.pool, &auth.id, input).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<ListTasksQuery>,
) -> AppResult<Json<Vec<Task>>> {
    Ok(Json(list(&state.pool, &auth.id, &query).await?))
}

pub async fn due_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<DueTasksQuery>,
) -> AppResult<Json<Vec<Task>>> {
    Ok(Json(due(&state.pool, &auth.id, &query).await?))
}

pub async fn get_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<Task>> {
    Ok(Json(find_one(&state.pool, &id, &auth.id).await?))
}

pub async fn update_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiJson(input): ApiJson<UpdateTaskInput>,
) -> AppResult<Json<Task>> {
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

pub async fn complete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
) -> AppResult<Json<TaskCompletionResult>> {
    Ok(Json(complete(&state.pool, &id, &auth.id).await?))
}

pub async fn occurrences_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<OccurrencesQuery>,
) -> AppResult<Json<Occurrences>> {
    Ok(Json(occurrences(&state.pool, &id, &auth.id, query.count).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(frequency: Frequency, due_at: Option<i64>) -> Task {
        Task {
            id: "t1".into(),
            household_id: "h1".into(),
            room_id: None,
            category_id: None,
            title: "Dishes".into(),
            description: None,
            difficulty: 2,
            estimated_minutes: 15,
            frequency,
            interval_days: None,
            assigned_to: None,
            due_at,
            last_completed_at: None,
            completion_count: 0,
            is_active: true,
            created_by: "u1".into(),
            created_at: BASE,
            updated_at: BASE,
        }
    }

    const DAY: i64 = 86_400_000;
    // 2026-01-01T00:00:00Z
    const BASE: i64 = 1_767_225_600_000;

    #[test]
    fn once_tasks_archive_on_completion() {
        let advance = plan_advance(&task(Frequency::Once, Some(BASE + DAY)), BASE + 2 * DAY).unwrap();
        assert!(advance.archived);
        assert_eq!(advance.next_due_at, None);
    }

    #[test]
    fn overdue_daily_task_moves_past_completion() {
        let advance = plan_advance(&task(Frequency::Daily, Some(BASE + DAY)), BASE + 3 * DAY + 10).unwrap();
        assert!(!advance.archived);
        assert_eq!(advance.next_due_at, Some(BASE + 4 * DAY));
    }

    #[test]
    fn early_completion_skips_to_following_cycle() {
        let advance = plan_advance(&task(Frequency::Weekly, Some(BASE + 7 * DAY)), BASE + DAY).unwrap();
        assert_eq!(advance.next_due_at, Some(BASE + 14 * DAY));
    }

    #[test]
    fn out_of_range_schedule_is_an_error_not_a_panic() {
        let err = plan_advance(&task(Frequency::Daily, Some(i64::MIN)), BASE).unwrap_err();
        assert_eq!(err.code(), "VALIDATION/INVALID");
    }

    #[test]
    fn bounds_are_enforced() {
        assert!(validate_difficulty(0).is_err());
        assert!(validate_difficulty(5).is_ok());
        assert!(validate_minutes(1441).is_err());
        assert!(validate_minutes(0).is_ok());
        assert!(validate_title("  ").is_err());
    }
}
