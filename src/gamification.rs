//! Reward formulas, streaks, levels and the chore completion flow.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use serde_json::json;

use crate::{
    achievements::{self, Achievement, ProgressCounters},
    auth::AuthUser,
    db::run_in_tx,
    households::ensure_member,
    id::new_uuid_v7,
    logging::LogScope,
    notifications::{self, kinds, NewNotification},
    rooms,
    state::AppState,
    tasks::{self, TaskAdvance},
    time::{now_ms, utc_day},
    util::{ApiJson, ApiPath, ApiQuery},
    AppError, AppResult,
};

pub const XP_PER_LEVEL: i64 = 100;
const XP_PER_DIFFICULTY: i64 = 10;
const MIN_BASE_XP: i64 = 10;
const MIN_BASE_GOLD: i64 = 5;
const MINUTES_PER_GOLD: i64 = 3;
const STREAK_BONUS_PERCENT_PER_DAY: i64 = 5;
const MAX_STREAK_BONUS_PERCENT: i64 = 50;
const TOP_CONTRIBUTORS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRewards {
    pub base_xp: i64,
    pub base_gold: i64,
    pub streak_bonus: i64,
    pub total_xp: i64,
    pub total_gold: i64,
}

/// Rewards for one completion.
///
/// Base XP is `max(10, difficulty * 10)`, base gold `max(5, minutes / 3)`.
/// The streak adds 5% of base XP per day, capped at 50%, rounded down.
pub fn calculate_task_rewards(difficulty: i64, estimated_minutes: i64, streak: i64) -> TaskRewards {
    let base_xp = (difficulty * XP_PER_DIFFICULTY).max(MIN_BASE_XP);
    let base_gold = (estimated_minutes / MINUTES_PER_GOLD).max(MIN_BASE_GOLD);
    let bonus_percent = (streak.max(0) * STREAK_BONUS_PERCENT_PER_DAY).min(MAX_STREAK_BONUS_PERCENT);
    let streak_bonus = base_xp * bonus_percent / 100;
    TaskRewards {
        base_xp,
        base_gold,
        streak_bonus,
        total_xp: base_xp + streak_bonus,
        total_gold: base_gold,
    }
}

/// Level reached with `xp` cumulative experience. Users and rooms share the curve.
pub fn level_for_xp(xp: i64) -> i64 {
    xp.max(0) / XP_PER_LEVEL + 1
}

/// Cumulative XP at which `level` is completed.
pub fn required_xp(level: i64) -> i64 {
    level * XP_PER_LEVEL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelProgress {
    pub level: i64,
    pub xp: i64,
    pub xp_into_level: i64,
    pub xp_for_next_level: i64,
    pub xp_to_next_level: i64,
    pub progress_percent: i64,
    pub streak: i64,
    pub longest_streak: i64,
}

pub fn level_progress(xp: i64, streak: i64, longest_streak: i64) -> LevelProgress {
    let level = level_for_xp(xp);
    let level_start = required_xp(level - 1);
    let xp_into_level = xp.max(0) - level_start;
    let span = required_xp(level) - level_start;
    LevelProgress {
        level,
        xp,
        xp_into_level,
        xp_for_next_level: span,
        xp_to_next_level: required_xp(level) - xp.max(0),
        progress_percent: xp_into_level * 100 / span,
        streak,
        longest_streak,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakUpdate {
    pub previous: i64,
    pub streak: i64,
    pub longest_streak: i64,
}

/// Streak after activity at `now`. Activity on the UTC day after the last one
/// extends the streak, a second completion on the same day keeps it, anything
/// else starts over at 1.
pub fn next_streak(last_active_at: Option<i64>, streak: i64, longest_streak: i64, now: i64) -> StreakUpdate {
    let next = match (utc_day(now), last_active_at.and_then(utc_day)) {
        (Some(today), Some(day)) if day == today => streak.max(1),
        (Some(today), Some(day)) if today.pred_opt() == Some(day) => streak + 1,
        _ => 1,
    };
    StreakUpdate {
        previous: streak,
        streak: next,
        longest_streak: longest_streak.max(next),
    }
}

/// Apply [`next_streak`] to the stored user row.
pub async fn update_streak(conn: &mut SqliteConnection, user_id: &str, now: i64) -> AppResult<StreakUpdate> {
    let row = sqlx::query("SELECT streak, longest_streak, last_active_at FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("USER", "User not found").with_context("id", user_id.to_string()))?;
    let update = next_streak(
        row.try_get("last_active_at")?,
        row.try_get("streak")?,
        row.try_get("longest_streak")?,
        now,
    );
    sqlx::query("UPDATE users SET streak = ?, longest_streak = ?, last_active_at = ?, updated_at = ? WHERE id = ?")
        .bind(update.streak)
        .bind(update.longest_streak)
        .bind(now)
        .bind(now)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(update)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleteInput {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub difficulty: Option<i64>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelChange {
    pub xp: i64,
    pub previous_level: i64,
    pub level: i64,
    pub leveled_up: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletionResult {
    pub completion_id: String,
    pub rewards: TaskRewards,
    pub streak: StreakUpdate,
    pub user: LevelChange,
    pub room: LevelChange,
    pub achievements: Vec<&'static Achievement>,
    pub task: Option<TaskAdvance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    User,
    Room,
}

impl Track {
    fn table(self) -> &'static str {
        match self {
            Track::User => "users",
            Track::Room => "rooms",
        }
    }
}

/// Add the rewards to a user or room, recompute its level and report the change.
async fn grant(
    conn: &mut SqliteConnection,
    track: Track,
    id: &str,
    rewards: &TaskRewards,
    now: i64,
) -> AppResult<LevelChange> {
    let bump = match track {
        Track::User => sqlx::query(
            "UPDATE users SET xp = xp + ?, gold = gold + ?, tasks_completed = tasks_completed + 1, \
             updated_at = ? WHERE id = ?",
        )
        .bind(rewards.total_xp)
        .bind(rewards.total_gold),
        Track::Room => {
            sqlx::query("UPDATE rooms SET xp = xp + ?, updated_at = ? WHERE id = ?").bind(rewards.total_xp)
        }
    };
    bump.bind(now).bind(id).execute(&mut *conn).await?;

    let table = track.table();
    let row = sqlx::query(&format!("SELECT xp, level FROM {table} WHERE id = ?"))
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    let total: i64 = row.try_get("xp")?;
    let previous_level: i64 = row.try_get("level")?;
    let level = level_for_xp(total);
    if level != previous_level {
        sqlx::query(&format!("UPDATE {table} SET level = ? WHERE id = ?"))
            .bind(level)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(LevelChange {
        xp: total,
        previous_level,
        level,
        leveled_up: level > previous_level,
    })
}

/// Complete a chore in `room_id` on behalf of `user_id`.
///
/// Everything from the streak update to achievement unlocks happens in one
/// transaction.
pub async fn complete_task(
    pool: &SqlitePool,
    user_id: &str,
    room_id: &str,
    input: TaskCompleteInput,
) -> AppResult<TaskCompletionResult> {
    let room = rooms::load(pool, room_id).await?;
    ensure_member(pool, &room.household_id, user_id).await?;

    let task = match input.task_id.as_deref() {
        Some(task_id) => {
            let task = tasks::load(pool, task_id).await?;
            if task.household_id != room.household_id {
                return Err(AppError::new(
                    tasks::HOUSEHOLD_MISMATCH,
                    "The task belongs to a different household.",
                )
                .with_context("task_id", task.id.clone()));
            }
            if !task.is_active {
                return Err(AppError::new(tasks::TASK_INACTIVE, "This task is archived.")
                    .with_context("task_id", task.id.clone()));
            }
            Some(task)
        }
        None => None,
    };
    let difficulty = task
        .as_ref()
        .map(|t| t.difficulty)
        .or(input.difficulty)
        .unwrap_or(1);
    let minutes = task
        .as_ref()
        .map(|t| t.estimated_minutes)
        .or(input.estimated_minutes)
        .unwrap_or(0);
    tasks::validate_difficulty(difficulty)?;
    tasks::validate_minutes(minutes)?;

    let scope = LogScope::new("gamification", "complete_task", Some(&room.household_id), Some(user_id));
    let user = user_id.to_string();
    let household_id = room.household_id.clone();
    let room_id = room.id.clone();
    let room_name = room.name.clone();
    let result = run_in_tx(pool, move |tx| {
        Box::pin(async move {
            let now = now_ms();
            let streak = update_streak(&mut **tx, &user, now).await?;
            let rewards = calculate_task_rewards(difficulty, minutes, streak.streak);
            let user_change = grant(&mut **tx, Track::User, &user, &rewards, now).await?;
            let room_change = grant(&mut **tx, Track::Room, &room_id, &rewards, now).await?;

            let completion_id = new_uuid_v7();
            sqlx::query(
                "INSERT INTO task_completions (id, task_id, category_id, user_id, room_id, household_id, \
                 xp_earned, gold_earned, streak_bonus, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&completion_id)
            .bind(task.as_ref().map(|t| t.id.clone()))
            .bind(task.as_ref().and_then(|t| t.category_id.clone()))
            .bind(&user)
            .bind(&room_id)
            .bind(&household_id)
            .bind(rewards.total_xp)
            .bind(rewards.total_gold)
            .bind(rewards.streak_bonus)
            .bind(now)
            .execute(&mut **tx)
            .await?;

            let advance = match &task {
                Some(task) => Some(tasks::advance_in_tx(&mut **tx, task, now).await?),
                None => None,
            };

            let tasks_completed: i64 = sqlx::query_scalar("SELECT tasks_completed FROM users WHERE id = ?")
                .bind(&user)
                .fetch_one(&mut **tx)
                .await?;
            let counters = ProgressCounters {
                user_level: user_change.level,
                room_level: room_change.level,
                tasks_completed,
                streak: streak.streak,
            };
            let unlocked =
                achievements::unlock_eligible(&mut **tx, &user, Some(&household_id), &counters, now).await?;

            if user_change.leveled_up {
                notifications::push(
                    &mut **tx,
                    NewNotification {
                        user_id: user.clone(),
                        household_id: Some(household_id.clone()),
                        kind: kinds::LEVEL_UP,
                        title: format!("Level {} reached!", user_change.level),
                        message: format!("You are now level {}.", user_change.level),
                        link: Some("/profile".to_string()),
                    },
                )
                .await?;
            }
            if room_change.leveled_up {
                notifications::push(
                    &mut **tx,
                    NewNotification {
                        user_id: user.clone(),
                        household_id: Some(household_id.clone()),
                        kind: kinds::ROOM_LEVEL_UP,
                        title: format!("{room_name} leveled up!"),
                        message: format!("{room_name} is now level {}.", room_change.level),
                        link: Some(format!("/rooms/{room_id}")),
                    },
                )
                .await?;
            }

            Ok::<_, AppError>(TaskCompletionResult {
                completion_id,
                rewards,
                streak,
                user: user_change,
                room: room_change,
                achievements: unlocked,
                task: advance,
            })
        })
    })
    .await;

    scope.finish(result, |result| {
        json!({
            "room_id": room.id,
            "xp": result.rewards.total_xp,
            "gold": result.rewards.total_gold,
            "level_up": result.user.leveled_up,
            "achievements": result.achievements.len(),
        })
    })
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contributor {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub completions: i64,
    pub xp_earned: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub name: String,
    pub level: i64,
    pub xp: i64,
    pub xp_into_level: i64,
    pub xp_for_next_level: i64,
    pub progress_percent: i64,
    pub total_completions: i64,
    pub top_contributors: Vec<Contributor>,
}

pub async fn room_stats(pool: &SqlitePool, room_id: &str, user_id: &str) -> AppResult<RoomStats> {
    let room = rooms::find_one(pool, room_id, user_id).await?;
    let progress = level_progress(room.xp, 0, 0);
    let total_completions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM task_completions WHERE room_id = ?")
            .bind(room_id)
            .fetch_one(pool)
            .await?;
    let rows = sqlx::query(
        "SELECT u.id, u.username, u.display_name, COUNT(*) AS completions, SUM(c.xp_earned) AS xp \
         FROM task_completions c JOIN users u ON u.id = c.user_id \
         WHERE c.room_id = ? GROUP BY u.id ORDER BY xp DESC, completions DESC, u.username LIMIT ?",
    )
    .bind(room_id)
    .bind(TOP_CONTRIBUTORS)
    .fetch_all(pool)
    .await?;
    let top_contributors = rows
        .iter()
        .map(|row| {
            Ok(Contributor {
                user_id: row.try_get("id")?,
                username: row.try_get("username")?,
                display_name: row.try_get("display_name")?,
                completions: row.try_get("completions")?,
                xp_earned: row.try_get("xp")?,
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(RoomStats {
        room_id: room.id,
        name: room.name,
        level: room.level,
        xp: room.xp,
        xp_into_level: progress.xp_into_level,
        xp_for_next_level: progress.xp_for_next_level,
        progress_percent: progress.progress_percent,
        total_completions,
        top_contributors,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardsPreviewQuery {
    pub difficulty: i64,
    #[serde(default)]
    pub estimated_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardsPreview {
    pub streak: i64,
    pub rewards: TaskRewards,
}

/// What a completion right now would pay the caller, using the streak it would produce.
pub async fn rewards_preview(
    pool: &SqlitePool,
    user_id: &str,
    difficulty: i64,
    estimated_minutes: i64,
) -> AppResult<RewardsPreview> {
    tasks::validate_difficulty(difficulty)?;
    tasks::validate_minutes(estimated_minutes)?;
    let row = sqlx::query("SELECT streak, longest_streak, last_active_at FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("USER", "User not found"))?;
    let streak = next_streak(
        row.try_get("last_active_at")?,
        row.try_get("streak")?,
        row.try_get("longest_streak")?,
        now_ms(),
    );
    Ok(RewardsPreview {
        streak: streak.streak,
        rewards: calculate_task_rewards(difficulty, estimated_minutes, streak.streak),
    })
}

pub async fn task_complete_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(room_id): ApiPath<String>,
    body: Option<ApiJson<TaskCompleteInput>>,
) -> AppResult<Json<TaskCompletionResult>> {
    let input = body.map(|ApiJson(input)| input).unwrap_or_default();
    Ok(Json(complete_task(&state.pool, &auth.id, &room_id, input).await?))
}

pub async fn room_stats_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiPath(room_id): ApiPath<String>,
) -> AppResult<Json<RoomStats>> {
    Ok(Json(room_stats(&state.pool, &room_id, &auth.id).await?))
}

pub async fn rewards_preview_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<RewardsPreviewQuery>,
) -> AppResult<Json<RewardsPreview>> {
    Ok(Json(
        rewards_preview(&state.pool, &auth.id, query.difficulty, query.estimated_minutes).await?,
    ))
}
