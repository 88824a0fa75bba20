use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::{
    auth::AuthUser,
    notifications::{self, kinds, NewNotification},
    state::AppState,
    AppResult,
};

/// The progress counter an achievement watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Requirement {
    UserLevel(i64),
    RoomLevel(i64),
    TasksCompleted(i64),
    Streak(i64),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub requirement: Requirement,
    pub gold_reward: i64,
    pub gem_reward: i64,
}

const fn achievement(
    key: &'static str,
    name: &'static str,
    description: &'static str,
    requirement: Requirement,
    gold_reward: i64,
    gem_reward: i64,
) -> Achievement {
    Achievement {
        key,
        name,
        description,
        requirement,
        gold_reward,
        gem_reward,
    }
}

pub static CATALOG: &[Achievement] = &[
    achievement("first_chore", "First Steps", "Complete your first chore.", Requirement::TasksCompleted(1), 10, 0),
    achievement("chores_10", "Getting Into It", "Complete 10 chores.", Requirement::TasksCompleted(10), 25, 1),
    achievement("chores_50", "Household Hero", "Complete 50 chores.", Requirement::TasksCompleted(50), 100, 3),
    achievement("chores_100", "Chore Champion", "Complete 100 chores.", Requirement::TasksCompleted(100), 250, 5),
    achievement("level_5", "Rising Star", "Reach level 5.", Requirement::UserLevel(5), 50, 1),
    achievement("level_10", "Seasoned", "Reach level 10.", Requirement::UserLevel(10), 100, 2),
    achievement("level_25", "Veteran", "Reach level 25.", Requirement::UserLevel(25), 250, 5),
    achievement("level_50", "Legend", "Reach level 50.", Requirement::UserLevel(50), 500, 10),
    achievement("room_level_3", "Cozy Corner", "Raise a room to level 3.", Requirement::RoomLevel(3), 30, 0),
    achievement("room_level_5", "Well Kept", "Raise a room to level 5.", Requirement::RoomLevel(5), 75, 1),
    achievement("room_level_10", "Showroom", "Raise a room to level 10.", Requirement::RoomLevel(10), 200, 3),
    achievement("streak_3", "On a Roll", "Keep a 3 day streak.", Requirement::Streak(3), 15, 0),
    achievement("streak_7", "Week Warrior", "Keep a 7 day streak.", Requirement::Streak(7), 50, 1),
    achievement("streak_30", "Unstoppable", "Keep a 30 day streak.", Requirement::Streak(30), 300, 5),
];

/// Counters the ladder is matched against after a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub user_level: i64,
    pub room_level: i64,
    pub tasks_completed: i64,
    pub streak: i64,
}

impl Requirement {
    pub fn is_met(self, counters: &ProgressCounters) -> bool {
        match self {
            Requirement::UserLevel(level) => counters.user_level >= level,
            Requirement::RoomLevel(level) => counters.room_level >= level,
            Requirement::TasksCompleted(count) => counters.tasks_completed >= count,
            Requirement::Streak(days) => counters.streak >= days,
        }
    }
}

pub fn find(key: &str) -> Option<&'static Achievement> {
    CATALOG.iter().find(|a| a.key == key)
}

/// Catalog entries whose requirement is met by `counters`.
pub fn eligible(counters: &ProgressCounters) -> impl Iterator<Item = &'static Achievement> + '_ {
    CATALOG.iter().filter(move |a| a.requirement.is_met(counters))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AchievementStatus {
    #[serde(flatten)]
    pub achievement: &'static Achievement,
    pub unlocked: bool,
    pub unlocked_at: Option<i64>,
}

/// Record every newly met achievement for `user_id`, grant its rewards and
/// notify the user. Already unlocked achievements are skipped.
pub async fn unlock_eligible(
    conn: &mut SqliteConnection,
    user_id: &str,
    household_id: Option<&str>,
    counters: &ProgressCounters,
    now: i64,
) -> AppResult<Vec<&'static Achievement>> {
    let mut unlocked = Vec::new();
    for achievement in eligible(counters) {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO user_achievements (user_id, achievement_key, unlocked_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(achievement.key)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if inserted == 0 {
            continue;
        }

        sqlx::query("UPDATE users SET gold = gold + ?, gems = gems + ?, updated_at = ? WHERE id = ?")
            .bind(achievement.gold_reward)
            .bind(achievement.gem_reward)
            .bind(now)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
        notifications::push(
            &mut *conn,
            NewNotification {
                user_id: user_id.to_string(),
                household_id: household_id.map(str::to_string),
                kind: kinds::ACHIEVEMENT,
                title: format!("Achievement unlocked: {}", achievement.name),
                message: achievement.description.to_string(),
                link: Some("/achievements".to_string()),
            },
        )
        .await?;
        info!(
            target: "kamehouse",
            event = "achievement_unlocked",
            user_id = %user_id,
            key = achievement.key
        );
        unlocked.push(achievement);
    }
    Ok(unlocked)
}

async fn unlocked_map(pool: &SqlitePool, user_id: &str) -> AppResult<HashMap<String, i64>> {
    let rows = sqlx::query("SELECT achievement_key, unlocked_at FROM user_achievements WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("achievement_key")?, row.try_get("unlocked_at")?)))
        .collect()
}

/// Full catalog with the caller's unlock state.
pub async fn catalog_for_user(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<AchievementStatus>> {
    let unlocked = unlocked_map(pool, user_id).await?;
    Ok(CATALOG
        .iter()
        .map(|achievement| {
            let unlocked_at = unlocked.get(achievement.key).copied();
            AchievementStatus {
                achievement,
                unlocked: unlocked_at.is_some(),
                unlocked_at,
            }
        })
        .collect())
}

pub async fn unlocked_for_user(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<AchievementStatus>> {
    let mut statuses: Vec<_> = catalog_for_user(pool, user_id)
        .await?
        .into_iter()
        .filter(|status| status.unlocked)
        .collect();
    statuses.sort_by_key(|status| status.unlocked_at);
    Ok(statuses)
}

pub async fn catalog_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<AchievementStatus>>> {
    Ok(Json(catalog_for_user(&state.pool, &auth.id).await?))
}

pub async fn mine_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<AchievementStatus>>> {
    Ok(Json(unlocked_for_user(&state.pool, &auth.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_keys_are_unique() {
        let keys: HashSet<_> = CATALOG.iter().map(|a| a.key).collect();
        assert_eq!(keys.len(), CATALOG.len());
    }

    #[test]
    fn ladder_matches_thresholds() {
        let counters = ProgressCounters {
            user_level: 5,
            room_level: 2,
            tasks_completed: 10,
            streak: 3,
        };
        let keys: Vec<_> = eligible(&counters).map(|a| a.key).collect();
        assert_eq!(keys, vec!["first_chore", "chores_10", "level_5", "streak_3"]);
    }

    #[test]
    fn nothing_is_eligible_before_any_progress() {
        let counters = ProgressCounters {
            user_level: 1,
            room_level: 1,
            ..Default::default()
        };
        assert_eq!(eligible(&counters).count(), 0);
    }

    #[test]
    fn requirement_serializes_with_type_tag() {
        let value = serde_json::to_value(find("streak_7").unwrap()).unwrap();
        assert_eq!(value["requirement"]["type"], "streak");
        assert_eq!(value["requirement"]["value"], 7);
        assert_eq!(value["goldReward"], 50);
    }
}
