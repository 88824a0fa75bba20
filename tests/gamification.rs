use anyhow::Result;
use kamehouse_lib::achievements;
use kamehouse_lib::gamification::{self, TaskCompleteInput};
use kamehouse_lib::notifications::{self, kinds, ListNotificationsQuery};
use kamehouse_lib::rooms::{self, CreateRoomInput, Room};
use kamehouse_lib::time::now_ms;
use kamehouse_lib::users;
use sqlx::SqlitePool;
#[path = "util.rs"]
mod util;

async fn room(pool: &SqlitePool, user_id: &str, household_id: &str) -> Room {
    rooms::create(
        pool,
        user_id,
        CreateRoomInput {
            household_id: household_id.to_string(),
            name: "Dojo".to_string(),
            icon: Some("🥋".to_string()),
            color: None,
        },
    )
    .await
    .expect("create room")
}

fn adhoc(difficulty: i64, minutes: i64) -> TaskCompleteInput {
    TaskCompleteInput {
        task_id: None,
        difficulty: Some(difficulty),
        estimated_minutes: Some(minutes),
    }
}

#[tokio::test]
async fn first_completion_pays_rewards_and_first_achievement() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let household = util::household_with(pool, &user, &[]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    let result = gamification::complete_task(pool, &user.id, &dojo.id, adhoc(5, 30)).await?;
    // 50 base XP plus 5% for a one day streak, 30 minutes is 10 gold.
    assert_eq!(result.rewards.base_xp, 50);
    assert_eq!(result.rewards.streak_bonus, 2);
    assert_eq!(result.rewards.total_xp, 52);
    assert_eq!(result.rewards.total_gold, 10);
    assert_eq!(result.streak.streak, 1);
    assert!(!result.user.leveled_up);
    assert_eq!(result.room.xp, 52);

    let keys: Vec<&str> = result.achievements.iter().map(|a| a.key).collect();
    assert_eq!(keys, vec!["first_chore"]);

    let stored = users::get_user(pool, &user.id).await?;
    let first_chore = achievements::find("first_chore").expect("catalog entry");
    assert_eq!(stored.xp, 52);
    assert_eq!(stored.gold, 10 + first_chore.gold_reward);
    assert_eq!(stored.tasks_completed, 1);
    assert_eq!(stored.streak, 1);
    assert!(stored.last_active_at.is_some());
    Ok(())
}

#[tokio::test]
async fn crossing_a_hundred_xp_levels_user_and_room() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let household = util::household_with(pool, &user, &[]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    gamification::complete_task(pool, &user.id, &dojo.id, adhoc(5, 0)).await?;
    let second = gamification::complete_task(pool, &user.id, &dojo.id, adhoc(5, 0)).await?;
    // Same UTC day: the streak holds at one.
    assert_eq!(second.streak.streak, 1);
    assert!(second.user.leveled_up);
    assert_eq!((second.user.previous_level, second.user.level), (1, 2));
    assert!(second.room.leveled_up);
    assert_eq!(rooms::load(pool, &dojo.id).await?.level, 2);
    assert!(second.achievements.is_empty(), "first_chore is only granted once");

    let inbox = notifications::list(pool, &user.id, &ListNotificationsQuery::default()).await?;
    let count = |kind: &str| inbox.iter().filter(|n| n.kind == kind).count();
    assert_eq!(count(kinds::LEVEL_UP), 1);
    assert_eq!(count(kinds::ROOM_LEVEL_UP), 1);
    assert_eq!(count(kinds::ACHIEVEMENT), 1);

    let progress = users::level_progress(pool, &user.id).await?;
    assert_eq!(progress.level, 2);
    assert_eq!(progress.xp_into_level, 4);
    assert_eq!(progress.xp_to_next_level, 96);
    Ok(())
}

#[tokio::test]
async fn yesterday_activity_extends_the_streak() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let household = util::household_with(pool, &user, &[]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    sqlx::query("UPDATE users SET streak = 2, longest_streak = 2, last_active_at = ? WHERE id = ?")
        .bind(now_ms() - 86_400_000)
        .bind(&user.id)
        .execute(pool)
        .await?;
    let result = gamification::complete_task(pool, &user.id, &dojo.id, adhoc(2, 9)).await?;
    assert_eq!(result.streak.previous, 2);
    assert_eq!(result.streak.streak, 3);
    assert_eq!(result.streak.longest_streak, 3);
    // 20 base XP at 15%.
    assert_eq!(result.rewards.streak_bonus, 3);
    let keys: Vec<&str> = result.achievements.iter().map(|a| a.key).collect();
    assert!(keys.contains(&"streak_3"));
    Ok(())
}

#[tokio::test]
async fn completion_requires_membership_and_an_existing_room() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let outsider = util::register(&state, "cell").await;
    let household = util::household_with(pool, &user, &[]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    let err = gamification::complete_task(pool, &outsider.id, &dojo.id, adhoc(1, 0))
        .await
        .expect_err("outsider");
    assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);

    let err = gamification::complete_task(pool, &user.id, "missing-room", adhoc(1, 0))
        .await
        .expect_err("missing room");
    assert_eq!(err.code(), "ROOM/NOT_FOUND");

    let err = gamification::complete_task(pool, &user.id, &dojo.id, adhoc(9, 0))
        .await
        .expect_err("difficulty out of range");
    assert_eq!(err.code(), "VALIDATION/INVALID");

    // Nothing was granted by the failed attempts.
    assert_eq!(users::get_user(pool, &user.id).await?.xp, 0);
    Ok(())
}

#[tokio::test]
async fn room_stats_rank_contributors() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let gohan = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[&gohan]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    gamification::complete_task(pool, &gohan.id, &dojo.id, adhoc(3, 0)).await?;
    gamification::complete_task(pool, &gohan.id, &dojo.id, adhoc(3, 0)).await?;
    gamification::complete_task(pool, &user.id, &dojo.id, adhoc(1, 0)).await?;

    let stats = gamification::room_stats(pool, &dojo.id, &user.id).await?;
    assert_eq!(stats.total_completions, 3);
    assert_eq!(stats.top_contributors[0].username, "gohan");
    assert_eq!(stats.top_contributors[0].completions, 2);
    assert_eq!(stats.top_contributors.len(), 2);
    assert_eq!(stats.xp, stats.top_contributors.iter().map(|c| c.xp_earned).sum::<i64>());

    let preview = gamification::rewards_preview(pool, &gohan.id, 4, 60).await?;
    assert_eq!(preview.streak, 1);
    assert_eq!(preview.rewards.total_gold, 20);
    Ok(())
}

#[tokio::test]
async fn catalog_reports_unlock_state() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "piccolo").await;
    let household = util::household_with(pool, &user, &[]).await;
    let dojo = room(pool, &user.id, &household.id).await;

    let before = achievements::catalog_for_user(pool, &user.id).await?;
    assert_eq!(before.len(), achievements::CATALOG.len());
    assert!(before.iter().all(|status| !status.unlocked));

    gamification::complete_task(pool, &user.id, &dojo.id, adhoc(1, 0)).await?;
    let mine = achievements::unlocked_for_user(pool, &user.id).await?;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].achievement.key, "first_chore");
    assert!(mine[0].unlocked_at.is_some());
    Ok(())
}
