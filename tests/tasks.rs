use anyhow::Result;
use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};
use kamehouse_lib::households::Household;
use kamehouse_lib::recurrence::Frequency;
use kamehouse_lib::rooms::{self, CreateRoomInput, Room};
use kamehouse_lib::tasks::{self, CreateTaskInput, DueTasksQuery, ListTasksQuery, UpdateTaskInput};
use kamehouse_lib::time::now_ms;
use sqlx::SqlitePool;
#[path = "util.rs"]
mod util;

const DAY_MS: i64 = 86_400_000;

async fn room(pool: &SqlitePool, user_id: &str, household: &Household, name: &str) -> Room {
    rooms::create(
        pool,
        user_id,
        CreateRoomInput {
            household_id: household.id.clone(),
            name: name.to_string(),
            icon: None,
            color: None,
        },
    )
    .await
    .expect("create room")
}

fn chore(household: &Household, room: &Room, title: &str, frequency: Frequency) -> CreateTaskInput {
    CreateTaskInput {
        household_id: household.id.clone(),
        title: title.to_string(),
        description: None,
        room_id: Some(room.id.clone()),
        category_id: None,
        difficulty: Some(3),
        estimated_minutes: Some(20),
        frequency,
        interval_days: None,
        assigned_to: None,
        due_at: None,
    }
}

fn whole_seconds(ms: i64) -> i64 {
    ms - ms.rem_euclid(1000)
}

#[tokio::test]
async fn one_off_task_archives_on_completion() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let study = room(pool, &user.id, &household, "Study").await;
    let task = tasks::create(pool, &user.id, chore(&household, &study, "Homework", Frequency::Once)).await?;

    let result = tasks::complete(pool, &task.id, &user.id).await?;
    let advance = result.task.expect("task advance reported");
    assert!(advance.archived);
    assert_eq!(advance.next_due_at, None);

    let stored = tasks::find_one(pool, &task.id, &user.id).await?;
    assert!(!stored.is_active);
    assert_eq!(stored.completion_count, 1);
    assert!(stored.last_completed_at.is_some());

    let err = tasks::complete(pool, &task.id, &user.id).await.expect_err("archived");
    assert_eq!(err.code(), tasks::TASK_INACTIVE);
    assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

    let active = tasks::list(
        pool,
        &user.id,
        &ListTasksQuery {
            household_id: household.id.clone(),
            room_id: None,
            category_id: None,
            include_inactive: false,
        },
    )
    .await?;
    assert!(active.is_empty());
    Ok(())
}

#[tokio::test]
async fn overdue_weekly_task_moves_past_now_on_its_weekday() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let yard = room(pool, &user.id, &household, "Yard").await;

    // Monday 09:00 UTC, long overdue.
    let due = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).single().expect("date").timestamp_millis();
    let mut input = chore(&household, &yard, "Mow lawn", Frequency::Weekly);
    input.due_at = Some(due);
    let task = tasks::create(pool, &user.id, input).await?;

    let before = now_ms();
    let result = tasks::complete(pool, &task.id, &user.id).await?;
    let next = result
        .task
        .and_then(|advance| advance.next_due_at)
        .expect("weekly task reschedules");
    assert!(next > before);
    assert!(next - before <= 7 * DAY_MS);
    assert_eq!((next - due) % (7 * DAY_MS), 0);
    let next_date = Utc.timestamp_millis_opt(next).single().expect("valid");
    assert_eq!(next_date.weekday(), Weekday::Mon);
    assert_eq!(next_date.hour(), 9);

    let stored = tasks::find_one(pool, &task.id, &user.id).await?;
    assert_eq!(stored.due_at, Some(next));
    assert!(stored.is_active);
    Ok(())
}

#[tokio::test]
async fn early_completion_skips_to_the_following_cycle() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let kitchen = room(pool, &user.id, &household, "Kitchen").await;

    let due = whole_seconds(now_ms()) + 3 * DAY_MS;
    let mut input = chore(&household, &kitchen, "Wipe counters", Frequency::Daily);
    input.due_at = Some(due);
    let task = tasks::create(pool, &user.id, input).await?;

    let result = tasks::complete(pool, &task.id, &user.id).await?;
    assert_eq!(result.task.and_then(|a| a.next_due_at), Some(due + DAY_MS));
    Ok(())
}

#[tokio::test]
async fn custom_interval_and_upcoming_occurrences() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let bathroom = room(pool, &user.id, &household, "Bathroom").await;

    let due = whole_seconds(now_ms()) + DAY_MS;
    let mut input = chore(&household, &bathroom, "Replace towels", Frequency::Custom);
    input.interval_days = Some(10);
    input.due_at = Some(due);
    let task = tasks::create(pool, &user.id, input).await?;

    let upcoming = tasks::occurrences(pool, &task.id, &user.id, Some(3)).await?;
    assert_eq!(upcoming.frequency, Frequency::Custom);
    assert_eq!(upcoming.dates, vec![due, due + 10 * DAY_MS, due + 20 * DAY_MS]);

    let err = tasks::occurrences(pool, &task.id, &user.id, Some(0)).await.expect_err("count 0");
    assert_eq!(err.code(), "VALIDATION/INVALID");
    Ok(())
}

#[tokio::test]
async fn due_lists_only_active_tasks_up_to_the_cutoff() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let hall = room(pool, &user.id, &household, "Hall").await;
    let now = now_ms();

    let mut overdue = chore(&household, &hall, "Vacuum", Frequency::Weekly);
    overdue.due_at = Some(now - DAY_MS);
    let overdue = tasks::create(pool, &user.id, overdue).await?;
    let mut later = chore(&household, &hall, "Dust shelves", Frequency::Monthly);
    later.due_at = Some(now + 10 * DAY_MS);
    tasks::create(pool, &user.id, later).await?;
    tasks::create(pool, &user.id, chore(&household, &hall, "Someday", Frequency::Once)).await?;

    let due = tasks::due(
        pool,
        &user.id,
        &DueTasksQuery {
            household_id: household.id.clone(),
            before: Some(now),
        },
    )
    .await?;
    let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![overdue.id.as_str()]);
    Ok(())
}

#[tokio::test]
async fn links_and_limits_are_validated() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let stranger = util::register(&state, "cell").await;
    let household = util::household_with(pool, &user, &[]).await;
    let other = util::household_with(pool, &user, &[]).await;
    let here = room(pool, &user.id, &household, "Here").await;
    let there = room(pool, &user.id, &other, "There").await;

    let input = chore(&household, &there, "Wrong room", Frequency::Daily);
    let err = tasks::create(pool, &user.id, input).await.expect_err("foreign room");
    assert_eq!(err.code(), tasks::HOUSEHOLD_MISMATCH);

    let mut input = chore(&household, &here, "Too hard", Frequency::Daily);
    input.difficulty = Some(6);
    let err = tasks::create(pool, &user.id, input).await.expect_err("difficulty");
    assert_eq!(err.context().get("field").map(String::as_str), Some("difficulty"));

    let input = chore(&household, &here, "No interval", Frequency::Custom);
    let err = tasks::create(pool, &user.id, input).await.expect_err("custom without interval");
    assert_eq!(err.context().get("field").map(String::as_str), Some("intervalDays"));

    let mut input = chore(&household, &here, "Delegate", Frequency::Daily);
    input.assigned_to = Some(stranger.id.clone());
    let err = tasks::create(pool, &user.id, input).await.expect_err("assignee outside");
    assert_eq!(err.code(), "VALIDATION/ASSIGNEE_NOT_MEMBER");
    Ok(())
}

#[tokio::test]
async fn tasks_without_a_room_cannot_be_completed() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let den = room(pool, &user.id, &household, "Den").await;
    let mut input = chore(&household, &den, "Floating", Frequency::Daily);
    input.room_id = None;
    let task = tasks::create(pool, &user.id, input).await?;

    let err = tasks::complete(pool, &task.id, &user.id).await.expect_err("no room");
    assert_eq!(err.context().get("field").map(String::as_str), Some("roomId"));

    let moved = tasks::update(
        pool,
        &task.id,
        &user.id,
        UpdateTaskInput {
            room_id: Some(Some(den.id.clone())),
            ..UpdateTaskInput::default()
        },
    )
    .await?;
    assert_eq!(moved.room_id.as_deref(), Some(den.id.as_str()));
    tasks::complete(pool, &task.id, &user.id).await?;
    Ok(())
}

#[tokio::test]
async fn due_dates_outside_the_schedule_window_are_rejected() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let attic = room(pool, &user.id, &household, "Attic").await;

    let y1999 = Utc.with_ymd_and_hms(1999, 12, 31, 0, 0, 0).single().expect("date").timestamp_millis();
    for due in [i64::MIN, -1, y1999, i64::MAX] {
        let mut input = chore(&household, &attic, "Time travel", Frequency::Daily);
        input.due_at = Some(due);
        let err = tasks::create(pool, &user.id, input).await.expect_err("out of range");
        assert_eq!(err.context().get("field").map(String::as_str), Some("dueAt"));
    }

    let task = tasks::create(pool, &user.id, chore(&household, &attic, "Sort boxes", Frequency::Daily)).await?;
    let err = tasks::update(
        pool,
        &task.id,
        &user.id,
        UpdateTaskInput {
            due_at: Some(Some(i64::MIN)),
            ..UpdateTaskInput::default()
        },
    )
    .await
    .expect_err("out of range");
    assert_eq!(err.code(), "VALIDATION/INVALID");

    // The task is untouched and still completes normally.
    assert_eq!(tasks::find_one(pool, &task.id, &user.id).await?.due_at, None);
    tasks::complete(pool, &task.id, &user.id).await?;
    tasks::occurrences(pool, &task.id, &user.id, Some(2)).await?;
    Ok(())
}

#[tokio::test]
async fn explicit_null_clears_optional_task_fields() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "gohan").await;
    let household = util::household_with(pool, &user, &[]).await;
    let porch = room(pool, &user.id, &household, "Porch").await;

    let mut input = chore(&household, &porch, "Sweep porch", Frequency::Weekly);
    input.description = Some("Leaves too".to_string());
    input.assigned_to = Some(user.id.clone());
    input.due_at = Some(whole_seconds(now_ms()) + DAY_MS);
    let task = tasks::create(pool, &user.id, input).await?;

    let patch: UpdateTaskInput = serde_json::from_value(serde_json::json!({
        "description": null,
        "assignedTo": null,
        "dueAt": null,
    }))?;
    assert_eq!(patch.due_at, Some(None));
    assert_eq!(patch.room_id, None);

    let cleared = tasks::update(pool, &task.id, &user.id, patch).await?;
    assert_eq!(cleared.description, None);
    assert_eq!(cleared.assigned_to, None);
    assert_eq!(cleared.due_at, None);
    // Absent fields keep their values.
    assert_eq!(cleared.room_id.as_deref(), Some(porch.id.as_str()));
    assert_eq!(cleared.title, "Sweep porch");
    Ok(())
}
