use anyhow::Result;
use kamehouse_lib::categories::{self, CreateCategoryInput, UpdateCategoryInput};
use kamehouse_lib::gamification::{self, TaskCompleteInput};
use kamehouse_lib::recurrence::Frequency;
use kamehouse_lib::rooms::{self, CreateRoomInput};
use kamehouse_lib::tasks::{self, CreateTaskInput};
#[path = "util.rs"]
mod util;

fn category(household_id: &str, name: &str) -> CreateCategoryInput {
    CreateCategoryInput {
        household_id: household_id.to_string(),
        name: name.to_string(),
        description: None,
        icon: None,
        color: Some("#22AA66".to_string()),
        order: None,
    }
}

#[tokio::test]
async fn categories_append_in_order() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;

    let kitchen = categories::create(pool, &owner.id, category(&household.id, "Kitchen")).await?;
    let laundry = categories::create(pool, &owner.id, category(&household.id, "Laundry")).await?;
    assert!(laundry.order > kitchen.order);
    assert!(kitchen.is_active);

    let listed = categories::list_by_household(pool, &household.id, &owner.id).await?;
    let names: Vec<&str> = listed.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Kitchen", "Laundry"]);
    Ok(())
}

#[tokio::test]
async fn invalid_color_is_rejected() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;

    let mut input = category(&household.id, "Garden");
    input.color = Some("green".to_string());
    let err = categories::create(pool, &owner.id, input).await.expect_err("bad color");
    assert_eq!(err.code(), "VALIDATION/INVALID");
    assert_eq!(err.context().get("field").map(String::as_str), Some("color"));
    Ok(())
}

#[tokio::test]
async fn soft_deleted_category_leaves_listing_but_keeps_history() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;
    let kitchen = categories::create(pool, &owner.id, category(&household.id, "Kitchen")).await?;
    let room = rooms::create(
        pool,
        &owner.id,
        CreateRoomInput {
            household_id: household.id.clone(),
            name: "Kitchen".to_string(),
            icon: None,
            color: None,
        },
    )
    .await?;
    let task = tasks::create(
        pool,
        &owner.id,
        CreateTaskInput {
            household_id: household.id.clone(),
            title: "Dishes".to_string(),
            description: None,
            room_id: Some(room.id.clone()),
            category_id: Some(kitchen.id.clone()),
            difficulty: Some(2),
            estimated_minutes: Some(15),
            frequency: Frequency::Daily,
            interval_days: None,
            assigned_to: None,
            due_at: None,
        },
    )
    .await?;
    gamification::complete_task(
        pool,
        &owner.id,
        &room.id,
        TaskCompleteInput {
            task_id: Some(task.id.clone()),
            ..TaskCompleteInput::default()
        },
    )
    .await?;

    categories::soft_delete(pool, &kitchen.id, &owner.id).await?;
    assert!(categories::list_by_household(pool, &household.id, &owner.id)
        .await?
        .is_empty());

    let archived = categories::find_one(pool, &kitchen.id, &owner.id).await?;
    assert!(!archived.is_active);

    let stats = categories::stats(pool, &kitchen.id, &owner.id).await?;
    assert!(!stats.is_active);
    assert_eq!(stats.active_tasks, 1);
    assert_eq!(stats.total_completions, 1);
    assert!(stats.total_xp_earned >= 20);
    assert!(stats.last_completed_at.is_some());

    let restored = categories::update(
        pool,
        &kitchen.id,
        &owner.id,
        UpdateCategoryInput {
            is_active: Some(true),
            ..UpdateCategoryInput::default()
        },
    )
    .await?;
    assert!(restored.is_active);
    assert_eq!(
        categories::list_by_household(pool, &household.id, &owner.id).await?.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn non_members_get_forbidden() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let outsider = util::register(&state, "raditz").await;
    let household = util::household_with(pool, &owner, &[]).await;
    let kitchen = categories::create(pool, &owner.id, category(&household.id, "Kitchen")).await?;

    let err = categories::find_one(pool, &kitchen.id, &outsider.id).await.expect_err("outsider read");
    assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    let err = categories::create(pool, &outsider.id, category(&household.id, "Intrusion"))
        .await
        .expect_err("outsider create");
    assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);

    let err = categories::find_one(pool, "missing", &owner.id).await.expect_err("missing");
    assert_eq!(err.code(), "CATEGORY/NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn reorder_assigns_positions_by_index() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;
    let a = categories::create(pool, &owner.id, category(&household.id, "A")).await?;
    let b = categories::create(pool, &owner.id, category(&household.id, "B")).await?;
    let c = categories::create(pool, &owner.id, category(&household.id, "C")).await?;

    let reordered = categories::reorder(
        pool,
        &household.id,
        &owner.id,
        vec![c.id.clone(), b.id.clone(), a.id.clone()],
    )
    .await?;
    let placed: Vec<(&str, i64)> = reordered.iter().map(|cat| (cat.name.as_str(), cat.order)).collect();
    assert_eq!(placed, vec![("C", 0), ("B", 1), ("A", 2)]);

    let err = categories::reorder(pool, &household.id, &owner.id, vec![a.id.clone(), a.id.clone()])
        .await
        .expect_err("duplicate ids");
    assert_eq!(err.code(), "VALIDATION/INVALID");

    // A foreign id aborts the whole reorder.
    let other = util::household_with(pool, &owner, &[]).await;
    let foreign = categories::create(pool, &owner.id, category(&other.id, "Elsewhere")).await?;
    let err = categories::reorder(pool, &household.id, &owner.id, vec![a.id.clone(), foreign.id])
        .await
        .expect_err("foreign id");
    assert_eq!(err.code(), "CATEGORY/NOT_FOUND");
    let unchanged = categories::find_one(pool, &a.id, &owner.id).await?;
    assert_eq!(unchanged.order, 2);
    Ok(())
}

#[tokio::test]
async fn deleting_a_room_keeps_category_history() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;
    let laundry = categories::create(pool, &owner.id, category(&household.id, "Laundry")).await?;
    let room = rooms::create(
        pool,
        &owner.id,
        CreateRoomInput {
            household_id: household.id.clone(),
            name: "Utility".to_string(),
            icon: None,
            color: None,
        },
    )
    .await?;
    let task = tasks::create(
        pool,
        &owner.id,
        CreateTaskInput {
            household_id: household.id.clone(),
            title: "Fold shirts".to_string(),
            description: None,
            room_id: Some(room.id.clone()),
            category_id: Some(laundry.id.clone()),
            difficulty: Some(3),
            estimated_minutes: Some(30),
            frequency: Frequency::Weekly,
            interval_days: None,
            assigned_to: None,
            due_at: None,
        },
    )
    .await?;
    tasks::complete(pool, &task.id, &owner.id).await?;
    let before = categories::stats(pool, &laundry.id, &owner.id).await?;
    assert_eq!(before.total_completions, 1);

    rooms::delete(pool, &room.id, &owner.id).await?;

    let after = categories::stats(pool, &laundry.id, &owner.id).await?;
    assert_eq!(after.total_completions, before.total_completions);
    assert_eq!(after.total_xp_earned, before.total_xp_earned);
    assert_eq!(after.last_completed_at, before.last_completed_at);
    Ok(())
}

#[tokio::test]
async fn explicit_null_clears_category_fields() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "chichi").await;
    let household = util::household_with(pool, &owner, &[]).await;
    let mut input = category(&household.id, "Garden");
    input.description = Some("Weeds and hedges".to_string());
    input.icon = Some("🌿".to_string());
    let garden = categories::create(pool, &owner.id, input).await?;

    let patch: UpdateCategoryInput = serde_json::from_value(serde_json::json!({
        "description": null,
        "color": null,
    }))?;
    let cleared = categories::update(pool, &garden.id, &owner.id, patch).await?;
    assert_eq!(cleared.description, None);
    assert_eq!(cleared.color, None);
    assert_eq!(cleared.icon.as_deref(), Some("🌿"));

    let err = categories::update(
        pool,
        &garden.id,
        &owner.id,
        UpdateCategoryInput {
            color: Some(Some("green".to_string())),
            ..UpdateCategoryInput::default()
        },
    )
    .await
    .expect_err("bad color");
    assert_eq!(err.context().get("field").map(String::as_str), Some("color"));
    Ok(())
}
