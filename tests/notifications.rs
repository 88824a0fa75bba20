use anyhow::Result;
use kamehouse_lib::notifications::{self, kinds, ListNotificationsQuery, NewNotification};
#[path = "util.rs"]
mod util;

fn note(user_id: &str, title: &str) -> NewNotification {
    NewNotification {
        user_id: user_id.to_string(),
        household_id: None,
        kind: kinds::FAVOR,
        title: title.to_string(),
        message: "Someone needs a hand.".to_string(),
        link: Some("/lets".to_string()),
    }
}

#[tokio::test]
async fn read_state_and_counts() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let user = util::register(&state, "videl").await;
    for title in ["one", "two", "three"] {
        notifications::push(pool, note(&user.id, title)).await?;
    }
    assert_eq!(notifications::unread_count(pool, &user.id).await?.count, 3);

    let all = notifications::list(pool, &user.id, &ListNotificationsQuery::default()).await?;
    let read = notifications::mark_read(pool, &user.id, &all[0].id).await?;
    assert!(read.is_read);
    assert_eq!(notifications::unread_count(pool, &user.id).await?.count, 2);

    let unread = notifications::list(
        pool,
        &user.id,
        &ListNotificationsQuery {
            unread_only: true,
            limit: Some(1),
        },
    )
    .await?;
    assert_eq!(unread.len(), 1);
    assert!(!unread[0].is_read);

    assert_eq!(notifications::mark_all_read(pool, &user.id).await?, 2);
    assert_eq!(notifications::unread_count(pool, &user.id).await?.count, 0);
    Ok(())
}

#[tokio::test]
async fn other_users_notifications_are_invisible() -> Result<()> {
    let state = util::test_state().await;
    let pool = &state.pool;
    let owner = util::register(&state, "videl").await;
    let snoop = util::register(&state, "spopovich").await;
    notifications::push(pool, note(&owner.id, "private")).await?;
    let id = notifications::list(pool, &owner.id, &ListNotificationsQuery::default()).await?[0]
        .id
        .clone();

    let err = notifications::mark_read(pool, &snoop.id, &id).await.expect_err("foreign read");
    assert_eq!(err.code(), "NOTIFICATION/NOT_FOUND");
    let err = notifications::delete(pool, &snoop.id, &id).await.expect_err("foreign delete");
    assert_eq!(err.code(), "NOTIFICATION/NOT_FOUND");

    notifications::delete(pool, &owner.id, &id).await?;
    assert!(notifications::list(pool, &owner.id, &ListNotificationsQuery::default())
        .await?
        .is_empty());
    Ok(())
}
