#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use kamehouse_lib::{
    auth::{self, AuthUser, RegisterInput},
    db,
    households::{self, CreateHouseholdInput, Household},
    migrate, AppState, Config,
};
use sqlx::SqlitePool;

pub async fn memory_pool() -> SqlitePool {
    let pool = db::open_sqlite_pool("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    migrate::apply_migrations(&pool).await.expect("apply migrations");
    pool
}

/// Defaults with argon2 turned down so registration stays fast in tests.
pub fn test_config() -> Config {
    Config {
        password_hash_memory_kib: 64,
        password_hash_iterations: 1,
        ..Config::default()
    }
}

pub async fn test_state() -> AppState {
    AppState::new(memory_pool().await, test_config())
}

pub async fn register_with_token(state: &AppState, username: &str) -> (AuthUser, String) {
    let response = auth::register(
        &state.pool,
        &state.auth,
        RegisterInput {
            email: format!("{username}@example.com"),
            username: username.to_string(),
            password: "chores4ever".to_string(),
            display_name: None,
        },
    )
    .await
    .expect("register user");
    let user = AuthUser {
        id: response.user.id,
        email: response.user.email,
        username: response.user.username,
    };
    (user, response.access_token)
}

pub async fn register(state: &AppState, username: &str) -> AuthUser {
    register_with_token(state, username).await.0
}

/// A household owned by `owner` that every user in `members` has joined.
pub async fn household_with(pool: &SqlitePool, owner: &AuthUser, members: &[&AuthUser]) -> Household {
    let household = households::create_household(
        pool,
        &owner.id,
        CreateHouseholdInput {
            name: "Kame House".to_string(),
            description: None,
        },
    )
    .await
    .expect("create household");
    for member in members {
        households::join_by_code(pool, member, &household.invite_code)
            .await
            .expect("join household");
    }
    household
}
