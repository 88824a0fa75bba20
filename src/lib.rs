//! KameHouse: a gamified household chores, habits and favors API.

pub mod achievements;
pub mod auth;
pub mod bulletin;
pub mod categories;
pub mod config;
pub mod db;
pub mod error;
pub mod gamification;
pub mod households;
pub mod id;
pub mod lets;
pub mod logging;
pub mod migrate;
pub mod notifications;
pub mod recurrence;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod tasks;
pub mod time;
pub mod users;
pub mod util;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::{build_router, serve};
pub use state::AppState;
