use std::time::Duration;

use axum::extract::State;
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method,
};
use axum::middleware;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal::{self, ctrl_c};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    achievements, auth, bulletin, categories,
    config::{Config, Environment},
    db, gamification, households, lets, migrate, notifications, rooms,
    state::AppState,
    tasks, users,
    util::panic_fence,
    AppResult,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub database: bool,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub environment: Environment,
    pub api_base_url: String,
    pub version: &'static str,
}

pub async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    let database = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    if !database {
        warn!(target: "kamehouse", event = "health_db_unreachable");
    }
    Json(Health {
        status: if database { "ok" } else { "degraded" },
        database,
        version: VERSION,
    })
}

pub async fn meta_handler(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Meta>> {
    let host = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let (environment, api_base_url) = state.config.api_base_url_for_host(host);
    Ok(Json(Meta {
        environment,
        api_base_url,
        version: VERSION,
    }))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));
    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(target: "kamehouse", event = "cors_origin_invalid", origin = %origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/meta", get(meta_handler))
        // auth
        .route("/auth/register", post(auth::register_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/me", get(users::me_handler))
        // users
        .route("/users/me", get(users::me_handler).patch(users::update_me_handler))
        .route("/users/me/progress", get(users::progress_handler))
        .route("/users/:id", get(users::get_user_handler))
        // households
        .route(
            "/households",
            post(households::create_handler).get(households::list_handler),
        )
        .route("/households/join", post(households::join_handler))
        .route(
            "/households/:id",
            get(households::get_handler)
                .patch(households::update_handler)
                .delete(households::delete_handler),
        )
        .route("/households/:id/leave", post(households::leave_handler))
        .route("/households/:id/members", get(households::members_handler))
        .route(
            "/households/:id/members/:userId",
            patch(households::change_role_handler).delete(households::remove_member_handler),
        )
        .route("/households/:id/invite-code", post(households::invite_code_handler))
        .route("/households/:id/leaderboard", get(households::leaderboard_handler))
        // categories
        .route(
            "/categories",
            post(categories::create_handler).get(categories::list_handler),
        )
        .route(
            "/categories/household/:householdId/reorder",
            patch(categories::reorder_handler),
        )
        .route(
            "/categories/:id",
            get(categories::get_handler)
                .patch(categories::update_handler)
                .delete(categories::delete_handler),
        )
        .route("/categories/:id/stats", get(categories::stats_handler))
        // rooms
        .route("/rooms", post(rooms::create_handler).get(rooms::list_handler))
        .route(
            "/rooms/:id",
            get(rooms::get_handler)
                .patch(rooms::update_handler)
                .delete(rooms::delete_handler),
        )
        // tasks
        .route("/tasks", post(tasks::create_handler).get(tasks::list_handler))
        .route("/tasks/due", get(tasks::due_handler))
        .route(
            "/tasks/:id",
            get(tasks::get_handler)
                .patch(tasks::update_handler)
                .delete(tasks::delete_handler),
        )
        .route("/tasks/:id/complete", post(tasks::complete_handler))
        .route("/tasks/:id/occurrences", get(tasks::occurrences_handler))
        // gamification
        .route(
            "/gamification/task-complete/:roomId",
            post(gamification::task_complete_handler),
        )
        .route(
            "/gamification/room-stats/:roomId",
            get(gamification::room_stats_handler),
        )
        .route(
            "/gamification/rewards-preview",
            get(gamification::rewards_preview_handler),
        )
        // achievements
        .route("/achievements", get(achievements::catalog_handler))
        .route("/achievements/me", get(achievements::mine_handler))
        // bulletin
        .route(
            "/bulletin",
            post(bulletin::create_handler).get(bulletin::list_handler),
        )
        .route(
            "/bulletin/:id",
            patch(bulletin::update_handler).delete(bulletin::delete_handler),
        )
        .route("/bulletin/:id/pin", patch(bulletin::pin_handler))
        .route("/bulletin/:id/reactions", post(bulletin::reaction_handler))
        // notifications
        .route("/notifications", get(notifications::list_handler))
        .route(
            "/notifications/unread-count",
            get(notifications::unread_count_handler),
        )
        .route(
            "/notifications/read-all",
            patch(notifications::mark_all_read_handler),
        )
        .route(
            "/notifications/:id",
            axum::routing::delete(notifications::delete_handler),
        )
        .route("/notifications/:id/read", patch(notifications::mark_read_handler))
        // lets
        .route(
            "/lets/favors",
            post(lets::create_favor_handler).get(lets::list_favors_handler),
        )
        .route("/lets/favors/:id/accept", post(lets::accept_favor_handler))
        .route("/lets/favors/:id/complete", post(lets::complete_favor_handler))
        .route("/lets/favors/:id/cancel", post(lets::cancel_favor_handler))
        .route(
            "/lets/transactions",
            post(lets::transfer_handler).get(lets::transactions_handler),
        )
        .route("/lets/balances", get(lets::balances_handler))
}

/// Full application router, everything mounted under `/api`.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .nest("/api", api_routes())
        .layer(middleware::from_fn(panic_fence))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Open the database, apply migrations and serve until ctrl-c or SIGTERM.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::open_sqlite_pool(&config.database_url).await?;
    let applied = migrate::apply_migrations(&pool).await?;
    info!(target: "kamehouse", event = "migrations_checked", applied = applied.len());

    let address = config.bind_address();
    let state = AppState::new(pool.clone(), config);
    let app = build_router(state);

    let listener = TcpListener::bind(&address).await?;
    info!(target: "kamehouse", event = "server_listening", address = %address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    info!(target: "kamehouse", event = "server_stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = ctrl_c().await {
            warn!(target: "kamehouse", event = "signal_install_failed", error = %err);
            std::future::pending::<()>().await;
        }
        info!(target: "kamehouse", event = "shutdown_requested", signal = "ctrl_c");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(target: "kamehouse", event = "shutdown_requested", signal = "terminate");
            }
            Err(err) => {
                warn!(target: "kamehouse", event = "signal_install_failed", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
