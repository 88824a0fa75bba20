use sqlx::SqlitePool;
use std::sync::Arc;

use crate::auth::AuthSettings;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub auth: Arc<AuthSettings>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        let auth = Arc::new(AuthSettings::from_config(&config));
        Self {
            pool,
            config: Arc::new(config),
            auth,
        }
    }

    pub fn lets_credit_limit(&self) -> i64 {
        self.config.lets_credit_limit
    }
}
