//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use clipvault_quota::QuotaService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub quota: Arc<QuotaService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let quota = Arc::new(QuotaService::new(
            pool.clone(),
            config.billing_webhook_secret.clone(),
        ));
        tracing::info!("Quota service initialized");

        Self {
            pool,
            config,
            quota,
        }
    }
}
