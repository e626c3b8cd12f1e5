//! Postgres pool construction shared by the relational and document stores.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

use crate::{classify_store_error, retry_with_backoff, BackoffPolicy, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub verify_ssl: bool,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            verify_ssl: true,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    fn connect_options(&self) -> StoreResult<PgConnectOptions> {
        let mode = if self.verify_ssl {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Prefer
        };
        Ok(PgConnectOptions::from_str(&self.url)?.ssl_mode(mode))
    }
}

/// Opens a pool whose connections are liveness-checked on every checkout, so a connection
/// dropped by the server is replaced instead of handed to a caller. The initial connect is
/// retried with `retry`.
pub async fn connect_pool(settings: &PoolSettings, retry: &BackoffPolicy) -> StoreResult<PgPool> {
    let options = settings.connect_options()?;
    let pool = retry_with_backoff(retry, "connect_pool", classify_store_error, |_| {
        let options = options.clone();
        async move {
            PgPoolOptions::new()
                .max_connections(settings.max_connections.max(1))
                .acquire_timeout(settings.acquire_timeout)
                .test_before_acquire(true)
                .connect_with(options)
                .await
                .map_err(StoreError::from)
        }
    })
    .await?;
    info!(max_connections = settings.max_connections, "database pool ready");
    Ok(pool)
}
