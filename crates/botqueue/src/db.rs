use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::error::QueueResult;

/// Connection pool knobs. The worker fills these from [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Turn off the planner's JIT on every new connection.
    pub disable_jit: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
            disable_jit: true,
        }
    }
}

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> QueueResult<PgPool> {
    let disable_jit = settings.disable_jit;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // claim queries are short; JIT compilation only adds latency
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> QueueResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
