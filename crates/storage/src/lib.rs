//! Storage helpers for Postgres access.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPoolOptions};

pub mod audit;
pub mod booking;

pub use sqlx::PgPool;

pub use audit::SecurityEventRepository;
pub use booking::{BookingRepository, CorruptRow};

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    /// Wrap an existing pool in an `Arc` so it can be cloned safely.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Borrow the underlying `PgPool`.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::ops::Deref for StoragePool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        self.pool()
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Applies the bundled SQL migrations.
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    MIGRATOR
        .run(pool.pool())
        .await
        .context("running SQLx migrations failed")
}
