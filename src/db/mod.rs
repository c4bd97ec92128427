//! Database connection pool, migrations, and health check.
//!
//! The pool is shared by every dispatcher instance in the process. All
//! cross-instance coordination happens through Postgres row locks.

pub mod work;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use work::{PgBatch, PgQueueStore};

/// Database handle. Owns the connection pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    ///
    /// Failing here is fatal for the process: nothing has been claimed yet,
    /// so there is no partial state to clean up.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("cannot open database: {e}")))?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Queue store over this pool, applying `max_retries` to eligibility.
    pub fn queue_store(&self, max_retries: u32) -> PgQueueStore {
        PgQueueStore::new(self.pool.clone(), max_retries)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
