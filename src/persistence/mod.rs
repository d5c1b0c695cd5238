//! Relational mirror (PostgreSQL)
//!
//! The engine's in-memory stores are authoritative; this module mirrors
//! their state write-behind into a relational schema so ops and downstream
//! systems get durable, queryable records. No database trigger touches
//! balances - the Balance Store is the only balance mutator.

pub mod balances;
pub mod mirror;
pub mod orders;
pub mod schema;
pub mod trades;

pub use mirror::{Mirror, MirrorEffect};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
