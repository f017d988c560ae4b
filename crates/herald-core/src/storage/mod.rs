//! Database access layer implementing the repository pattern for delivery
//! persistence.
//!
//! Repositories translate between domain models and database rows so the
//! dispatch pipeline never touches SQL directly. All database operations go
//! through this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod deliveries;
pub mod endpoints;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
///
/// Entry point for every database operation in herald. Holds a shared
/// connection pool and exposes one repository per table.
#[derive(Clone)]
pub struct Storage {
    /// Repository for endpoint configuration.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for the delivery ledger.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for the append-only attempt log.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool behind an Arc.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Like [`Storage::new`], but endpoint URL validation accepts plain
    /// `http://`. Meant for local development against receivers without
    /// TLS.
    pub fn allowing_insecure_urls(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::allowing_insecure_urls(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.deliveries.pool()).await?;

        Ok(())
    }
}
