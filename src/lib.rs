//! Results access and calculation engine for a microsimulation model
//! database: resolves model/run metadata, compiles a small aggregate
//! calculation language against accumulators or microdata into SQL, streams
//! paged results back out, and unlinks deleted runs while preserving values
//! still shared with sibling runs through a base run.
//!
//! The engine speaks to whichever of sqlite/mysql/postgres the caller's
//! [`config::Config::db_driver`] names through a small [`facet::DialectFacet`]
//! seam, issuing the same already-built SQL text through `sqlx`'s `Any`
//! driver rather than threading a generic database type parameter through
//! every module.

use sqlx::any::{AnyPool, AnyPoolOptions};
use std::sync::Arc;

pub mod builtin;
pub mod catalog;
pub mod cell;
pub mod compile;
pub mod config;
pub mod error;
pub mod expr;
pub mod facet;
pub mod genquery;
pub mod orchestrator;
pub mod parse;
pub mod reader;
pub mod run;
mod util;

pub use error::{Error, Result};

/// Cheap-clone handle to the engine's connection pool. Owns connection
/// lifecycle only; the modules that issue queries ([`run::RunDeleter`],
/// [`reader::Reader`]) borrow the underlying pool directly rather than this
/// wrapper, so they stay usable from call sites (tests, orchestration code)
/// that already have a bare `&AnyPool` and no need for the `Arc`.
#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<AnyPool>,
}

impl DbHandle {
    /// Open a pool against `cfg.db_connection` using the driver implied by
    /// `cfg.db_driver`. The driver-specific sqlx feature (`sqlite`/`mysql`/
    /// `postgres`) must be compiled in for the connection string to resolve.
    pub async fn connect(cfg: &config::Config) -> Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(&cfg.db_connection)
            .await
            .map_err(|e| Error::io("open connection pool", e))?;
        Ok(DbHandle { pool: Arc::new(pool) })
    }

    pub fn from_pool(pool: AnyPool) -> Self {
        DbHandle { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}
