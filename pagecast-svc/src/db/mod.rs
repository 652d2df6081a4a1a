//! Database access for pagecast-svc

pub mod books;
pub mod jobs;
pub mod pages;

use pagecast_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open the service database, creating it and its schema if needed
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    pagecast_common::db::init_database(db_path).await
}
