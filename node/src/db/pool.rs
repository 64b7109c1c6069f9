//! Database connection pool management.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create a new database connection pool.
///
/// An in-memory database lives and dies with its connection, so
/// `sqlite::memory:` URLs get a single connection that is never recycled.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<Pool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
    } else {
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
    }
}

/// Run database migrations.
pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
