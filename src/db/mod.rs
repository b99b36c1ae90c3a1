pub mod key_value;
pub mod repository;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

pub use key_value::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use repository::{SqliteTaskStore, TaskStore};

/// Opens the device database and brings its schema up to date.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations/client").run(&pool).await?;
    Ok(pool)
}

/// In-memory device database. Each sqlite memory connection is its own
/// database, so the pool is capped at one connection.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations/client").run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    connect_in_memory()
        .await
        .expect("Failed to create test db")
}
