//! SQLite connection bootstrap shared by every primitive store for one
//! logical database.
//!
//! Mirrors the teacher's `Storage::new`/`migrate`: WAL journal mode for
//! crash-safe persistence, a fixed ordered list of embedded migration files
//! applied statement-by-statement, idempotent (`CREATE TABLE IF NOT
//! EXISTS`) so `connect` is safe to call repeatedly.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open (creating if missing) a WAL-mode SQLite database at `path` and run
/// every migration against it. `path` may be `"sqlite::memory:"`-style for
/// ephemeral databases.
///
/// An in-memory path is pinned to a single pooled connection: each fresh
/// connection to `:memory:` gets its own anonymous database, so a pool free
/// to open more than one connection could split writes and reads across two
/// separate databases.
pub async fn connect(path: &str) -> anyhow::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(path)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let mut pool_opts = SqlitePoolOptions::new();
    if path.contains(":memory:") {
        pool_opts = pool_opts.max_connections(1);
    }
    let pool = pool_opts.connect_with(opts).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Apply all migrations to an already-open pool (used by in-memory test
/// pools created directly via `SqlitePool::connect("sqlite::memory:")`).
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    for sql in [
        include_str!("migrations/001_leases.sql"),
        include_str!("migrations/002_outbox.sql"),
        include_str!("migrations/003_inbox.sql"),
        include_str!("migrations/004_scheduler.sql"),
        include_str!("migrations/005_external_effects.sql"),
    ] {
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
    }
    Ok(())
}

/// A fresh in-memory database for one test. Pinned to a single pooled
/// connection: SQLite's `:memory:` URI gives each physical connection its
/// own anonymous database, so a pool free to open more than one connection
/// could silently split a test's writes and reads across two separate
/// databases.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
    }
}
