//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows one writer at a time, so ledger writes (step appends,
//! attempts, lease updates) go through a single-connection writer pool while
//! status queries and replay loads use a small reader pool.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const READER_CONNECTIONS: u32 = 8;

/// Split read/write pool for SQLite with WAL mode.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if missing) the database and run migrations on the writer.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(database_url, "opened ledger database");
        Ok(Self { reader, writer })
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

/// Data directory: `WAYSTATION_DATA_DIR`, else `~/.waystation`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WAYSTATION_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".waystation")
}

/// `sqlite://` URL of the ledger database inside `data_dir`.
pub fn database_url_in(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join("waystation.db").display())
}

pub fn default_database_url() -> String {
    database_url_in(&default_data_dir())
}
