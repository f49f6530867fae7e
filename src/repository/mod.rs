//! Shared SQLite plumbing for the rusqlite-backed stores.
//!
//! Every store opens a fresh connection per operation and runs it on the
//! blocking pool, so async callers never hold a connection across awaits.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Open a connection with the pragmas every store relies on.
pub fn connect(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA busy_timeout = 30000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(conn)
}

/// Run `f` against a fresh connection on the blocking thread pool.
///
/// `E` must absorb both rusqlite errors and join failures.
pub async fn with_connection<T, E, F>(db_path: &Path, f: F) -> Result<T, E>
where
    T: Send + 'static,
    E: From<rusqlite::Error> + From<tokio::task::JoinError> + Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
{
    let path: PathBuf = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut conn = connect(&path)?;
        f(&mut conn)
    })
    .await?
}

/// Format a timestamp with fixed precision so TEXT comparison orders it.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string from the database.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
