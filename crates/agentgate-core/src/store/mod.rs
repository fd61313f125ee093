//! Shared embedded-store plumbing for the admission engines.
//!
//! Every engine that persists state owns exactly one `SQLite` database,
//! opened through this module so all stores share the same pragma set and
//! the same forward-only migration mechanism.
//!
//! # Migrations
//!
//! Schema versions are tracked with `PRAGMA user_version`. Each engine
//! declares an ordered list of [`Migration`] steps; on open, every step
//! with a version greater than the store's current version is applied
//! inside a single transaction and the version is advanced. A store whose
//! version is *ahead* of the compiled migration list is rejected rather
//! than guessed at — downgrades are not supported.
//!
//! # Durability
//!
//! Stores run in WAL mode with `synchronous = NORMAL`, which survives
//! process crashes (the admission engines must keep their state across
//! restarts). `SQLITE_OPEN_NO_MUTEX` is safe because every connection is
//! guarded by its engine's own mutex.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Pragmas applied to every engine store on open.
const STORE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
";

/// Errors from store access or migration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The database could not be opened or created.
    #[error("failed to open store: {message}")]
    Open {
        /// Description of the open failure.
        message: String,
    },

    /// A migration step failed or the store version is unsupported.
    #[error("store migration failed: {message}")]
    Migration {
        /// Description of the migration failure.
        message: String,
    },

    /// The underlying store is unavailable mid-operation.
    ///
    /// Storage failures are never masked as allow/deny decisions; they
    /// propagate so the caller can surface an engine-unavailable
    /// condition.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the storage failure.
        message: String,
    },
}

/// A single forward-only schema migration step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Target `user_version` after this step is applied.
    pub version: i64,
    /// Batch SQL executed for this step.
    pub sql: &'static str,
}

/// Opens (or creates) an engine store at `path` and applies `migrations`.
///
/// # Errors
///
/// Returns [`StoreError::Open`] if the database cannot be opened and
/// [`StoreError::Migration`] if a migration step fails or the store was
/// written by a newer schema.
pub fn open_store(
    path: impl AsRef<Path>,
    migrations: &[Migration],
) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path.as_ref(),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| StoreError::Open {
        message: format!("{}: {e}", path.as_ref().display()),
    })?;

    conn.execute_batch(STORE_PRAGMAS)
        .map_err(|e| StoreError::Open {
            message: format!("failed to apply store pragmas: {e}"),
        })?;

    apply_migrations(&conn, migrations)?;
    Ok(conn)
}

/// Opens an in-memory store (tests, ephemeral engines) and applies
/// `migrations`.
///
/// # Errors
///
/// Returns [`StoreError::Open`] or [`StoreError::Migration`] as
/// [`open_store`] does.
pub fn open_in_memory(migrations: &[Migration]) -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
        message: format!("in-memory store: {e}"),
    })?;

    // WAL does not apply to in-memory databases; foreign keys still do.
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| StoreError::Open {
            message: format!("failed to apply store pragmas: {e}"),
        })?;

    apply_migrations(&conn, migrations)?;
    Ok(conn)
}

/// Applies every migration step newer than the store's `user_version`.
///
/// Returns the number of steps applied. Idempotent: re-running against an
/// up-to-date store applies nothing.
///
/// # Errors
///
/// Returns [`StoreError::Migration`] if a step fails, if the list is not
/// strictly ascending, or if the store version is ahead of the list.
pub fn apply_migrations(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, StoreError> {
    let current: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| StoreError::Migration {
            message: format!("failed to read user_version: {e}"),
        })?;

    let latest = migrations.last().map_or(0, |m| m.version);
    if current > latest {
        return Err(StoreError::Migration {
            message: format!(
                "store version {current} is newer than supported version {latest}"
            ),
        });
    }

    let mut applied = 0;
    let mut previous = 0;
    for migration in migrations {
        if migration.version <= previous {
            return Err(StoreError::Migration {
                message: format!(
                    "migration versions must be strictly ascending at version {}",
                    migration.version
                ),
            });
        }
        previous = migration.version;

        if migration.version <= current {
            continue;
        }

        conn.execute_batch(&format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            migration.sql, migration.version
        ))
        .map_err(|e| StoreError::Migration {
            message: format!("migration to version {} failed: {e}", migration.version),
        })?;
        applied += 1;
    }

    if applied > 0 {
        tracing::debug!(from = current, to = latest, steps = applied, "store migrated");
    }
    Ok(applied)
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
///
/// Saturates rather than failing on clock anomalies; persisted timestamp
/// columns are `INTEGER`, so the value is clamped into `i64` range.
#[must_use]
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
