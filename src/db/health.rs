//! Integrity checks and the destructive reset of the database files.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;

use super::{ChatDb, DbError};

/// Result of the startup integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHealth {
    pub ok: bool,
    pub errors: Vec<String>,
    /// True when the quick check failed and the full check was run.
    pub full_check_ran: bool,
}

impl DbHealth {
    pub fn healthy() -> Self {
        DbHealth {
            ok: true,
            errors: Vec::new(),
            full_check_ran: false,
        }
    }
}

/// Run `PRAGMA quick_check`, escalating to `PRAGMA integrity_check` only when
/// the quick check reports a problem.
pub fn check_health(conn: &Connection) -> DbHealth {
    let quick = match run_check(conn, "quick_check") {
        Ok(problems) if problems.is_empty() => return DbHealth::healthy(),
        Ok(problems) => problems,
        Err(e) => vec![e.to_string()],
    };
    log::warn!("quick_check reported {} problem(s), running integrity_check", quick.len());

    let errors = match run_check(conn, "integrity_check") {
        Ok(problems) if problems.is_empty() => quick,
        Ok(problems) => problems,
        Err(e) => vec![e.to_string()],
    };
    log::error!("Database integrity check failed: {}", errors.join("; "));

    DbHealth {
        ok: false,
        errors,
        full_check_ran: true,
    }
}

/// Every row of the check that is not the single word `ok`.
fn run_check(conn: &Connection, pragma: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA {pragma}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut problems = Vec::new();
    for row in rows {
        let line = row?;
        if line != "ok" {
            problems.push(line);
        }
    }
    Ok(problems)
}

/// The database file with its WAL and shared-memory companions.
pub fn database_files(path: &Path) -> [PathBuf; 3] {
    let base = path.as_os_str().to_os_string();
    let with_suffix = |suffix: &str| {
        let mut name = base.clone();
        name.push(suffix);
        PathBuf::from(name)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}

/// Delete the database files. Missing files are not an error.
///
/// Every connection to the database must be closed first.
pub fn delete_database_files(path: &Path) -> Result<usize, DbError> {
    let mut removed = 0;
    for file in database_files(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DbError::RemoveFile(e)),
        }
    }
    log::warn!("Deleted {} database file(s) at {}", removed, path.display());
    Ok(removed)
}

impl ChatDb {
    pub fn check_health(&self) -> DbHealth {
        check_health(&self.conn)
    }
}
