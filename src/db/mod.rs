//! SQLite-backed message store for imported chat exports.
//!
//! The database lives at `~/.chatvault/chats.db` by default. The external
//! importer writes raw exports into it; this crate owns the canonical layer
//! on top (merging, cleanup, deletion) and the live read side.
//!
//! All writes made through [`ChatDb::with_transaction`] are reported to the
//! attached [`ChangeBus`] after the outermost commit, so live queries never
//! observe a change before it is durable.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

use crate::live::changes::{ChangeBus, ChangeRecorder};

pub mod types;
pub use types::*;

mod conversations;
mod exports;
pub mod health;
mod messages;
mod people;

pub use conversations::list_chats;
pub use exports::{list_exports, DeleteExportReport};
pub use health::DbHealth;
pub use messages::conversation_messages;

/// Busy timeout shared by the writer and reader connections.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

pub struct ChatDb {
    conn: Connection,
    path: PathBuf,
    tx_depth: Cell<u32>,
    recorder: Option<ChangeRecorder>,
}

impl ChatDb {
    /// Borrow the underlying connection for ad-hoc queries.
    ///
    /// Writes made here bypass change capture. Use `with_transaction` for
    /// anything live queries should see.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// Calls nest: an inner call runs inside a savepoint of the outer
    /// transaction, and only the outermost commit publishes changes.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        let depth = self.tx_depth.get();
        let savepoint = format!("chatvault_sp_{depth}");

        if depth == 0 {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| E::from(DbError::from(e)))?;
        } else {
            self.conn
                .execute_batch(&format!("SAVEPOINT {savepoint}"))
                .map_err(|e| E::from(DbError::from(e)))?;
        }

        self.tx_depth.set(depth + 1);
        let result = f(self);
        self.tx_depth.set(depth);

        match result {
            Ok(val) => {
                if depth == 0 {
                    if let Err(e) = self.conn.execute_batch("COMMIT") {
                        let _ = self.conn.execute_batch("ROLLBACK");
                        self.discard_changes();
                        return Err(E::from(DbError::from(e)));
                    }
                    self.publish_changes();
                } else {
                    self.conn
                        .execute_batch(&format!("RELEASE {savepoint}"))
                        .map_err(|e| E::from(DbError::from(e)))?;
                }
                Ok(val)
            }
            Err(e) => {
                if depth == 0 {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    self.discard_changes();
                } else {
                    let _ = self.conn.execute_batch(&format!(
                        "ROLLBACK TO {savepoint}; RELEASE {savepoint}"
                    ));
                }
                Err(e)
            }
        }
    }

    /// Open a database at an explicit path, creating it if needed.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the live query readers run alongside the writer
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"
        ))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        // Cascades from export deletion depend on this
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn,
            path,
            tx_depth: Cell::new(0),
            recorder: None,
        })
    }

    /// Open a database at an explicit path in read-only mode.
    pub fn open_readonly_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            tx_depth: Cell::new(0),
            recorder: None,
        })
    }

    /// Start reporting committed writes to `bus`.
    pub fn attach_change_bus(&mut self, bus: ChangeBus) {
        let recorder = ChangeRecorder::new(bus);
        recorder.install(&self.conn);
        self.recorder = Some(recorder);
    }

    fn publish_changes(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.flush();
        }
    }

    fn discard_changes(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.discard();
        }
    }
}
