use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::*;

/// What an export deletion removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteExportReport {
    pub export_id: i64,
    pub existed: bool,
    pub conversations_removed: usize,
    pub orphans_removed: usize,
}

/// All exports, newest first, with the number of raw conversations each holds.
pub fn list_exports(conn: &Connection) -> Result<Vec<ExportSummary>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.source, e.imported_at, e.meta_json, COUNT(c.id)
         FROM export e
         LEFT JOIN conversation c ON c.export_id = e.id
         GROUP BY e.id
         ORDER BY e.imported_at DESC, e.id DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ExportSummary {
            id: row.get(0)?,
            source: row.get(1)?,
            imported_at: row.get(2)?,
            meta_json: row.get(3)?,
            conversation_count: row.get(4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

impl ChatDb {
    // =========================================================================
    // Exports
    // =========================================================================

    pub fn insert_export(
        &self,
        source: &str,
        checksum: Option<&str>,
        meta_json: Option<&str>,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO export (source, checksum, meta_json) VALUES (?1, ?2, ?3)",
                params![source, checksum, meta_json],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn get_export(&self, id: i64) -> Result<Option<DbExport>, DbError> {
        self.conn
            .query_row(
                "SELECT id, source, checksum, imported_at, meta_json FROM export WHERE id = ?1",
                [id],
                map_export_row,
            )
            .optional()
            .map_err(DbError::from)
    }

    /// Find a previous import of the same archive.
    pub fn find_export_by_checksum(&self, checksum: &str) -> Result<Option<DbExport>, DbError> {
        self.conn
            .query_row(
                "SELECT id, source, checksum, imported_at, meta_json
                 FROM export WHERE checksum = ?1
                 ORDER BY id LIMIT 1",
                [checksum],
                map_export_row,
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn list_exports(&self) -> Result<Vec<ExportSummary>, DbError> {
        list_exports(&self.conn)
    }

    /// Delete an export and everything imported from it.
    ///
    /// The schema cascades the deletion through conversations, people,
    /// messages, message content and reactions. Canonical conversations left
    /// without any conversation are then removed in the same transaction.
    pub fn delete_export(&self, id: i64) -> Result<DeleteExportReport, DbError> {
        let report = self.with_transaction(|db| -> Result<DeleteExportReport, DbError> {
            let conversations: i64 = db.conn.query_row(
                "SELECT COUNT(*) FROM conversation WHERE export_id = ?1",
                [id],
                |row| row.get(0),
            )?;
            let deleted = db.conn.execute("DELETE FROM export WHERE id = ?1", [id])?;
            let orphans_removed = db.cleanup_orphaned_canonical_conversations()?;

            Ok(DeleteExportReport {
                export_id: id,
                existed: deleted > 0,
                conversations_removed: if deleted > 0 { conversations as usize } else { 0 },
                orphans_removed,
            })
        })?;

        if report.existed {
            log::info!(
                "Deleted export {} ({} conversations, {} orphaned chats removed)",
                id,
                report.conversations_removed,
                report.orphans_removed
            );
        } else {
            log::warn!("Export {} not found, nothing deleted", id);
        }
        Ok(report)
    }
}

fn map_export_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbExport> {
    Ok(DbExport {
        id: row.get(0)?,
        source: row.get(1)?,
        checksum: row.get(2)?,
        imported_at: row.get(3)?,
        meta_json: row.get(4)?,
    })
}
