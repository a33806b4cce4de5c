use rusqlite::{params, Connection, OptionalExtension};

use super::*;

/// Chat list: every canonical conversation with aggregates across its raw
/// conversations, most recent activity first. Chats without messages sort last.
pub fn list_chats(conn: &Connection) -> Result<Vec<ChatSummary>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT cc.id,
                cc.name,
                cc.type,
                MIN(c.image_uri),
                COUNT(DISTINCT p.canonical_person_id),
                COUNT(m.id),
                MAX(m.sent_at),
                GROUP_CONCAT(DISTINCT e.source)
         FROM canonical_conversation cc
         LEFT JOIN conversation c ON c.canonical_conversation_id = cc.id
         LEFT JOIN export e ON e.id = c.export_id
         LEFT JOIN person p ON p.conversation_id = c.id
         LEFT JOIN message m ON m.sender = p.id
         GROUP BY cc.id, cc.name, cc.type
         ORDER BY MAX(m.sent_at) DESC, cc.id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let sources: Option<String> = row.get(7)?;
        Ok(ChatSummary {
            id: row.get(0)?,
            name: row.get(1)?,
            conversation_type: row.get(2)?,
            image_uri: row.get(3)?,
            participant_count: row.get(4)?,
            message_count: row.get(5)?,
            last_message_at: row.get(6)?,
            sources: split_sources(sources.as_deref()),
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

fn split_sources(csv: Option<&str>) -> Vec<String> {
    let mut sources: Vec<String> = csv
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    sources.sort();
    sources.dedup();
    sources
}

impl ChatDb {
    // =========================================================================
    // Conversations
    // =========================================================================

    pub fn insert_canonical_conversation(
        &self,
        conversation_type: ConversationType,
        name: Option<&str>,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO canonical_conversation (type, name) VALUES (?1, ?2)",
                params![conversation_type, name],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn insert_conversation(
        &self,
        conversation_type: ConversationType,
        image_uri: Option<&str>,
        name: Option<&str>,
        export_id: i64,
        canonical_conversation_id: i64,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO conversation
                    (type, image_uri, name, export_id, canonical_conversation_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation_type,
                    image_uri,
                    name,
                    export_id,
                    canonical_conversation_id
                ],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    /// Import one raw conversation under a fresh canonical conversation of
    /// its own. Returns `(conversation_id, canonical_conversation_id)`.
    pub fn import_conversation(
        &self,
        export_id: i64,
        conversation_type: ConversationType,
        name: Option<&str>,
        image_uri: Option<&str>,
    ) -> Result<(i64, i64), DbError> {
        self.with_transaction(|db| {
            let canonical_id = db.insert_canonical_conversation(conversation_type, name)?;
            let conversation_id =
                db.insert_conversation(conversation_type, image_uri, name, export_id, canonical_id)?;
            Ok((conversation_id, canonical_id))
        })
    }

    pub fn get_canonical_conversation(
        &self,
        id: i64,
    ) -> Result<Option<DbCanonicalConversation>, DbError> {
        self.conn
            .query_row(
                "SELECT id, type, name, created_at FROM canonical_conversation WHERE id = ?1",
                [id],
                map_canonical_row,
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn canonical_conversations(&self) -> Result<Vec<DbCanonicalConversation>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, name, created_at FROM canonical_conversation ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_canonical_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Raw conversations attached to a canonical conversation.
    pub fn conversations_for_canonical(
        &self,
        canonical_conversation_id: i64,
    ) -> Result<Vec<DbConversation>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, image_uri, name, export_id, canonical_conversation_id
             FROM conversation
             WHERE canonical_conversation_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([canonical_conversation_id], |row| {
            Ok(DbConversation {
                id: row.get(0)?,
                conversation_type: row.get(1)?,
                image_uri: row.get(2)?,
                name: row.get(3)?,
                export_id: row.get(4)?,
                canonical_conversation_id: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn list_chats(&self) -> Result<Vec<ChatSummary>, DbError> {
        list_chats(&self.conn)
    }
}

fn map_canonical_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCanonicalConversation> {
    Ok(DbCanonicalConversation {
        id: row.get(0)?,
        conversation_type: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}
