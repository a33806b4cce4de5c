use rusqlite::{params, Connection};

use super::*;

/// Messages of a canonical conversation across all of its raw conversations,
/// oldest first. Text units are joined with newlines.
pub fn conversation_messages(
    conn: &Connection,
    canonical_conversation_id: i64,
) -> Result<Vec<ChatMessage>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT m.id,
                p.name,
                m.sent_at,
                m.unsent,
                (SELECT GROUP_CONCAT(t.text, char(10))
                   FROM message_text t WHERE t.message_id = m.id),
                (SELECT COUNT(*) FROM reaction r WHERE r.message_id = m.id)
         FROM message m
         JOIN person p ON p.id = m.sender
         JOIN conversation c ON c.id = p.conversation_id
         WHERE c.canonical_conversation_id = ?1
         ORDER BY m.sent_at ASC, m.id ASC",
    )?;
    let rows = stmt.query_map([canonical_conversation_id], |row| {
        Ok(ChatMessage {
            id: row.get(0)?,
            sender_name: row.get(1)?,
            sent_at: row.get(2)?,
            unsent: row.get(3)?,
            text: row.get(4)?,
            reaction_count: row.get(5)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

impl ChatDb {
    // =========================================================================
    // Messages and content
    // =========================================================================

    pub fn insert_message(&self, sender_id: i64, sent_at: i64, unsent: bool) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO message (sender, sent_at, unsent) VALUES (?1, ?2, ?3)",
                params![sender_id, sent_at, unsent],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn add_message_text(&self, message_id: i64, text: &str) -> Result<i64, DbError> {
        self.insert_content("message_text", "text", message_id, text)
    }

    pub fn add_message_image(&self, message_id: i64, image_uri: &str) -> Result<i64, DbError> {
        self.insert_content("message_image", "image_uri", message_id, image_uri)
    }

    pub fn add_message_video(&self, message_id: i64, video_uri: &str) -> Result<i64, DbError> {
        self.insert_content("message_video", "video_uri", message_id, video_uri)
    }

    pub fn add_message_gif(&self, message_id: i64, gif_uri: &str) -> Result<i64, DbError> {
        self.insert_content("message_gif", "gif_uri", message_id, gif_uri)
    }

    pub fn add_message_audio(
        &self,
        message_id: i64,
        audio_uri: &str,
        length_seconds: Option<i64>,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO message_audio (message_id, audio_uri, length_seconds)
                 VALUES (?1, ?2, ?3)",
                params![message_id, audio_uri, length_seconds],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn insert_reaction(
        &self,
        reactor_id: i64,
        message_id: i64,
        reaction: &str,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO reaction (reactor_id, message_id, reaction) VALUES (?1, ?2, ?3)",
                params![reactor_id, message_id, reaction],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn message_count(&self) -> Result<i64, DbError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM message", [], |row| row.get(0))
            .map_err(DbError::from)
    }

    pub fn conversation_messages(
        &self,
        canonical_conversation_id: i64,
    ) -> Result<Vec<ChatMessage>, DbError> {
        conversation_messages(&self.conn, canonical_conversation_id)
    }

    // Table and column names come from the fixed set above, never from input
    fn insert_content(
        &self,
        table: &'static str,
        column: &'static str,
        message_id: i64,
        value: &str,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                &format!("INSERT INTO {table} (message_id, {column}) VALUES (?1, ?2)"),
                params![message_id, value],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_conversation_messages_spans_merged_conversations() {
        let db = test_db();
        let fb = db.insert_export(export_source::MESSENGER_FACEBOOK, None, None).unwrap();
        let wa = db.insert_export(export_source::WHATSAPP, None, None).unwrap();
        let (c1, canonical) = db
            .import_conversation(fb, ConversationType::Dm, Some("Ana"), None)
            .unwrap();
        let c2 = db
            .insert_conversation(ConversationType::Dm, None, Some("Ana"), wa, canonical)
            .unwrap();
        let cp = db.insert_canonical_person(Some("Ana")).unwrap();
        let ana_fb = db.insert_person(c1, Some("Ana"), None, cp).unwrap();
        let ana_wa = db.insert_person(c2, Some("Ana W"), None, cp).unwrap();

        let late = db.insert_message(ana_fb, 200, false).unwrap();
        db.add_message_text(late, "second").unwrap();
        db.add_message_text(late, "line").unwrap();
        db.insert_reaction(ana_wa, late, "❤").unwrap();

        let early = db.insert_message(ana_wa, 100, false).unwrap();
        db.add_message_image(early, "photo.jpg").unwrap();
        db.add_message_audio(early, "voice.ogg", Some(12)).unwrap();

        let messages = db.conversation_messages(canonical).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, early);
        assert_eq!(messages[0].sender_name.as_deref(), Some("Ana W"));
        assert_eq!(messages[0].text, None);
        assert_eq!(messages[1].text.as_deref(), Some("second\nline"));
        assert_eq!(messages[1].reaction_count, 1);
        assert_eq!(db.message_count().unwrap(), 2);
    }

    #[test]
    fn test_content_cascades_with_message() {
        let db = test_db();
        let export = db.insert_export(export_source::WHATSAPP, None, None).unwrap();
        let (conversation, _) = db
            .import_conversation(export, ConversationType::Dm, Some("Ana"), None)
            .unwrap();
        let cp = db.insert_canonical_person(Some("Ana")).unwrap();
        let person = db.insert_person(conversation, Some("Ana"), None, cp).unwrap();
        let message = db.insert_message(person, 1, true).unwrap();
        db.add_message_video(message, "clip.mp4").unwrap();
        db.add_message_gif(message, "party.gif").unwrap();

        db.conn_ref()
            .execute("DELETE FROM message WHERE id = ?1", [message])
            .unwrap();
        for table in ["message_video", "message_gif"] {
            let left: i64 = db
                .conn_ref()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(left, 0, "{table} rows should cascade");
        }
    }
}
