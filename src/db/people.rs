use rusqlite::params;

use super::*;

impl ChatDb {
    // =========================================================================
    // People
    // =========================================================================

    pub fn insert_canonical_person(&self, display_name: Option<&str>) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn
                .execute("INSERT INTO canonical_person (display_name) VALUES (?1)", [display_name])?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    /// Insert a participant of a raw conversation.
    pub fn insert_person(
        &self,
        conversation_id: i64,
        name: Option<&str>,
        avatar_uri: Option<&str>,
        canonical_person_id: i64,
    ) -> Result<i64, DbError> {
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO person (conversation_id, name, avatar_uri, canonical_person_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, name, avatar_uri, canonical_person_id],
            )?;
            Ok(db.conn.last_insert_rowid())
        })
    }

    pub fn people_for_conversation(&self, conversation_id: i64) -> Result<Vec<DbPerson>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, name, avatar_uri, canonical_person_id
             FROM person WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([conversation_id], |row| {
            Ok(DbPerson {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                name: row.get(2)?,
                avatar_uri: row.get(3)?,
                canonical_person_id: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}
