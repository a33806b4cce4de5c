//! Shared type definitions for the database layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to remove database file: {0}")]
    RemoveFile(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Reader connection error: {0}")]
    Reader(String),

    #[error("Unknown conversation type: {0}")]
    UnknownConversationType(String),
}

/// Conversation kind shared by raw and canonical conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationType {
    #[serde(rename = "dm")]
    Dm,
    #[serde(rename = "group")]
    Group,
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Dm => "dm",
            ConversationType::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DbError> {
        match value {
            "dm" => Ok(ConversationType::Dm),
            "group" => Ok(ConversationType::Group),
            other => Err(DbError::UnknownConversationType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConversationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::ToSql for ConversationType {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
    }
}

impl rusqlite::types::FromSql for ConversationType {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let text = value.as_str()?;
        ConversationType::parse(text)
            .map_err(|e| rusqlite::types::FromSqlError::Other(e.to_string().into()))
    }
}

/// Known export source identifiers written by the importers.
pub mod export_source {
    pub const MESSENGER_FACEBOOK: &str = "messenger:facebook";
    pub const MESSENGER_E2E: &str = "messenger:e2e";
    pub const WHATSAPP: &str = "whatsapp";
}

/// A row from the `export` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbExport {
    pub id: i64,
    pub source: String,
    pub checksum: Option<String>,
    /// Epoch seconds.
    pub imported_at: i64,
    pub meta_json: Option<String>,
}

/// An export together with the number of raw conversations it contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub id: i64,
    pub source: String,
    pub imported_at: i64,
    pub meta_json: Option<String>,
    pub conversation_count: i64,
}

/// A row from the `canonical_conversation` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCanonicalConversation {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub name: Option<String>,
    pub created_at: i64,
}

/// A row from the `conversation` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConversation {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub image_uri: Option<String>,
    pub name: Option<String>,
    pub export_id: i64,
    pub canonical_conversation_id: i64,
}

/// A row from the `person` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPerson {
    pub id: i64,
    pub conversation_id: i64,
    pub name: Option<String>,
    pub avatar_uri: Option<String>,
    pub canonical_person_id: i64,
}

/// A row from the `message` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMessage {
    pub id: i64,
    pub sender_id: i64,
    /// Epoch seconds.
    pub sent_at: i64,
    pub unsent: bool,
}

/// One row of the chat list: a canonical conversation with aggregates
/// computed across every raw conversation attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// Canonical conversation id.
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub image_uri: Option<String>,
    pub participant_count: i64,
    pub message_count: i64,
    pub last_message_at: Option<i64>,
    /// Distinct export sources contributing to this chat.
    pub sources: Vec<String>,
}

/// A message of a canonical conversation, flattened for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sender_name: Option<String>,
    pub sent_at: i64,
    pub unsent: bool,
    pub text: Option<String>,
    pub reaction_count: i64,
}
