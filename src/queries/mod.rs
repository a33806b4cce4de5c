//! The live queries the chat views observe.
//!
//! Each query declares its tables through the builder so the engine knows
//! which commits should re-run it.

use crate::db::{self, ChatMessage, ChatSummary, ExportSummary};
use crate::error::CoreError;
use crate::live::{LiveQuery, Table};
use crate::merge::{build_auto_merge_suggestions, AutoMergeSuggestion};

/// Chat list: one row per canonical conversation, most recent first.
pub fn chats_query() -> Result<LiveQuery<Vec<ChatSummary>>, CoreError> {
    LiveQuery::builder("chats")
        .from(Table::CanonicalConversation)
        .with_relation("conversations.export")
        .with_relation("conversations.people.messages")
        .build(db::list_chats)
}

/// Imported exports with their conversation counts, newest first.
pub fn exports_query() -> Result<LiveQuery<Vec<ExportSummary>>, CoreError> {
    LiveQuery::builder("exports")
        .from(Table::Export)
        .with_relation("conversations")
        .build(db::list_exports)
}

/// Messages of one canonical conversation, oldest first.
pub fn conversation_messages_query(
    canonical_conversation_id: i64,
) -> Result<LiveQuery<Vec<ChatMessage>>, CoreError> {
    LiveQuery::builder("conversation_messages")
        .from(Table::Message)
        .with_relation("sender.conversation")
        .with_relation("texts")
        .with_relation("reactions")
        .param(canonical_conversation_id)
        .build(move |conn| db::conversation_messages(conn, canonical_conversation_id))
}

/// Auto-merge suggestions, recomputed from the chat list on every change
/// that could move a chat in or out of a group.
///
/// Dismissed keys are filtered by the caller, since the ignore list lives
/// outside the database.
pub fn merge_suggestions_query() -> Result<LiveQuery<Vec<AutoMergeSuggestion>>, CoreError> {
    LiveQuery::builder("merge_suggestions")
        .from(Table::CanonicalConversation)
        .with_relation("conversations.export")
        .with_relation("conversations.people.messages")
        .build(|conn| Ok(build_auto_merge_suggestions(&db::list_chats(conn)?)))
}
