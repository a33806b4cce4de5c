//! Canonical conversation merging.
//!
//! Suggestions are pure functions of the chat list. Applying them, manual
//! merges and orphan cleanup are `ChatDb` methods that run as single
//! transactions.

mod apply;
mod suggestions;

pub use apply::MergeReport;
pub use suggestions::{
    actionable_suggestions, build_auto_merge_suggestions, display_name, merged_summary,
    normalize_conversation_name, suggestion_key, AutoMergeSuggestion, MergedChatSummary,
};
