//! Auto-merge suggestions computed from the chat list.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::db::{ChatSummary, ConversationType};

/// A group of same-named direct messages that look like one conversation
/// imported more than once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMergeSuggestion {
    /// `"{normalized name}|{type}"`, stable across recomputation.
    pub key: String,
    /// Members sorted by message count, target first.
    pub chats: Vec<ChatSummary>,
    pub target: ChatSummary,
}

impl AutoMergeSuggestion {
    /// Member ids in merge order, target first.
    pub fn member_ids(&self) -> Vec<i64> {
        self.chats.iter().map(|c| c.id).collect()
    }

    /// Ids the target would absorb.
    pub fn absorbed_ids(&self) -> Vec<i64> {
        self.chats
            .iter()
            .map(|c| c.id)
            .filter(|id| *id != self.target.id)
            .collect()
    }
}

/// Combined figures for a set of chats, as they would look once merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedChatSummary {
    pub message_count: i64,
    pub participant_count: i64,
    pub last_message_at: Option<i64>,
    pub sources: Vec<String>,
}

/// Collapse whitespace runs, trim and lowercase.
pub fn normalize_conversation_name(name: Option<&str>) -> String {
    name.unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn suggestion_key(normalized_name: &str, conversation_type: ConversationType) -> String {
    format!("{normalized_name}|{conversation_type}")
}

/// Group direct messages by normalized name and propose one merge per group.
///
/// A group is dropped entirely when any export source appears more than
/// once across its members: two chats from the same source with the same
/// name are most likely two different people. Groups are emitted in the
/// order their first member appears in `chats`.
pub fn build_auto_merge_suggestions(chats: &[ChatSummary]) -> Vec<AutoMergeSuggestion> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&ChatSummary>> = HashMap::new();

    for chat in chats {
        if chat.conversation_type != ConversationType::Dm {
            continue;
        }
        let normalized = normalize_conversation_name(chat.name.as_deref());
        if normalized.is_empty() {
            continue;
        }
        let key = suggestion_key(&normalized, chat.conversation_type);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(chat);
    }

    let mut suggestions = Vec::new();
    for key in order {
        let Some(mut members) = groups.remove(&key) else {
            continue;
        };
        if members.len() < 2 {
            continue;
        }
        if has_repeated_source(&members) {
            log::debug!("Skipping merge suggestion {}: a source repeats", key);
            continue;
        }

        members.sort_by(|a, b| {
            b.message_count
                .cmp(&a.message_count)
                .then_with(|| a.id.cmp(&b.id))
        });
        let chats: Vec<ChatSummary> = members.into_iter().cloned().collect();
        let target = chats[0].clone();
        suggestions.push(AutoMergeSuggestion { key, chats, target });
    }
    suggestions
}

fn has_repeated_source(members: &[&ChatSummary]) -> bool {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for source in members.iter().flat_map(|c| c.sources.iter()) {
        *counts.entry(source.as_str()).or_default() += 1;
    }
    counts.values().any(|n| *n > 1)
}

/// Suggestions whose key has not been dismissed.
pub fn actionable_suggestions(
    suggestions: &[AutoMergeSuggestion],
    ignored: &HashSet<String>,
) -> Vec<AutoMergeSuggestion> {
    suggestions
        .iter()
        .filter(|s| !ignored.contains(&s.key))
        .cloned()
        .collect()
}

pub fn merged_summary(chats: &[ChatSummary]) -> MergedChatSummary {
    let sources: BTreeSet<&str> = chats
        .iter()
        .flat_map(|c| c.sources.iter().map(String::as_str))
        .collect();
    MergedChatSummary {
        message_count: chats.iter().map(|c| c.message_count).sum(),
        participant_count: chats.iter().map(|c| c.participant_count).sum(),
        last_message_at: chats.iter().filter_map(|c| c.last_message_at).max(),
        sources: sources.into_iter().map(String::from).collect(),
    }
}

/// Name to show for a chat, falling back on its type.
pub fn display_name(chat: &ChatSummary) -> String {
    match chat.name.as_deref() {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => match chat.conversation_type {
            ConversationType::Dm => "Direct Message".to_string(),
            ConversationType::Group => "Group Chat".to_string(),
        },
    }
}
