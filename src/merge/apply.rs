//! Merge transactions over canonical conversations.

use std::collections::HashSet;

use rusqlite::params;
use serde::Serialize;

use super::suggestions::{actionable_suggestions, build_auto_merge_suggestions, AutoMergeSuggestion};
use crate::db::{list_chats, ChatDb, ConversationType, DbError};
use crate::error::CoreError;

/// Outcome of a merge, manual or batched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Target canonical id of every applied group, in order.
    pub targets: Vec<i64>,
    pub conversations_reassigned: usize,
    pub canonical_removed: Vec<i64>,
    pub orphans_removed: usize,
    /// Suggestion keys skipped because their target no longer exists.
    pub skipped: Vec<String>,
}

impl ChatDb {
    // =========================================================================
    // Canonical conversation merging
    // =========================================================================

    /// Merge the selected canonical conversations into the first one.
    ///
    /// Every raw conversation of the other ids is reassigned to the target,
    /// the emptied canonical rows are deleted and an orphan cleanup runs, all
    /// in one transaction. Fails without writing when fewer than two distinct
    /// ids are given, an id does not exist, or a member is not a direct message.
    pub fn merge_canonical_conversations(&self, selection: &[i64]) -> Result<MergeReport, CoreError> {
        let ids = distinct_in_order(selection);
        if ids.len() < 2 {
            return Err(CoreError::validation(format!(
                "merging needs at least two distinct conversations, got {}",
                ids.len()
            )));
        }

        let report = self
            .with_transaction(|db| -> Result<MergeReport, CoreError> {
                db.validate_merge_group(&ids)?;

                let mut report = MergeReport::default();
                db.absorb_into(ids[0], &ids[1..], &mut report)?;
                report.orphans_removed = db.cleanup_orphaned_canonical_conversations()?;
                Ok(report)
            })
            .map_err(|e| e.into_transaction("merge"))?;

        log::info!(
            "Merged canonical conversations {:?} into {} ({} conversations reassigned)",
            report.canonical_removed,
            ids[0],
            report.conversations_reassigned
        );
        Ok(report)
    }

    /// Apply a batch of suggestions in one transaction with a single cleanup
    /// pass at the end.
    ///
    /// A suggestion whose target has disappeared since it was computed is
    /// skipped and reported in [`MergeReport::skipped`].
    pub fn apply_merge_suggestions(
        &self,
        suggestions: &[AutoMergeSuggestion],
    ) -> Result<MergeReport, CoreError> {
        let report = self
            .with_transaction(|db| -> Result<MergeReport, CoreError> {
                let mut report = MergeReport::default();
                for suggestion in suggestions {
                    let target = suggestion.target.id;
                    if db.get_canonical_conversation(target)?.is_none() {
                        log::warn!(
                            "Skipping merge suggestion {}: target {} no longer exists",
                            suggestion.key,
                            target
                        );
                        report.skipped.push(suggestion.key.clone());
                        continue;
                    }
                    db.absorb_into(target, &suggestion.absorbed_ids(), &mut report)?;
                }
                report.orphans_removed = db.cleanup_orphaned_canonical_conversations()?;
                Ok(report)
            })
            .map_err(|e| e.into_transaction("auto-merge"))?;

        log::info!(
            "Applied {} merge suggestion(s), {} skipped",
            report.targets.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Recompute suggestions from the current chat list and apply every one
    /// not in `ignored`, reading and writing inside the same transaction.
    pub fn apply_auto_merge(&self, ignored: &HashSet<String>) -> Result<MergeReport, CoreError> {
        self.with_transaction(|db| -> Result<MergeReport, CoreError> {
            let chats = list_chats(db.conn_ref())?;
            let suggestions = build_auto_merge_suggestions(&chats);
            db.apply_merge_suggestions(&actionable_suggestions(&suggestions, ignored))
        })
        .map_err(|e| e.into_transaction("auto-merge"))
    }

    /// Delete every canonical conversation no raw conversation points at.
    /// Returns the number of rows deleted.
    pub fn cleanup_orphaned_canonical_conversations(&self) -> Result<usize, DbError> {
        let removed = self.with_transaction(|db| -> Result<usize, DbError> {
            let removed = db.conn_ref().execute(
                "DELETE FROM canonical_conversation
                 WHERE NOT EXISTS (
                     SELECT 1 FROM conversation c
                     WHERE c.canonical_conversation_id = canonical_conversation.id
                 )",
                [],
            )?;
            Ok(removed)
        })?;
        if removed > 0 {
            log::info!("Removed {} orphaned canonical conversation(s)", removed);
        }
        Ok(removed)
    }

    fn validate_merge_group(&self, ids: &[i64]) -> Result<(), CoreError> {
        for id in ids {
            let canonical = self.get_canonical_conversation(*id)?.ok_or_else(|| {
                CoreError::validation(format!("conversation {id} does not exist"))
            })?;
            if canonical.conversation_type != ConversationType::Dm {
                return Err(CoreError::validation(format!(
                    "conversation {id} is a {} chat; only direct messages can be merged",
                    canonical.conversation_type
                )));
            }
        }
        Ok(())
    }

    /// Point every conversation of `absorbed` at `target` and delete the
    /// emptied canonical rows.
    fn absorb_into(
        &self,
        target: i64,
        absorbed: &[i64],
        report: &mut MergeReport,
    ) -> Result<(), DbError> {
        let conn = self.conn_ref();
        for id in absorbed.iter().filter(|id| **id != target) {
            report.conversations_reassigned += conn.execute(
                "UPDATE conversation SET canonical_conversation_id = ?1
                 WHERE canonical_conversation_id = ?2",
                params![target, id],
            )?;
            let deleted = conn.execute(
                "DELETE FROM canonical_conversation
                 WHERE id = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM conversation WHERE canonical_conversation_id = ?1
                   )",
                [id],
            )?;
            if deleted > 0 {
                report.canonical_removed.push(*id);
            }
        }
        report.targets.push(target);
        Ok(())
    }
}

fn distinct_in_order(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
