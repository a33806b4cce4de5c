//! Preferences that live outside the database and survive a reset of it.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    /// Delete the database files on next startup, before anything opens them.
    pub db_reset_pending: bool,
    /// Dismissed auto-merge suggestion keys.
    pub ignored_merge_suggestions: BTreeSet<String>,
}

/// Preferences backed by a JSON file. Every mutation is written through.
pub struct PreferenceStore {
    path: PathBuf,
    current: RwLock<Preferences>,
}

impl PreferenceStore {
    /// Load from `path`. A missing file yields defaults; an unreadable one is
    /// logged and replaced by defaults on the next write.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!(
                    "Ignoring unreadable preferences at {}: {}",
                    path.display(),
                    e
                );
                Preferences::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Preferences::default(),
            Err(e) => {
                log::warn!("Failed to read preferences at {}: {}", path.display(), e);
                Preferences::default()
            }
        };
        PreferenceStore {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Preferences {
        self.current.read().clone()
    }

    pub fn ignored_keys(&self) -> HashSet<String> {
        self.current
            .read()
            .ignored_merge_suggestions
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_ignored(&self, key: &str) -> bool {
        self.current.read().ignored_merge_suggestions.contains(key)
    }

    pub fn ignore(&self, key: &str) -> Result<(), CoreError> {
        self.update(|prefs| {
            prefs.ignored_merge_suggestions.insert(key.to_string());
        })
    }

    pub fn unignore(&self, key: &str) -> Result<(), CoreError> {
        self.update(|prefs| {
            prefs.ignored_merge_suggestions.remove(key);
        })
    }

    /// Flip a key's dismissed state. Returns true if it is now ignored.
    pub fn toggle(&self, key: &str) -> Result<bool, CoreError> {
        let mut ignored = false;
        self.update(|prefs| {
            ignored = if prefs.ignored_merge_suggestions.remove(key) {
                false
            } else {
                prefs.ignored_merge_suggestions.insert(key.to_string())
            };
        })?;
        Ok(ignored)
    }

    pub fn clear_ignored(&self) -> Result<(), CoreError> {
        self.update(|prefs| prefs.ignored_merge_suggestions.clear())
    }

    pub fn set_reset_pending(&self, pending: bool) -> Result<(), CoreError> {
        self.update(|prefs| prefs.db_reset_pending = pending)
    }

    /// Clear the reset flag, returning whether it was set.
    pub fn take_reset_pending(&self) -> Result<bool, CoreError> {
        let mut was_pending = false;
        self.update(|prefs| {
            was_pending = prefs.db_reset_pending;
            prefs.db_reset_pending = false;
        })?;
        Ok(was_pending)
    }

    /// Apply `mutate` and persist. Memory only changes once the file is written.
    fn update(&self, mutate: impl FnOnce(&mut Preferences)) -> Result<(), CoreError> {
        let mut guard = self.current.write();
        let mut next = guard.clone();
        mutate(&mut next);
        if next == *guard {
            return Ok(());
        }
        write_json_atomic(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

fn write_json_atomic(path: &Path, value: &Preferences) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                CoreError::Preferences(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }
    let temp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::Preferences(format!("Failed to serialize preferences: {}", e)))?;
    fs::write(&temp_path, payload).map_err(|e| {
        CoreError::Preferences(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    fs::rename(&temp_path, path).map_err(|e| {
        CoreError::Preferences(format!("Failed to replace {}: {}", path.display(), e))
    })
}
