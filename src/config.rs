//! Runtime configuration, read from `~/.chatvault/config.json`.
//!
//! Every field has a default, so a missing file is not an error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const DEFAULT_DATABASE_FILE: &str = "chats.db";
const DEFAULT_PREFERENCES_FILE: &str = "preferences.json";
const DEFAULT_CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Directory holding the database and the preferences file.
    pub data_dir: PathBuf,
    pub database_file: String,
    pub preferences_file: String,
    /// Buffered change events per live query before it falls back to a
    /// full re-run.
    pub change_channel_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            data_dir: default_data_dir(),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            preferences_file: DEFAULT_PREFERENCES_FILE.to_string(),
            change_channel_capacity: DEFAULT_CHANGE_CHANNEL_CAPACITY,
        }
    }
}

impl CoreConfig {
    /// Defaults rooted at `dir` instead of the home directory.
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        CoreConfig {
            data_dir: dir.into(),
            ..CoreConfig::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join(&self.preferences_file)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.database_file.trim().is_empty() {
            return Err(CoreError::Config("databaseFile must not be empty".into()));
        }
        if self.preferences_file.trim().is_empty() {
            return Err(CoreError::Config("preferencesFile must not be empty".into()));
        }
        if self.change_channel_capacity == 0 {
            return Err(CoreError::Config(
                "changeChannelCapacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".chatvault"))
        .unwrap_or_else(|| PathBuf::from(".chatvault"))
}

pub fn config_path() -> Result<PathBuf, CoreError> {
    let home = dirs::home_dir().ok_or_else(|| CoreError::Config("Could not find home directory".into()))?;
    Ok(home.join(".chatvault").join("config.json"))
}

/// Load configuration from ~/.chatvault/config.json
pub fn load_config() -> Result<CoreConfig, CoreError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<CoreConfig, CoreError> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(CoreConfig::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("Failed to read config: {}", e)))?;
    let config: CoreConfig = serde_json::from_str(&content)
        .map_err(|e| CoreError::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
}
