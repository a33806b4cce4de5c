//! The data-provider root: owns the writer connection, the change and
//! invalidation buses, the live query engine and the preferences.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::CoreConfig;
use crate::db::health::delete_database_files;
use crate::db::{ChatDb, ChatSummary, DbHealth, DeleteExportReport, ExportSummary};
use crate::error::CoreError;
use crate::importer::{ImportRequest, ImportSession, Importer};
use crate::live::{ChangeBus, InvalidationBus, LiveQuery, LiveQueryEngine, LiveQueryHandle};
use crate::merge::{
    actionable_suggestions, build_auto_merge_suggestions, AutoMergeSuggestion, MergeReport,
};
use crate::preferences::PreferenceStore;

pub struct AppState {
    config: CoreConfig,
    db: Mutex<Option<ChatDb>>,
    changes: ChangeBus,
    invalidation: InvalidationBus,
    live: LiveQueryEngine,
    preferences: PreferenceStore,
    health: RwLock<DbHealth>,
}

impl AppState {
    /// Open the store described by `config`.
    ///
    /// A reset requested in a previous session is applied first. A database
    /// that fails to open or fails its integrity check does not make this
    /// fail: the state comes up unhealthy and only the reset flow works.
    pub fn open(config: CoreConfig) -> Result<Self, CoreError> {
        let preferences = PreferenceStore::load(config.preferences_path());
        let db_path = config.database_path();

        if preferences.take_reset_pending()? {
            log::warn!("Applying pending database reset");
            delete_database_files(&db_path)?;
        }

        let changes = ChangeBus::new(config.change_channel_capacity);
        let (db, health) = match open_writer(&db_path, &changes) {
            Ok(db) => {
                let health = db.check_health();
                (Some(db), health)
            }
            Err(e) => {
                log::error!("Failed to open database at {}: {}", db_path.display(), e);
                let health = DbHealth {
                    ok: false,
                    errors: vec![e.to_string()],
                    full_check_ran: false,
                };
                (None, health)
            }
        };
        if health.ok {
            log::info!("Database opened at {}", db_path.display());
        }

        let live = LiveQueryEngine::new(&db_path, changes.clone());
        Ok(AppState {
            config,
            db: Mutex::new(db),
            changes,
            invalidation: InvalidationBus::new(),
            live,
            preferences,
            health: RwLock::new(health),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.database_path()
    }

    pub fn changes(&self) -> &ChangeBus {
        &self.changes
    }

    pub fn invalidation(&self) -> &InvalidationBus {
        &self.invalidation
    }

    pub fn live(&self) -> &LiveQueryEngine {
        &self.live
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn health(&self) -> DbHealth {
        self.health.read().clone()
    }

    pub fn ensure_healthy(&self) -> Result<(), CoreError> {
        let health = self.health.read();
        if health.ok {
            Ok(())
        } else {
            Err(CoreError::StoreCorruption {
                errors: health.errors.clone(),
            })
        }
    }

    // =========================================================================
    // Reset
    // =========================================================================

    /// Mark the database for deletion on next startup.
    pub fn request_reset(&self) -> Result<(), CoreError> {
        log::warn!("Database reset requested for next startup");
        self.preferences.set_reset_pending(true)
    }

    /// Delete the database files now and start over with an empty store.
    ///
    /// Live queries stay subscribed: their readers reopen on the new file and
    /// every query re-runs once.
    pub fn reset_database(&self) -> Result<(), CoreError> {
        let path = self.database_path();
        let mut guard = self.db.lock();
        // The writer must be closed before its files go
        drop(guard.take());

        delete_database_files(&path)?;
        let db = open_writer(&path, &self.changes)?;
        let health = db.check_health();
        *guard = Some(db);
        drop(guard);

        *self.health.write() = health;
        self.preferences.take_reset_pending()?;
        self.live.reopen_readers();
        self.invalidation.bump();
        log::warn!("Database at {} was reset", path.display());
        Ok(())
    }

    // =========================================================================
    // Store access
    // =========================================================================

    /// Run `f` against the writer connection.
    pub fn with_db<T>(&self, f: impl FnOnce(&ChatDb) -> Result<T, CoreError>) -> Result<T, CoreError> {
        self.ensure_healthy()?;
        let guard = self.db.lock();
        let db = guard
            .as_ref()
            .ok_or_else(|| CoreError::StoreCorruption {
                errors: vec!["database is not open".into()],
            })?;
        f(db)
    }

    pub fn observe<T>(&self, query: &LiveQuery<T>) -> Result<LiveQueryHandle<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        self.ensure_healthy()?;
        self.live.observe(query, &self.invalidation.token())
    }

    pub fn chats(&self) -> Result<Vec<ChatSummary>, CoreError> {
        self.with_db(|db| Ok(db.list_chats()?))
    }

    pub fn exports(&self) -> Result<Vec<ExportSummary>, CoreError> {
        self.with_db(|db| Ok(db.list_exports()?))
    }

    pub fn delete_export(&self, export_id: i64) -> Result<DeleteExportReport, CoreError> {
        self.with_db(|db| {
            db.delete_export(export_id)
                .map_err(|e| CoreError::from(e).into_transaction("delete export"))
        })
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Every suggestion, dismissed ones included.
    pub fn merge_suggestions(&self) -> Result<Vec<AutoMergeSuggestion>, CoreError> {
        Ok(build_auto_merge_suggestions(&self.chats()?))
    }

    pub fn actionable_merge_suggestions(&self) -> Result<Vec<AutoMergeSuggestion>, CoreError> {
        Ok(actionable_suggestions(
            &self.merge_suggestions()?,
            &self.preferences.ignored_keys(),
        ))
    }

    pub fn merge_conversations(&self, selection: &[i64]) -> Result<MergeReport, CoreError> {
        self.with_db(|db| db.merge_canonical_conversations(selection))
    }

    /// Apply every suggestion that has not been dismissed.
    pub fn apply_auto_merge(&self) -> Result<MergeReport, CoreError> {
        let ignored = self.preferences.ignored_keys();
        self.with_db(|db| db.apply_auto_merge(&ignored))
    }

    pub fn cleanup(&self) -> Result<usize, CoreError> {
        self.with_db(|db| {
            db.cleanup_orphaned_canonical_conversations()
                .map_err(|e| CoreError::from(e).into_transaction("cleanup"))
        })
    }

    pub fn ignore_suggestion(&self, key: &str) -> Result<(), CoreError> {
        self.preferences.ignore(key)
    }

    pub fn unignore_suggestion(&self, key: &str) -> Result<(), CoreError> {
        self.preferences.unignore(key)
    }

    /// Returns true if the key is now ignored.
    pub fn toggle_suggestion(&self, key: &str) -> Result<bool, CoreError> {
        self.preferences.toggle(key)
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Start importing `files` into this store in the background.
    pub fn start_import(
        &self,
        importer: Arc<dyn Importer>,
        files: Vec<PathBuf>,
    ) -> Result<ImportSession, CoreError> {
        self.ensure_healthy()?;
        let request = ImportRequest::new(files, self.database_path());
        ImportSession::start(importer, request, self.invalidation.clone())
    }
}

fn open_writer(path: &Path, changes: &ChangeBus) -> Result<ChatDb, CoreError> {
    let mut db = ChatDb::open_at(path)?;
    db.attach_change_bus(changes.clone());
    Ok(db)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::test_utils::seed_chat;
    use crate::db::ConversationType;
    use crate::importer::{CancelFlag, ImportOutcome, ProgressSink};
    use crate::queries::chats_query;

    fn open_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(CoreConfig::for_dir(dir.path())).unwrap();
        (dir, state)
    }

    fn seed_twins(state: &AppState) -> (i64, i64) {
        state
            .with_db(|db| {
                let fb = db.insert_export("messenger:facebook", None, None)?;
                let e2e = db.insert_export("messenger:e2e", None, None)?;
                Ok((
                    seed_chat(db, fb, ConversationType::Dm, "jamie lee", 3),
                    seed_chat(db, e2e, ConversationType::Dm, "Jamie Lee", 1),
                ))
            })
            .unwrap()
    }

    #[test]
    fn test_open_fresh_store_is_healthy() {
        let (dir, state) = open_state();
        assert!(state.health().ok);
        assert!(dir.path().join("chats.db").exists());
        assert!(state.chats().unwrap().is_empty());
    }

    #[test]
    fn test_ignored_suggestions_are_not_applied() {
        let (_dir, state) = open_state();
        seed_twins(&state);

        assert_eq!(state.actionable_merge_suggestions().unwrap().len(), 1);
        state.ignore_suggestion("jamie lee|dm").unwrap();
        assert!(state.actionable_merge_suggestions().unwrap().is_empty());
        assert_eq!(state.merge_suggestions().unwrap().len(), 1);

        let report = state.apply_auto_merge().unwrap();
        assert!(report.targets.is_empty());
        assert_eq!(state.chats().unwrap().len(), 2);

        assert!(!state.toggle_suggestion("jamie lee|dm").unwrap());
        let report = state.apply_auto_merge().unwrap();
        assert_eq!(report.targets.len(), 1);
        assert_eq!(state.chats().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_reset_applies_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::for_dir(dir.path());
        {
            let state = AppState::open(config.clone()).unwrap();
            seed_twins(&state);
            state.request_reset().unwrap();
        }

        let state = AppState::open(config).unwrap();
        assert!(state.chats().unwrap().is_empty());
        assert!(!state.preferences().snapshot().db_reset_pending);
    }

    #[test]
    fn test_corrupt_store_only_allows_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::for_dir(dir.path());
        std::fs::write(config.database_path(), vec![0x5a_u8; 8192]).unwrap();

        let state = AppState::open(config).unwrap();
        assert!(!state.health().ok);
        let err = state.chats().unwrap_err();
        assert!(err.requires_reset());
        assert!(state.observe(&chats_query().unwrap()).is_err());

        state.reset_database().unwrap();
        assert!(state.health().ok);
        assert!(state.chats().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_queries_survive_reset() {
        let (_dir, state) = open_state();
        seed_twins(&state);

        let handle = state.observe(&chats_query().unwrap()).unwrap();
        let wait = |n| tokio::time::timeout(Duration::from_secs(5), handle.wait_for_generation(n));
        assert!(wait(1).await.unwrap());
        assert_eq!(handle.data().unwrap().len(), 2);

        state.reset_database().unwrap();
        assert!(wait(2).await.unwrap());
        assert!(handle.data().unwrap().is_empty());
        assert!(handle.error().is_none());
    }

    struct WritingImporter;

    impl Importer for WritingImporter {
        fn import(
            &self,
            request: &ImportRequest,
            progress: &ProgressSink,
            _cancel: &CancelFlag,
        ) -> Result<String, String> {
            // Writes on its own connection, invisible to the change hooks
            let db = ChatDb::open_at(&request.db_path).map_err(|e| e.to_string())?;
            db.insert_export("whatsapp", None, None)
                .map_err(|e| e.to_string())?;
            progress.report(1, 1);
            Ok("success".into())
        }
    }

    #[tokio::test]
    async fn test_import_refreshes_live_queries() {
        let (dir, state) = open_state();
        let handle = state
            .observe(&crate::queries::exports_query().unwrap())
            .unwrap();
        let wait = |n| tokio::time::timeout(Duration::from_secs(5), handle.wait_for_generation(n));
        assert!(wait(1).await.unwrap());
        assert!(handle.data().unwrap().is_empty());

        let session = state
            .start_import(Arc::new(WritingImporter), vec![dir.path().join("export.zip")])
            .unwrap();
        assert_eq!(session.wait().await.unwrap(), ImportOutcome::Completed);

        assert!(wait(2).await.unwrap());
        assert_eq!(handle.data().unwrap().len(), 1);
    }
}
