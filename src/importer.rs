//! Coordination with the external export importer.
//!
//! Parsing export archives is not done here. An [`Importer`] implementation
//! does that and writes straight into the database file, which the change
//! hooks cannot see. Once it settles, whatever the outcome, every live query
//! is invalidated so views pick up what was written.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::CoreError;
use crate::live::InvalidationBus;

/// What to import and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// Archive files, in the order they should be processed.
    pub files: Vec<PathBuf>,
    pub db_path: PathBuf,
}

impl ImportRequest {
    pub fn new(files: Vec<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        ImportRequest {
            files,
            db_path: db_path.into(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.files.is_empty() {
            return Err(CoreError::validation("no files selected for import"));
        }
        if let Some(relative) = self.files.iter().find(|f| !f.is_absolute()) {
            return Err(CoreError::validation(format!(
                "import paths must be absolute: {}",
                relative.display()
            )));
        }
        if self.db_path.as_os_str().is_empty() || !self.db_path.is_absolute() {
            return Err(CoreError::validation(format!(
                "invalid database path: '{}'",
                self.db_path.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportProgress {
    pub processed: u64,
    pub total: u64,
}

/// Terminal status reported by the importer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    Success,
    Cancelled,
    Failed(String),
}

impl ImportStatus {
    /// `success` and `cancelled` are recognised; anything else is a failure
    /// carrying the raw status.
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "success" => ImportStatus::Success,
            "cancelled" => ImportStatus::Cancelled,
            other => ImportStatus::Failed(other.to_string()),
        }
    }
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Completed,
    Cancelled,
}

/// Best-effort cancellation shared with the importer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Progress channel written by the importer.
///
/// `processed` never goes backwards: an update reporting less than what was
/// already seen keeps the old value.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Arc<watch::Sender<ImportProgress>>,
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ImportProgress::default());
        ProgressSink { tx: Arc::new(tx) }
    }

    pub fn report(&self, processed: u64, total: u64) {
        self.tx.send_modify(|progress| {
            progress.processed = progress.processed.max(processed);
            progress.total = total;
        });
    }

    pub fn current(&self) -> ImportProgress {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportProgress> {
        self.tx.subscribe()
    }
}

/// The external importer. Runs on a blocking thread.
///
/// Returns the raw terminal status (see [`ImportStatus::parse`]), or an
/// error message when it failed internally.
pub trait Importer: Send + Sync {
    fn import(
        &self,
        request: &ImportRequest,
        progress: &ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<String, String>;
}

/// Run one import to completion and invalidate live queries afterwards.
///
/// A cancelled import is a normal outcome, not an error.
pub async fn run_import(
    importer: Arc<dyn Importer>,
    request: ImportRequest,
    progress: ProgressSink,
    cancel: CancelFlag,
    invalidation: &InvalidationBus,
) -> Result<ImportOutcome, CoreError> {
    request.validate()?;
    log::info!(
        "Importing {} file(s) into {}",
        request.files.len(),
        request.db_path.display()
    );

    let joined = tokio::task::spawn_blocking(move || {
        importer.import(&request, &progress, &cancel)
    })
    .await;

    // The importer may have written before failing, so always invalidate
    invalidation.bump();

    let status = match joined {
        Ok(Ok(status)) => ImportStatus::parse(&status),
        Ok(Err(message)) => ImportStatus::Failed(message),
        Err(e) => ImportStatus::Failed(format!("importer task aborted: {e}")),
    };
    match status {
        ImportStatus::Success => {
            log::info!("Import finished");
            Ok(ImportOutcome::Completed)
        }
        ImportStatus::Cancelled => {
            log::info!("Import cancelled");
            Ok(ImportOutcome::Cancelled)
        }
        ImportStatus::Failed(reason) => {
            log::error!("Import failed: {}", reason);
            Err(CoreError::ImporterFailure(reason))
        }
    }
}

/// An import running in the background.
pub struct ImportSession {
    progress: ProgressSink,
    cancel: CancelFlag,
    task: JoinHandle<Result<ImportOutcome, CoreError>>,
}

impl ImportSession {
    /// Spawn the import on the current tokio runtime.
    pub fn start(
        importer: Arc<dyn Importer>,
        request: ImportRequest,
        invalidation: InvalidationBus,
    ) -> Result<Self, CoreError> {
        request.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CoreError::ImporterFailure("no async runtime to run the import on".into()))?;

        let progress = ProgressSink::new();
        let cancel = CancelFlag::new();
        let task = {
            let progress = progress.clone();
            let cancel = cancel.clone();
            runtime.spawn(async move {
                run_import(importer, request, progress, cancel, &invalidation).await
            })
        };
        Ok(ImportSession {
            progress,
            cancel,
            task,
        })
    }

    pub fn progress(&self) -> watch::Receiver<ImportProgress> {
        self.progress.subscribe()
    }

    pub fn current_progress(&self) -> ImportProgress {
        self.progress.current()
    }

    pub fn cancel(&self) {
        log::info!("Import cancellation requested");
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<ImportOutcome, CoreError> {
        self.task
            .await
            .map_err(|e| CoreError::ImporterFailure(format!("import task aborted: {e}")))?
    }
}

/// SHA-256 over the archives' contents, in order. Importers store it on the
/// export row so a repeated import of the same files can be recognised.
pub fn archive_checksum(files: &[PathBuf]) -> Result<String, CoreError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    for path in files {
        let mut file = open_archive(path)?;
        loop {
            let n = file.read(&mut buf).map_err(|e| {
                CoreError::validation(format!("failed to read {}: {}", path.display(), e))
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn open_archive(path: &Path) -> Result<fs::File, CoreError> {
    fs::File::open(path)
        .map_err(|e| CoreError::validation(format!("failed to open {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use super::*;

    /// Reports progress per file and stops early when cancelled.
    struct FakeImporter {
        status: Result<&'static str, &'static str>,
        calls: AtomicU64,
        wait_for_cancel: bool,
    }

    impl FakeImporter {
        fn new(status: Result<&'static str, &'static str>) -> Self {
            FakeImporter {
                status,
                calls: AtomicU64::new(0),
                wait_for_cancel: false,
            }
        }
    }

    impl Importer for FakeImporter {
        fn import(
            &self,
            request: &ImportRequest,
            progress: &ProgressSink,
            cancel: &CancelFlag,
        ) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let total = request.files.len() as u64;
            if self.wait_for_cancel {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Ok("cancelled".into());
            }
            for i in 1..=total {
                progress.report(i, total);
            }
            self.status.map(String::from).map_err(String::from)
        }
    }

    fn request() -> ImportRequest {
        ImportRequest::new(
            vec![PathBuf::from("/tmp/a.zip"), PathBuf::from("/tmp/b.zip")],
            "/tmp/chats.db",
        )
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(ImportStatus::parse("success"), ImportStatus::Success);
        assert_eq!(ImportStatus::parse("cancelled"), ImportStatus::Cancelled);
        assert_eq!(
            ImportStatus::parse("disk full"),
            ImportStatus::Failed("disk full".into())
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());
        assert!(ImportRequest::new(vec![], "/tmp/chats.db").validate().is_err());
        assert!(ImportRequest::new(vec![PathBuf::from("a.zip")], "/tmp/chats.db")
            .validate()
            .is_err());
        assert!(ImportRequest::new(vec![PathBuf::from("/a.zip")], "")
            .validate()
            .is_err());
    }

    #[test]
    fn test_progress_never_goes_backwards() {
        let sink = ProgressSink::new();
        sink.report(5, 10);
        sink.report(3, 10);
        assert_eq!(sink.current(), ImportProgress { processed: 5, total: 10 });
        sink.report(7, 12);
        assert_eq!(sink.current(), ImportProgress { processed: 7, total: 12 });
    }

    #[tokio::test]
    async fn test_success_invalidates() {
        let bus = InvalidationBus::new();
        let progress = ProgressSink::new();
        let outcome = run_import(
            Arc::new(FakeImporter::new(Ok("success"))),
            request(),
            progress.clone(),
            CancelFlag::new(),
            &bus,
        )
        .await
        .unwrap();
        assert_eq!(outcome, ImportOutcome::Completed);
        assert_eq!(bus.version(), 1);
        assert_eq!(progress.current(), ImportProgress { processed: 2, total: 2 });
    }

    #[tokio::test]
    async fn test_failure_still_invalidates() {
        let bus = InvalidationBus::new();
        let err = run_import(
            Arc::new(FakeImporter::new(Err("archive truncated"))),
            request(),
            ProgressSink::new(),
            CancelFlag::new(),
            &bus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ImporterFailure(ref m) if m == "archive truncated"));
        assert_eq!(bus.version(), 1);

        let err = run_import(
            Arc::new(FakeImporter::new(Ok("weird"))),
            request(),
            ProgressSink::new(),
            CancelFlag::new(),
            &bus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ImporterFailure(_)));
        assert_eq!(bus.version(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_importer() {
        let bus = InvalidationBus::new();
        let importer = Arc::new(FakeImporter::new(Ok("success")));
        let err = run_import(
            importer.clone(),
            ImportRequest::new(vec![], "/tmp/chats.db"),
            ProgressSink::new(),
            CancelFlag::new(),
            &bus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(importer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.version(), 0);
    }

    #[tokio::test]
    async fn test_session_cancel_is_not_an_error() {
        let bus = InvalidationBus::new();
        let importer = FakeImporter {
            wait_for_cancel: true,
            ..FakeImporter::new(Ok("success"))
        };
        let session = ImportSession::start(Arc::new(importer), request(), bus.clone()).unwrap();
        session.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ImportOutcome::Cancelled);
        assert_eq!(bus.version(), 1);
    }

    #[test]
    fn test_archive_checksum_depends_on_content_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        fs::write(&a, b"first").unwrap();
        fs::write(&b, b"second").unwrap();

        let ab = archive_checksum(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(ab.len(), 64);
        assert_eq!(ab, archive_checksum(&[a.clone(), b.clone()]).unwrap());
        assert_ne!(ab, archive_checksum(&[b, a.clone()]).unwrap());
        assert!(archive_checksum(&[dir.path().join("missing.zip")]).is_err());
    }
}
