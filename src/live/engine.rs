//! Live query execution.
//!
//! Each observed query runs on its own task with its own read connection.
//! The task executes the query once, then sleeps until a committed change
//! touches one of its dependency tables, an invalidation is requested, or the
//! handle is disposed. Triggers that arrive while an execution is in flight
//! collapse into a single follow-up execution.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rusqlite::OpenFlags;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use super::binder::{DependencySet, FetchFn, LiveQuery, QueryKey};
use super::changes::{ChangeBus, ChangeEvent};
use super::handle::{HandleInner, LiveQueryHandle, LiveShared};
use super::invalidation::InvalidationToken;
use crate::db::{DbError, BUSY_TIMEOUT_MS};
use crate::error::CoreError;

/// A shared subscription, remembered along with the invalidation bus it
/// listens to.
struct RegistryEntry {
    handle: Weak<dyn Any + Send + Sync>,
    token: InvalidationToken,
}

type Registry = HashMap<QueryKey, RegistryEntry>;

pub struct LiveQueryEngine {
    db_path: PathBuf,
    changes: ChangeBus,
    reader_epoch: Arc<AtomicU64>,
    registry: Mutex<Registry>,
}

impl LiveQueryEngine {
    pub fn new(db_path: impl Into<PathBuf>, changes: ChangeBus) -> Self {
        LiveQueryEngine {
            db_path: db_path.into(),
            changes,
            reader_epoch: Arc::new(AtomicU64::new(0)),
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn changes(&self) -> &ChangeBus {
        &self.changes
    }

    /// Start observing `query`.
    ///
    /// Observing a query whose key is already observed with a token from the
    /// same invalidation bus returns a handle to the existing subscription
    /// instead of starting a second one.
    pub fn observe<T>(
        &self,
        query: &LiveQuery<T>,
        token: &InvalidationToken,
    ) -> Result<LiveQueryHandle<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CoreError::subscription(format!(
                "'{}' can only be observed inside a tokio runtime",
                query.key()
            ))
        })?;
        if query.dependencies().is_empty() {
            return Err(CoreError::subscription(format!(
                "'{}' has no table dependencies",
                query.key()
            )));
        }

        let mut registry = self.registry.lock();
        registry.retain(|_, entry| entry.handle.strong_count() > 0);

        if let Some(existing) = registry
            .get(query.key())
            .filter(|entry| entry.token.same_bus(token))
            .and_then(|entry| entry.handle.upgrade())
        {
            if let Ok(inner) = existing.downcast::<HandleInner<T>>() {
                if !inner.shared.is_disposed() {
                    log::debug!("Reusing live query {}", query.key());
                    return Ok(LiveQueryHandle::from_inner(inner));
                }
            }
        }

        let shared = Arc::new(LiveShared::new(query.key().clone()));
        // Subscribe before the first execution so no commit can slip between
        let changes = self.changes.subscribe();
        let invalidations = token.watch();
        let reader = ReaderSlot {
            path: self.db_path.clone(),
            epoch: Arc::clone(&self.reader_epoch),
            current: None,
        };
        runtime.spawn(run_live_query(
            Arc::clone(&shared),
            query.fetcher(),
            query.dependencies().clone(),
            reader,
            changes,
            invalidations,
        ));
        log::debug!(
            "Observing {} (depends on {:?})",
            query.key(),
            query.dependencies()
        );

        let inner = Arc::new(HandleInner { shared });
        let erased: Arc<dyn Any + Send + Sync> = inner.clone();
        registry.insert(
            query.key().clone(),
            RegistryEntry {
                handle: Arc::downgrade(&erased),
                token: token.clone(),
            },
        );
        Ok(LiveQueryHandle::from_inner(inner))
    }

    /// Number of live subscriptions with at least one handle.
    pub fn active_queries(&self) -> usize {
        let mut registry = self.registry.lock();
        registry.retain(|_, entry| entry.handle.strong_count() > 0);
        registry.len()
    }

    /// Make every live query open a fresh read connection before its next
    /// execution. Needed after the database file is replaced.
    pub fn reopen_readers(&self) {
        self.reader_epoch.fetch_add(1, Ordering::AcqRel);
    }
}

/// A query task's read connection, reopened when the engine's epoch moves.
struct ReaderSlot {
    path: PathBuf,
    epoch: Arc<AtomicU64>,
    current: Option<(u64, tokio_rusqlite::Connection)>,
}

impl ReaderSlot {
    async fn connection(&mut self) -> Result<&tokio_rusqlite::Connection, DbError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let fresh = matches!(&self.current, Some((opened, _)) if *opened == epoch);
        if !fresh {
            self.current = None;
            let conn = open_reader(&self.path).await?;
            self.current = Some((epoch, conn));
        }
        match &self.current {
            Some((_, conn)) => Ok(conn),
            None => Err(DbError::Reader("read connection unavailable".into())),
        }
    }
}

async fn open_reader(path: &Path) -> Result<tokio_rusqlite::Connection, DbError> {
    let conn = tokio_rusqlite::Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .await
    .map_err(|e| DbError::Reader(e.to_string()))?;

    let configured = conn
        .call(|c| Ok(c.execute_batch(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"))))
        .await
        .map_err(|e| DbError::Reader(e.to_string()))?;
    configured?;
    Ok(conn)
}

async fn execute<T>(reader: &mut ReaderSlot, fetch: &FetchFn<T>) -> Result<T, DbError>
where
    T: Send + 'static,
{
    let conn = reader.connection().await?;
    let fetch = Arc::clone(fetch);
    match conn.call(move |c| Ok(fetch(&*c))).await {
        Ok(result) => result,
        Err(e) => Err(DbError::Reader(e.to_string())),
    }
}

async fn run_live_query<T>(
    shared: Arc<LiveShared<T>>,
    fetch: FetchFn<T>,
    dependencies: DependencySet,
    mut reader: ReaderSlot,
    mut changes: broadcast::Receiver<ChangeEvent>,
    mut invalidations: watch::Receiver<u64>,
) where
    T: Send + Sync + 'static,
{
    loop {
        if shared.is_disposed() {
            break;
        }

        shared.record_execution();
        let result = execute(&mut reader, &fetch).await;
        if shared.is_disposed() {
            log::debug!("Discarding result of disposed live query {}", shared.key);
            break;
        }
        shared.settle(result);

        let triggered = tokio::select! {
            _ = shared.dispose_signal.notified() => false,
            triggered = next_trigger(&mut changes, &mut invalidations, &dependencies) => triggered,
        };
        if !triggered {
            break;
        }
        // Everything queued while we waited or ran folds into the next run
        drain_pending(&mut changes, &mut invalidations);
    }
    log::debug!("Live query {} stopped", shared.key);
}

/// Wait for a change that affects `dependencies` or an invalidation.
/// Returns false once both channels are closed.
async fn next_trigger(
    changes: &mut broadcast::Receiver<ChangeEvent>,
    invalidations: &mut watch::Receiver<u64>,
    dependencies: &DependencySet,
) -> bool {
    let mut changes_open = true;
    let mut invalidations_open = true;
    while changes_open || invalidations_open {
        tokio::select! {
            event = changes.recv(), if changes_open => match event {
                Ok(event) if dependencies.intersects(&event.tables) => return true,
                Ok(_) => {}
                // Missed events may have touched our tables
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Change channel lagged by {} events", skipped);
                    return true;
                }
                Err(RecvError::Closed) => changes_open = false,
            },
            changed = invalidations.changed(), if invalidations_open => match changed {
                Ok(()) => return true,
                Err(_) => invalidations_open = false,
            },
        }
    }
    false
}

fn drain_pending(
    changes: &mut broadcast::Receiver<ChangeEvent>,
    invalidations: &mut watch::Receiver<u64>,
) {
    loop {
        match changes.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    invalidations.borrow_and_update();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{ChatDb, ConversationType};
    use crate::live::binder::Table;
    use crate::live::invalidation::InvalidationBus;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (ChatDb, LiveQueryEngine, InvalidationBus) {
        let mut db = test_db();
        let bus = ChangeBus::new(64);
        db.attach_change_bus(bus.clone());
        let engine = LiveQueryEngine::new(db.path(), bus);
        (db, engine, InvalidationBus::new())
    }

    fn conversation_count() -> LiveQuery<i64> {
        LiveQuery::builder("conversation_count")
            .from(Table::Conversation)
            .join(Table::CanonicalConversation)
            .build(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM conversation c
                     JOIN canonical_conversation cc ON cc.id = c.canonical_conversation_id",
                    [],
                    |row| row.get(0),
                )
                .map_err(DbError::from)
            })
            .unwrap()
    }

    fn export_count() -> LiveQuery<i64> {
        LiveQuery::builder("export_count")
            .from(Table::Export)
            .build(|conn| {
                conn.query_row("SELECT COUNT(*) FROM export", [], |row| row.get(0))
                    .map_err(DbError::from)
            })
            .unwrap()
    }

    async fn settled<T>(handle: &LiveQueryHandle<T>, generation: u64) {
        let reached = tokio::time::timeout(WAIT, handle.wait_for_generation(generation))
            .await
            .expect("live query did not settle in time");
        assert!(reached, "live query was disposed while waiting");
    }

    fn publish(engine: &LiveQueryEngine, tables: &[Table]) {
        engine
            .changes()
            .publish(tables.iter().copied().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_initial_load() {
        let (db, engine, invalidation) = setup();
        let export = db.insert_export("whatsapp", None, None).unwrap();
        db.import_conversation(export, ConversationType::Dm, Some("Ana"), None)
            .unwrap();

        let handle = engine
            .observe(&conversation_count(), &invalidation.token())
            .unwrap();
        assert!(handle.is_loading());
        assert!(handle.data().is_none());

        settled(&handle, 1).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.data.as_deref(), Some(&1));
        assert!(!snapshot.is_loading);
        assert!(snapshot.error.is_none());
        assert!(snapshot.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_reruns_only_on_dependency_changes() {
        let (db, engine, invalidation) = setup();
        let export = db.insert_export("whatsapp", None, None).unwrap();
        let (conversation, _) = db
            .import_conversation(export, ConversationType::Dm, Some("Ana"), None)
            .unwrap();

        let handle = engine
            .observe(&conversation_count(), &invalidation.token())
            .unwrap();
        settled(&handle, 1).await;
        assert_eq!(handle.execution_count(), 1);

        db.with_transaction(|db| -> Result<(), DbError> {
            db.conn_ref().execute(
                "UPDATE conversation SET name = 'Ana B' WHERE id = ?1",
                [conversation],
            )?;
            Ok(())
        })
        .unwrap();
        settled(&handle, 2).await;
        assert_eq!(handle.execution_count(), 2);

        // canonical_person is not a dependency
        db.insert_canonical_person(Some("Nobody")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.execution_count(), 2);
        assert_eq!(handle.generation(), 2);
    }

    #[tokio::test]
    async fn test_joined_table_write_reruns_once() {
        let (db, engine, invalidation) = setup();
        let handle = engine
            .observe(&conversation_count(), &invalidation.token())
            .unwrap();
        settled(&handle, 1).await;

        // Only the joined table is written, never the base table
        db.insert_canonical_conversation(ConversationType::Group, Some("Team"))
            .unwrap();
        settled(&handle, 2).await;
        assert_eq!(handle.execution_count(), 2);

        db.insert_canonical_person(Some("Nobody")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_burst_collapses_into_one_trailing_run() {
        let (_db, engine, invalidation) = setup();
        let query = LiveQuery::builder("slow_exports")
            .from(Table::Export)
            .build(|conn| {
                std::thread::sleep(Duration::from_millis(150));
                conn.query_row("SELECT COUNT(*) FROM export", [], |row| row.get::<_, i64>(0))
                    .map_err(DbError::from)
            })
            .unwrap();

        let handle = engine.observe(&query, &invalidation.token()).unwrap();
        settled(&handle, 1).await;

        publish(&engine, &[Table::Export]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..5 {
            publish(&engine, &[Table::Export]);
        }

        settled(&handle, 2).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let runs = handle.execution_count();
        assert!(
            (2..=3).contains(&runs),
            "expected at most one trailing run, got {runs} executions"
        );
    }

    #[tokio::test]
    async fn test_invalidation_picks_up_external_writes() {
        let (db, engine, invalidation) = setup();
        let handle = engine.observe(&export_count(), &invalidation.token()).unwrap();
        settled(&handle, 1).await;
        assert_eq!(handle.data().as_deref(), Some(&0));

        // Another process writing the file is invisible to the hooks
        let external = rusqlite::Connection::open(db.path()).unwrap();
        external
            .execute("INSERT INTO export (source) VALUES ('messenger:e2e')", [])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.execution_count(), 1);

        invalidation.bump();
        settled(&handle, 2).await;
        assert_eq!(handle.data().as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn test_disposed_query_never_reruns() {
        let (db, engine, invalidation) = setup();
        let handle = engine.observe(&export_count(), &invalidation.token()).unwrap();
        settled(&handle, 1).await;

        handle.dispose();
        db.insert_export("whatsapp", None, None).unwrap();
        invalidation.bump();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(handle.execution_count(), 1);
        assert!(handle.is_disposed());
        assert!(!handle.wait_for_generation(2).await);
    }

    #[tokio::test]
    async fn test_in_flight_result_discarded_after_dispose() {
        let (_db, engine, invalidation) = setup();
        let query = LiveQuery::builder("slow")
            .from(Table::Export)
            .build(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(1_i64)
            })
            .unwrap();

        let handle = engine.observe(&query, &invalidation.token()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.dispose();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(handle.execution_count(), 1);
        assert_eq!(handle.generation(), 0);
        assert!(handle.data().is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_unsubscribes() {
        let (_db, engine, invalidation) = setup();
        let handle = engine.observe(&export_count(), &invalidation.token()).unwrap();
        settled(&handle, 1).await;
        assert_eq!(engine.changes().subscriber_count(), 1);

        let clone = handle.clone();
        drop(handle);
        assert!(!clone.is_disposed(), "a remaining clone keeps it alive");
        drop(clone);
        assert_eq!(engine.active_queries(), 0);

        tokio::time::timeout(WAIT, async {
            while engine.changes().subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should release its change subscription");
    }

    #[tokio::test]
    async fn test_identical_queries_share_a_subscription() {
        let (_db, engine, invalidation) = setup();
        let token = invalidation.token();
        let a = engine.observe(&export_count(), &token).unwrap();
        let b = engine.observe(&export_count(), &token).unwrap();
        assert!(a.same_subscription(&b));
        assert_eq!(engine.active_queries(), 1);
        assert!(format!("{a:?}").contains("export_count"));
        assert_eq!(engine.changes().subscriber_count(), 1);

        let c = engine.observe(&conversation_count(), &token).unwrap();
        assert!(!a.same_subscription(&c));
        assert_eq!(engine.active_queries(), 2);
    }

    #[tokio::test]
    async fn test_subscription_is_not_shared_across_buses() {
        let (_db, engine, invalidation) = setup();
        let other = InvalidationBus::new();
        let a = engine.observe(&export_count(), &invalidation.token()).unwrap();
        let b = engine.observe(&export_count(), &other.token()).unwrap();
        assert!(!a.same_subscription(&b));
        settled(&a, 1).await;
        settled(&b, 1).await;

        other.bump();
        settled(&b, 2).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(a.execution_count(), 1);
        assert_eq!(b.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_disposed_subscription_is_not_reused() {
        let (_db, engine, invalidation) = setup();
        let token = invalidation.token();
        let a = engine.observe(&export_count(), &token).unwrap();
        a.dispose();
        let b = engine.observe(&export_count(), &token).unwrap();
        assert!(!a.same_subscription(&b));
        settled(&b, 1).await;
    }

    #[tokio::test]
    async fn test_failure_keeps_last_data() {
        let (_db, engine, invalidation) = setup();
        let fail = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fail);
        let query = LiveQuery::builder("flaky")
            .from(Table::Export)
            .build(move |conn| {
                if flag.load(Ordering::SeqCst) {
                    return Err(DbError::Reader("simulated failure".into()));
                }
                conn.query_row("SELECT COUNT(*) FROM export", [], |row| row.get::<_, i64>(0))
                    .map_err(DbError::from)
            })
            .unwrap();

        let handle = engine.observe(&query, &invalidation.token()).unwrap();
        settled(&handle, 1).await;

        fail.store(true, Ordering::SeqCst);
        publish(&engine, &[Table::Export]);
        settled(&handle, 2).await;
        assert!(handle.error().is_some());
        assert_eq!(handle.data().as_deref(), Some(&0));
        assert!(!handle.is_loading());

        fail.store(false, Ordering::SeqCst);
        publish(&engine, &[Table::Export]);
        settled(&handle, 3).await;
        assert!(handle.error().is_none());
    }

    #[tokio::test]
    async fn test_one_failing_query_does_not_affect_others() {
        let (_db, engine, invalidation) = setup();
        let token = invalidation.token();
        let broken = LiveQuery::builder("broken")
            .from(Table::Message)
            .build(|conn| {
                conn.query_row("SELECT COUNT(*) FROM no_such_table", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(DbError::from)
            })
            .unwrap();

        let bad = engine.observe(&broken, &token).unwrap();
        let good = engine.observe(&export_count(), &token).unwrap();
        settled(&bad, 1).await;
        settled(&good, 1).await;

        assert!(bad.error().is_some());
        assert!(bad.data().is_none());
        assert!(!bad.is_loading());
        assert_eq!(good.data().as_deref(), Some(&0));
    }

    #[test]
    fn test_observe_requires_runtime() {
        let (_db, engine, invalidation) = setup();
        let err = engine
            .observe(&export_count(), &invalidation.token())
            .unwrap_err();
        assert!(matches!(err, CoreError::Subscription(_)));
    }
}
