//! Observer-facing side of a live query.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};

use super::binder::QueryKey;
use crate::db::DbError;

/// Point-in-time view of a live query.
#[derive(Debug)]
pub struct LiveSnapshot<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<DbError>>,
    pub is_loading: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Clone for LiveSnapshot<T> {
    fn clone(&self) -> Self {
        LiveSnapshot {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            updated_at: self.updated_at,
        }
    }
}

/// State shared between a live query's task and its handles.
pub(crate) struct LiveShared<T> {
    pub(crate) key: QueryKey,
    snapshot: RwLock<LiveSnapshot<T>>,
    generation: watch::Sender<u64>,
    disposed: AtomicBool,
    pub(crate) dispose_signal: Notify,
    executions: AtomicU64,
}

impl<T> LiveShared<T> {
    pub(crate) fn new(key: QueryKey) -> Self {
        let (generation, _) = watch::channel(0);
        LiveShared {
            key,
            snapshot: RwLock::new(LiveSnapshot {
                data: None,
                error: None,
                is_loading: true,
                updated_at: None,
            }),
            generation,
            disposed: AtomicBool::new(false),
            dispose_signal: Notify::new(),
            executions: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Live query {} disposed", self.key);
        self.dispose_signal.notify_one();
        // Wake anyone waiting on the next generation
        self.generation.send_modify(|_| {});
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Store the outcome of one execution.
    ///
    /// A failure keeps the last good data so observers can keep rendering it.
    pub(crate) fn settle(&self, result: Result<T, DbError>) {
        {
            let mut snapshot = self.snapshot.write();
            match result {
                Ok(data) => {
                    snapshot.data = Some(Arc::new(data));
                    snapshot.error = None;
                }
                Err(e) => {
                    log::warn!("Live query {} failed: {}", self.key, e);
                    snapshot.error = Some(Arc::new(e));
                }
            }
            snapshot.is_loading = false;
            snapshot.updated_at = Some(Utc::now());
        }
        self.generation.send_modify(|g| *g += 1);
    }
}

/// Handle to a live query subscription.
///
/// Clones share the subscription. Dropping the last clone disposes it, as
/// does calling [`LiveQueryHandle::dispose`].
pub struct LiveQueryHandle<T> {
    inner: Arc<HandleInner<T>>,
}

pub(crate) struct HandleInner<T> {
    pub(crate) shared: Arc<LiveShared<T>>,
}

impl<T> Drop for HandleInner<T> {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl<T> fmt::Debug for LiveQueryHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryHandle")
            .field("key", &self.shared().key)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T> Clone for LiveQueryHandle<T> {
    fn clone(&self) -> Self {
        LiveQueryHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> LiveQueryHandle<T> {
    pub(crate) fn from_inner(inner: Arc<HandleInner<T>>) -> Self {
        LiveQueryHandle { inner }
    }

    fn shared(&self) -> &LiveShared<T> {
        &self.inner.shared
    }

    pub fn key(&self) -> &QueryKey {
        &self.shared().key
    }

    pub fn snapshot(&self) -> LiveSnapshot<T> {
        self.shared().snapshot.read().clone()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.shared().snapshot.read().data.clone()
    }

    pub fn error(&self) -> Option<Arc<DbError>> {
        self.shared().snapshot.read().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared().snapshot.read().is_loading
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.shared().snapshot.read().updated_at
    }

    /// How many times the query has been executed.
    pub fn execution_count(&self) -> u64 {
        self.shared().executions.load(Ordering::Relaxed)
    }

    /// Number of settled executions. Starts at 0 while loading.
    pub fn generation(&self) -> u64 {
        *self.shared().generation.borrow()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared().is_disposed()
    }

    /// Stop observing. The query stops re-running and any in-flight result
    /// is discarded. Affects every clone of this handle.
    pub fn dispose(&self) {
        self.shared().dispose();
    }

    /// Wait until at least `generation` executions have settled.
    ///
    /// Returns false if the query is disposed first.
    pub async fn wait_for_generation(&self, generation: u64) -> bool {
        let mut rx = self.shared().generation.subscribe();
        loop {
            if self.is_disposed() {
                return false;
            }
            if *rx.borrow_and_update() >= generation {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Wait for the next settled execution after this call.
    pub async fn changed(&self) -> bool {
        let next = self.generation() + 1;
        self.wait_for_generation(next).await
    }

    /// True if both handles observe the same subscription.
    pub fn same_subscription(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
