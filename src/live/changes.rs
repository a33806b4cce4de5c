//! Table-level change notifications from the writer connection.
//!
//! The writer installs SQLite's update hook through [`ChangeRecorder`], which
//! collects the names of touched tables while a transaction is open. When the
//! outermost transaction commits, the collected set is published on the
//! [`ChangeBus`] as one [`ChangeEvent`]. Rolled back work is discarded.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::broadcast;

use super::binder::Table;

/// Tables touched by one committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub tables: BTreeSet<Table>,
}

/// Broadcast channel for committed changes. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeBus { tx }
    }

    /// Publish a change. Empty sets are dropped.
    pub fn publish(&self, tables: BTreeSet<Table>) {
        if tables.is_empty() {
            return;
        }
        log::debug!("Committed changes to {:?}", tables);
        // No receivers just means nothing is observing right now
        let _ = self.tx.send(ChangeEvent { tables });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Collects touched tables on a connection between commits.
#[derive(Clone)]
pub(crate) struct ChangeRecorder {
    bus: ChangeBus,
    pending: Arc<Mutex<BTreeSet<Table>>>,
}

impl ChangeRecorder {
    pub(crate) fn new(bus: ChangeBus) -> Self {
        ChangeRecorder {
            bus,
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Install the update and rollback hooks on `conn`.
    ///
    /// Cascaded deletes fire the update hook too, so child tables removed
    /// through `ON DELETE CASCADE` are recorded.
    pub(crate) fn install(&self, conn: &Connection) {
        let pending = Arc::clone(&self.pending);
        conn.update_hook(Some(
            move |_action: rusqlite::hooks::Action, _db: &str, table: &str, _rowid: i64| {
                if let Some(table) = Table::from_name(table) {
                    pending.lock().insert(table);
                }
            },
        ));

        let pending = Arc::clone(&self.pending);
        conn.rollback_hook(Some(move || {
            pending.lock().clear();
        }));
    }

    /// Publish everything recorded since the last flush.
    pub(crate) fn flush(&self) {
        let tables = std::mem::take(&mut *self.pending.lock());
        self.bus.publish(tables);
    }

    pub(crate) fn discard(&self) {
        self.pending.lock().clear();
    }
}
