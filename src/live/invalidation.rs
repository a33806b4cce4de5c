//! Manual invalidation for writes the change hooks cannot see.
//!
//! The importer runs in a separate process and writes the database file
//! directly. When it finishes, the coordinator bumps the invalidation
//! version and every live query re-runs once.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of the invalidation version. Cloning shares it.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        InvalidationBus { tx: Arc::new(tx) }
    }

    /// Advance the version, returning the new value.
    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|version| {
            *version += 1;
            next = *version;
        });
        log::info!("Invalidated all live queries (version {})", next);
        next
    }

    pub fn version(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn token(&self) -> InvalidationToken {
        InvalidationToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side handed to every live query subscription.
#[derive(Debug, Clone)]
pub struct InvalidationToken {
    rx: watch::Receiver<u64>,
}

impl InvalidationToken {
    pub fn version(&self) -> u64 {
        *self.rx.borrow()
    }

    /// True if both tokens come from the same bus.
    pub fn same_bus(&self, other: &InvalidationToken) -> bool {
        self.rx.same_channel(&other.rx)
    }

    /// A receiver that only reports bumps made after this call.
    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        let mut rx = self.rx.clone();
        rx.borrow_and_update();
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_advances_version() {
        let bus = InvalidationBus::new();
        let token = bus.token();
        assert_eq!(token.version(), 0);
        assert_eq!(bus.bump(), 1);
        assert_eq!(bus.bump(), 2);
        assert_eq!(token.version(), 2);
    }

    #[test]
    fn test_same_bus() {
        let bus = InvalidationBus::new();
        let other = InvalidationBus::new();
        assert!(bus.token().same_bus(&bus.clone().token()));
        assert!(!bus.token().same_bus(&other.token()));
    }

    #[test]
    fn test_watch_ignores_earlier_bumps() {
        let bus = InvalidationBus::new();
        let token = bus.token();
        bus.bump();

        let rx = token.watch();
        assert!(!rx.has_changed().unwrap());
        bus.bump();
        assert!(rx.has_changed().unwrap());
    }
}
