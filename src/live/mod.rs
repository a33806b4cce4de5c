//! Live queries over the message store.
//!
//! A [`LiveQuery`] declares the tables it reads through [`LiveQueryBuilder`].
//! Observing it through a [`LiveQueryEngine`] returns a [`LiveQueryHandle`]
//! whose snapshot is refreshed whenever a committed write touches one of
//! those tables, or when an [`InvalidationBus`] bump signals a write made
//! outside this process.

pub mod binder;
pub mod changes;
mod engine;
mod handle;
pub mod invalidation;

pub use binder::{DependencySet, LiveQuery, LiveQueryBuilder, QueryKey, QuerySource, Table};
pub use changes::{ChangeBus, ChangeEvent};
pub use engine::LiveQueryEngine;
pub use handle::{LiveQueryHandle, LiveSnapshot};
pub use invalidation::{InvalidationBus, InvalidationToken};
