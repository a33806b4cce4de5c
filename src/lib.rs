//! Local store for imported chat exports.
//!
//! Two subsystems sit on top of the SQLite message store:
//! - [`live`]: queries that re-run when a committed write touches the tables
//!   they read, or when an out-of-process write invalidates everything.
//! - [`merge`]: grouping raw conversations from different exports under one
//!   canonical conversation, by suggestion or by hand.
//!
//! [`state::AppState`] wires both to the database, the preferences file and
//! the importer.

pub mod config;
pub mod db;
pub mod error;
pub mod importer;
pub mod live;
pub mod merge;
pub mod migrations;
pub mod preferences;
pub mod queries;
pub mod state;

pub use config::CoreConfig;
pub use error::{CoreError, ErrorPayload};
pub use state::AppState;
