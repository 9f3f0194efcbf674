//! Persistent state
//!
//! One SQLite file is shared by every process of an installation. The
//! store exposes conditional writes only for the ordering and epoch
//! columns; callers never overwrite those blindly.

pub mod migrations;
pub mod sql_store;

pub use sql_store::{DiagnosticRecord, SqlStateStore};
