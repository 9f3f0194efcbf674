//! Test utilities shared by the unit tests
//!
//! Fixtures build fully wired [`GroupStateManager`](crate::GroupStateManager)
//! clients around one in-memory delivery service, plus small helpers for
//! awaiting observer events.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
