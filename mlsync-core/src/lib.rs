//! Client-side state engine for end-to-end encrypted group conversations.
//!
//! The crate keeps each conversation's epoch, member list and per-message
//! delivery order consistent while several local processes share one
//! persistent store. See [`core_mls`] for the engine itself.

pub mod config;
pub mod core_mls;
pub mod logging;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use core_mls::{
    GroupStateManager, KeyVault, MlsError, MlsResult, RecoveryCoordinator, SequenceCoordinator,
    SequenceDecision,
};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = SequenceDecision::ProcessNow;
    }
}
