//! Inbound message validation

use crate::core_mls::errors::{MlsError, MlsResult};

/// Accept messages from the current epoch and up to `max_past_epochs` before it
///
/// A message ahead of the current epoch passes; whether it can be decrypted
/// is for the engine to decide after catch-up.
pub fn validate_message_epoch(
    message_epoch: u64,
    current_epoch: u64,
    max_past_epochs: u64,
) -> MlsResult<()> {
    let min_epoch = current_epoch.saturating_sub(max_past_epochs);
    if message_epoch < min_epoch {
        return Err(MlsError::EpochOutOfRange {
            epoch: message_epoch,
            min_epoch,
        });
    }
    Ok(())
}

/// Reject sequence numbers beyond `upper_limit`
pub fn validate_message_sequence(sequence_number: i64, upper_limit: i64) -> MlsResult<()> {
    if sequence_number > upper_limit {
        return Err(MlsError::SequenceOutOfBounds {
            sequence: sequence_number,
            upper_limit,
        });
    }
    Ok(())
}

/// Debounce gate for automatic rejoins
pub fn should_trigger_recovery(last_attempt: Option<i64>, now: i64, debounce_millis: i64) -> bool {
    match last_attempt {
        None => true,
        Some(last) => now.saturating_sub(last) >= debounce_millis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_epoch_window_boundaries() {
        assert!(validate_message_epoch(5, 10, 5).is_ok());
        assert!(validate_message_epoch(10, 10, 5).is_ok());
        assert!(validate_message_epoch(11, 10, 5).is_ok());
        assert!(matches!(
            validate_message_epoch(4, 10, 5),
            Err(MlsError::EpochOutOfRange { epoch: 4, min_epoch: 5 })
        ));
        // Young groups never underflow
        assert!(validate_message_epoch(0, 2, 5).is_ok());
    }

    #[test]
    fn test_sequence_upper_limit() {
        assert!(validate_message_sequence(100, 100).is_ok());
        assert!(matches!(
            validate_message_sequence(101, 100),
            Err(MlsError::SequenceOutOfBounds {
                sequence: 101,
                upper_limit: 100
            })
        ));
    }

    #[test]
    fn test_debounce() {
        assert!(should_trigger_recovery(None, 0, 60_000));
        assert!(!should_trigger_recovery(Some(1_000), 60_999, 60_000));
        assert!(should_trigger_recovery(Some(1_000), 61_000, 60_000));
    }

    proptest! {
        #[test]
        fn epoch_valid_iff_within_window(
            epoch in 0u64..1_000,
            current in 0u64..1_000,
            past in 0u64..20,
        ) {
            let valid = validate_message_epoch(epoch, current, past).is_ok();
            prop_assert_eq!(valid, epoch >= current.saturating_sub(past));
        }
    }
}
