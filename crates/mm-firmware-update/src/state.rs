//! Update lifecycle states and phases

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phases of an update attempt, in their fixed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdatePhase {
    /// Put the modem into programming mode
    Detach,
    /// Move payload bytes to the device
    Transfer,
    /// Return the modem to normal operation
    Attach,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Detach => write!(f, "detach"),
            UpdatePhase::Transfer => write!(f, "transfer"),
            UpdatePhase::Attach => write!(f, "attach"),
        }
    }
}

/// Per-device update state machine
///
/// `Idle -> Detaching -> (WaitingForReplug) -> Transferring -> Attaching ->
/// (WaitingForReplug) -> Idle`. Phases whose update method is absent are
/// skipped; the order never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdateState {
    /// No update in progress
    #[default]
    Idle,

    /// Sending the detach command
    Detaching,

    /// The device is expected to leave and rejoin the bus
    WaitingForReplug,

    /// Writing payloads
    Transferring,

    /// Releasing the device back to normal operation
    Attaching,

    /// The attempt aborted; the device is in whatever mode it was last seen in
    Failed {
        /// Phase that failed
        phase: UpdatePhase,
    },
}

impl UpdateState {
    /// Check if an update is currently in progress
    pub fn is_in_progress(&self) -> bool {
        !matches!(self, UpdateState::Idle | UpdateState::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress() {
        assert!(!UpdateState::Idle.is_in_progress());
        assert!(
            !UpdateState::Failed {
                phase: UpdatePhase::Transfer
            }
            .is_in_progress()
        );
        assert!(UpdateState::Detaching.is_in_progress());
        assert!(UpdateState::WaitingForReplug.is_in_progress());
        assert!(UpdateState::Attaching.is_in_progress());
    }

    #[test]
    fn test_state_serialization() -> Result<(), serde_json::Error> {
        let state = UpdateState::Failed {
            phase: UpdatePhase::Detach,
        };
        let json = serde_json::to_string(&state)?;
        let back: UpdateState = serde_json::from_str(&json)?;
        assert_eq!(state, back);
        Ok(())
    }
}
