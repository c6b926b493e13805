//! Controller lifecycle state.

use serde::{Deserialize, Serialize};

/// Sweep controller state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Initializing ──> Sweeping ──> Finalizing ──> Shutdown
///  │            │              │             │             ▲
///  └────────────┴──────────────┴─────────────┴──error──────┘
/// ```
///
/// `Shutdown` is terminal: a controller runs at most one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Devices constructed, nothing energized by the sweep yet
    Idle,
    /// Activation channels are being brought to their control voltages
    Initializing,
    /// Consuming setpoints
    Sweeping,
    /// Flushing results to the sink
    Finalizing,
    /// Devices returned to idle
    Shutdown,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Initializing => write!(f, "Initializing"),
            ControllerState::Sweeping => write!(f, "Sweeping"),
            ControllerState::Finalizing => write!(f, "Finalizing"),
            ControllerState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl ControllerState {
    /// Check if the state allows starting a run.
    pub fn can_begin(&self) -> bool {
        matches!(self, ControllerState::Idle)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ControllerState) -> bool {
        use ControllerState::*;
        match (self, next) {
            (Shutdown, _) => false,
            (_, Shutdown) => true,
            (Idle, Initializing) | (Initializing, Sweeping) | (Sweeping, Finalizing) => true,
            _ => false,
        }
    }

    /// Whether the controller has finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ControllerState::*;

    #[test]
    fn forward_path_is_linear() {
        assert!(Idle.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Sweeping));
        assert!(Sweeping.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Shutdown));

        assert!(!Idle.can_transition_to(Sweeping));
        assert!(!Sweeping.can_transition_to(Initializing));
        assert!(!Finalizing.can_transition_to(Sweeping));
    }

    #[test]
    fn every_live_state_can_exit_to_shutdown() {
        for state in [Idle, Initializing, Sweeping, Finalizing] {
            assert!(state.can_transition_to(Shutdown), "{state}");
        }
        assert!(!Shutdown.can_transition_to(Shutdown));
        assert!(!Shutdown.can_transition_to(Idle));
        assert!(Shutdown.is_terminal());
        assert!(!Shutdown.can_begin());
    }
}
