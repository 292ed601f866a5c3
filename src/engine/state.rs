use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Concentrator lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcentratorState {
    Stopped,
    Running {
        #[serde(skip)]
        started_at: Option<Instant>,
    },
    Disposed,
}

impl ConcentratorState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &ConcentratorState) -> bool {
        use ConcentratorState::*;

        matches!(
            (self, target),
            (Stopped, Running { .. }) |
            (Running { .. }, Stopped) |
            (Stopped, Disposed)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Get human-readable state name
    pub fn name(&self) -> &str {
        match self {
            Self::Stopped => "Stopped",
            Self::Running { .. } => "Running",
            Self::Disposed => "Disposed",
        }
    }
}

impl Default for ConcentratorState {
    fn default() -> Self {
        Self::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let stopped = ConcentratorState::Stopped;
        let running = ConcentratorState::Running { started_at: None };

        assert!(stopped.can_transition_to(&running));
        assert!(running.can_transition_to(&stopped));
        assert!(!running.can_transition_to(&running));
    }

    #[test]
    fn test_disposed_is_terminal() {
        let disposed = ConcentratorState::Disposed;

        assert!(ConcentratorState::Stopped.can_transition_to(&disposed));
        assert!(!ConcentratorState::Running { started_at: None }.can_transition_to(&disposed));
        assert!(!disposed.can_transition_to(&ConcentratorState::Stopped));
        assert!(!disposed.can_transition_to(&ConcentratorState::Running { started_at: None }));
    }
}
