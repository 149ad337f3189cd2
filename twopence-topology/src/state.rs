//! Instance lifecycle states and the transitions between them

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Nothing exists on the backend
    #[default]
    Absent,
    /// Created but never started
    Prepared,
    /// Up and reachable
    Running,
    /// Shut down, still present
    Stopped,
    /// Removed from the backend
    Destroyed,
    /// Exported as an image
    Packaged,
}

impl InstanceState {
    /// State after `operation`, or `None` if the operation is not allowed.
    #[must_use]
    pub fn transition(self, operation: Operation) -> Option<InstanceState> {
        use InstanceState::{Absent, Destroyed, Packaged, Prepared, Running, Stopped};
        match (self, operation) {
            (state, Operation::Detect) => Some(state),
            (Absent, Operation::Prepare) => Some(Prepared),
            (Prepared | Stopped, Operation::Start) => Some(Running),
            (Running, Operation::RunStage) => Some(Running),
            (Running, Operation::Stop) => Some(Stopped),
            (Prepared | Stopped | Packaged, Operation::Destroy) => Some(Destroyed),
            (Stopped, Operation::Package) => Some(Packaged),
            _ => None,
        }
    }

    /// Whether the backend holds resources for the instance.
    #[must_use]
    pub fn exists(self) -> bool {
        matches!(
            self,
            InstanceState::Prepared | InstanceState::Running | InstanceState::Stopped | InstanceState::Packaged
        )
    }

    /// Whether two states describe the same backend reality.
    ///
    /// Backends cannot tell a packaged instance from a stopped one, nor a
    /// destroyed one from one that never existed.
    #[must_use]
    pub fn agrees_with(self, observed: InstanceState) -> bool {
        use InstanceState::{Absent, Destroyed, Packaged, Stopped};
        self == observed
            || matches!(
                (self, observed),
                (Packaged, Stopped) | (Destroyed, Absent) | (Absent, Destroyed)
            )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Absent => "absent",
            InstanceState::Prepared => "prepared",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Destroyed => "destroyed",
            InstanceState::Packaged => "packaged",
        };
        f.write_str(name)
    }
}

/// Lifecycle operation on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Create backend resources
    Prepare,
    /// Boot
    Start,
    /// Execute one provisioning stage
    RunStage,
    /// Shut down
    Stop,
    /// Remove backend resources
    Destroy,
    /// Export as an image
    Package,
    /// Query the backend
    Detect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Prepare => "prepare",
            Operation::Start => "start",
            Operation::RunStage => "run a stage on",
            Operation::Stop => "stop",
            Operation::Destroy => "destroy",
            Operation::Package => "package",
            Operation::Detect => "detect",
        };
        f.write_str(name)
    }
}

/// Provisioning interrupted by a reboot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stage that requested the reboot
    pub stage: String,
    /// Its index in the node's full stage list
    pub index: usize,
    /// Length of the full stage list
    pub total: usize,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage {} of {} completed, reboot pending",
            self.index + 1,
            self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_path() {
        let mut state = InstanceState::Absent;
        for op in [
            Operation::Prepare,
            Operation::Start,
            Operation::RunStage,
            Operation::Stop,
            Operation::Start,
            Operation::Stop,
            Operation::Package,
            Operation::Destroy,
        ] {
            state = state.transition(op).unwrap();
        }
        assert_eq!(state, InstanceState::Destroyed);
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(InstanceState::Running.transition(Operation::Package), None);
        assert_eq!(InstanceState::Running.transition(Operation::Destroy), None);
        assert_eq!(InstanceState::Absent.transition(Operation::Start), None);
        assert_eq!(InstanceState::Prepared.transition(Operation::Prepare), None);
        assert_eq!(InstanceState::Destroyed.transition(Operation::Start), None);
        assert_eq!(InstanceState::Stopped.transition(Operation::RunStage), None);
    }

    #[test]
    fn test_detect_never_changes_state() {
        for state in [
            InstanceState::Absent,
            InstanceState::Running,
            InstanceState::Packaged,
        ] {
            assert_eq!(state.transition(Operation::Detect), Some(state));
        }
    }

    #[test]
    fn test_checkpoint_display() {
        let checkpoint = Checkpoint {
            stage: "relabel".to_string(),
            index: 2,
            total: 4,
        };
        assert_eq!(checkpoint.to_string(), "stage 3 of 4 completed, reboot pending");
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&InstanceState::Packaged).unwrap(), "\"packaged\"");
        assert_eq!(serde_json::to_string(&Operation::RunStage).unwrap(), "\"run-stage\"");
    }
}
