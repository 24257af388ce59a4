use std::fmt;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a machine.
///
/// Transitions are driven solely by the machine manager:
/// `Created → Provisioning → Running → (Stopping → Destroyed) | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// The record exists and its paths are reserved; provisioning has not begun.
    Created,

    /// The provisioning pipeline is running.
    Provisioning,

    /// The hypervisor process is spawned and the guest is booting or booted.
    Running,

    /// The hypervisor process was stopped; the machine's files remain.
    Stopping,

    /// The machine is gone: process killed, files removed. Terminal.
    Destroyed,

    /// A provisioning stage failed; the last error is recorded. Terminal.
    Failed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineState {
    /// Whether guest-channel operations are allowed in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running)
    }

    /// Whether the provisioning pipeline must halt before its next stage.
    pub fn halts_pipeline(&self) -> bool {
        matches!(self, MachineState::Stopping | MachineState::Destroyed)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MachineState::Created => "created",
            MachineState::Provisioning => "provisioning",
            MachineState::Running => "running",
            MachineState::Stopping => "stopping",
            MachineState::Destroyed => "destroyed",
            MachineState::Failed => "failed",
        };
        write!(f, "{}", state)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_to_snake_case() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&MachineState::Created)?, "\"created\"");
        assert_eq!(
            serde_json::from_str::<MachineState>("\"provisioning\"")?,
            MachineState::Provisioning
        );
        Ok(())
    }

    #[test]
    fn test_pipeline_halt_states() {
        assert!(MachineState::Destroyed.halts_pipeline());
        assert!(MachineState::Stopping.halts_pipeline());
        assert!(!MachineState::Provisioning.halts_pipeline());
        assert!(!MachineState::Running.halts_pipeline());
    }
}
