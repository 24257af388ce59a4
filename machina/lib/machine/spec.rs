use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{MachinaError, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The immutable user input describing one machine.
///
/// The JSON shape is the `config` object of the create request:
///
/// ```json
/// {
///     "init": { "exec": ["/bin/sleep", "inf"] },
///     "auto_destroy": true,
///     "image": "alpine:latest",
///     "files": [{ "guest_path": "/main.sh", "raw_value": "<base64>" }],
///     "guest": { "cpu_kind": "shared", "cpus": 2, "memory_mb": 2048 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct MachineSpec {
    /// What the guest init should execute once the machine boots.
    #[serde(default)]
    #[builder(default)]
    init: InitSpec,

    /// Whether the machine is destroyed automatically when its hypervisor exits.
    #[serde(default)]
    #[builder(default)]
    auto_destroy: bool,

    /// The source container image reference.
    #[builder(setter(into))]
    image: String,

    /// Files injected into the guest at boot.
    #[serde(default)]
    #[builder(default)]
    files: Vec<FileInjection>,

    /// The guest machine shape.
    guest: GuestSpec,
}

/// The init program configuration for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct InitSpec {
    /// The argv the guest init executes.
    #[serde(default)]
    #[builder(default)]
    exec: Vec<String>,
}

/// One file injected into the guest filesystem at boot.
///
/// `raw_value` is base64; it is carried opaquely and decoded by the guest
/// init, not by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct FileInjection {
    /// Absolute path of the file inside the guest.
    #[builder(setter(into))]
    guest_path: String,

    /// Base64-encoded file content.
    #[builder(setter(into))]
    raw_value: String,
}

/// The guest machine shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct GuestSpec {
    /// The CPU kind requested for the guest. Recorded but not mapped onto a
    /// hypervisor knob.
    #[serde(default = "default_cpu_kind")]
    #[builder(default = default_cpu_kind())]
    cpu_kind: String,

    /// Number of vCPUs.
    cpus: u8,

    /// Guest memory in MB.
    memory_mb: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineSpec {
    /// Validates the parts of the spec that must be rejected before any
    /// resources are reserved.
    pub fn validate(&self) -> MachinaResult<()> {
        if self.image.trim().is_empty() {
            return Err(MachinaError::InvalidMachineSpec(
                "image reference is empty".to_string(),
            ));
        }
        if *self.guest.cpus() == 0 {
            return Err(MachinaError::InvalidMachineSpec(
                "guest cpu count is zero".to_string(),
            ));
        }
        if *self.guest.memory_mb() == 0 {
            return Err(MachinaError::InvalidMachineSpec(
                "guest memory is zero".to_string(),
            ));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_cpu_kind() -> String {
    "shared".to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserializes_the_wire_shape() -> anyhow::Result<()> {
        let spec: MachineSpec = serde_json::from_str(
            r#"{
                "init": { "exec": ["/bin/sleep", "inf"] },
                "auto_destroy": true,
                "image": "alpine:latest",
                "files": [{ "guest_path": "/main.sh", "raw_value": "ZWNobyBoaQo=" }],
                "guest": { "cpu_kind": "shared", "cpus": 2, "memory_mb": 2048 }
            }"#,
        )?;

        assert_eq!(spec.image(), "alpine:latest");
        assert!(*spec.auto_destroy());
        assert_eq!(spec.init().exec(), &["/bin/sleep", "inf"]);
        assert_eq!(spec.files().len(), 1);
        assert_eq!(spec.files()[0].guest_path(), "/main.sh");
        assert_eq!(*spec.guest().cpus(), 2);
        assert_eq!(*spec.guest().memory_mb(), 2048);

        Ok(())
    }

    #[test]
    fn test_spec_defaults_optional_sections() -> anyhow::Result<()> {
        let spec: MachineSpec = serde_json::from_str(
            r#"{ "image": "alpine", "guest": { "cpus": 1, "memory_mb": 256 } }"#,
        )?;

        assert!(!spec.auto_destroy());
        assert!(spec.init().exec().is_empty());
        assert!(spec.files().is_empty());
        assert_eq!(spec.guest().cpu_kind(), "shared");

        Ok(())
    }

    #[test]
    fn test_spec_validation_rejects_zero_shapes() {
        let no_cpus = MachineSpec::builder()
            .image("alpine")
            .guest(GuestSpec::builder().cpus(0).memory_mb(256).build())
            .build();
        assert!(matches!(
            no_cpus.validate(),
            Err(MachinaError::InvalidMachineSpec(_))
        ));

        let no_memory = MachineSpec::builder()
            .image("alpine")
            .guest(GuestSpec::builder().cpus(1).memory_mb(0).build())
            .build();
        assert!(no_memory.validate().is_err());

        let no_image = MachineSpec::builder()
            .image("")
            .guest(GuestSpec::builder().cpus(1).memory_mb(256).build())
            .build();
        assert!(no_image.validate().is_err());
    }
}
