use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    machine::{MachinePaths, MachineSpec},
    utils::get_kernel_path,
    MachinaResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed boot argument string. The custom init lives at the root of the
/// init drive, which is the boot-time root device.
pub const BOOT_ARGS: &str =
    "console=ttyS0 noapic reboot=k panic=1 pci=off nomodules rw init=/init";

/// The fixed vsock context id assigned to every guest.
pub const GUEST_CID: u32 = 3;

/// Maximum length of a Linux network interface name (IFNAMSIZ minus the NUL).
const TAP_NAME_MAX: usize = 15;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The declarative boot configuration handed to the firecracker binary.
///
/// The top-level key names are a literal compatibility contract with the
/// hypervisor's `--config-file` format; do not rename them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Kernel and boot arguments.
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,

    /// Block devices attached to the guest.
    pub drives: Vec<Drive>,

    /// vCPU and memory shape.
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,

    /// Guest network interfaces.
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,

    /// The vsock device backing the guest control channel.
    pub vsock: VsockDevice,
}

/// The `boot-source` section of the hypervisor config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the uncompressed kernel image on the host.
    pub kernel_image_path: String,

    /// Kernel boot arguments.
    pub boot_args: String,
}

/// One entry of the `drives` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    /// Identifier of the drive inside the guest.
    pub drive_id: String,

    /// Path to the backing block image on the host.
    pub path_on_host: String,

    /// Whether this drive is the boot-time root device.
    pub is_root_device: bool,

    /// Whether the guest sees the drive read-only.
    pub is_read_only: bool,
}

/// The `machine-config` section of the hypervisor config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,

    /// Guest memory in MiB.
    pub mem_size_mib: u32,

    /// Whether simultaneous multithreading is exposed to the guest.
    pub smt: bool,

    /// Whether dirty page tracking is enabled.
    pub track_dirty_pages: bool,
}

/// One entry of the `network-interfaces` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Identifier of the interface inside the guest.
    pub iface_id: String,

    /// MAC address presented to the guest.
    pub guest_mac: String,

    /// Name of the host TAP device backing the interface.
    pub host_dev_name: String,
}

/// The `vsock` section of the hypervisor config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockDevice {
    /// The guest-side vsock context id.
    pub guest_cid: u32,

    /// The host unix socket backing the vsock device.
    pub uds_path: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerConfig {
    /// Renders the boot configuration for one machine from its spec and
    /// derived paths.
    pub fn render(spec: &MachineSpec, paths: &MachinePaths) -> MachinaResult<Self> {
        let config = Self {
            boot_source: BootSource {
                kernel_image_path: get_kernel_path().display().to_string(),
                boot_args: BOOT_ARGS.to_string(),
            },
            drives: vec![
                Drive {
                    drive_id: "tmpinit".to_string(),
                    path_on_host: paths.init_drive().display().to_string(),
                    is_root_device: true,
                    is_read_only: false,
                },
                Drive {
                    drive_id: "rootfs".to_string(),
                    path_on_host: paths.rootfs_image().display().to_string(),
                    is_root_device: false,
                    is_read_only: false,
                },
            ],
            machine_config: MachineConfig {
                vcpu_count: *spec.guest().cpus(),
                mem_size_mib: *spec.guest().memory_mb(),
                smt: false,
                track_dirty_pages: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: generate_guest_mac(),
                host_dev_name: tap_device_name(paths.machine_id()),
            }],
            vsock: VsockDevice {
                guest_cid: GUEST_CID,
                uds_path: paths.vsock_socket().display().to_string(),
            },
        };

        Ok(config)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a locally-administered unicast MAC address.
///
/// The first octet marks the address locally administered and unicast; the
/// remaining five bytes come from a fresh random identifier. Collisions are
/// not cryptographically prevented, which is acceptable on a private bridge.
pub fn generate_guest_mac() -> String {
    let id = Uuid::new_v4();
    let bytes = id.as_bytes();

    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// Derives the host TAP device name for a machine id, bounded by IFNAMSIZ.
pub fn tap_device_name(machine_id: &str) -> String {
    let mut name = format!("tap-{}", machine_id);
    name.truncate(TAP_NAME_MAX);
    name
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::machine::{GuestSpec, InitSpec, MachineSpec};

    use super::*;

    fn test_spec() -> MachineSpec {
        MachineSpec::builder()
            .image("alpine:latest")
            .init(InitSpec::builder().exec(vec!["/bin/sleep".into(), "inf".into()]).build())
            .guest(GuestSpec::builder().cpus(2).memory_mb(2048).build())
            .build()
    }

    #[test]
    fn test_render_produces_contract_keys() -> anyhow::Result<()> {
        let paths = MachinePaths::new(Path::new("/tmp/machina-test"), "a1b2c3d4e5f607");
        let config = FirecrackerConfig::render(&test_spec(), &paths)?;

        let value = serde_json::to_value(&config)?;
        for key in [
            "boot-source",
            "drives",
            "machine-config",
            "network-interfaces",
            "vsock",
        ] {
            assert!(value.get(key).is_some(), "missing top-level key {}", key);
        }

        assert_eq!(value["machine-config"]["vcpu_count"], 2);
        assert_eq!(value["machine-config"]["mem_size_mib"], 2048);
        assert_eq!(value["machine-config"]["smt"], false);
        assert_eq!(value["machine-config"]["track_dirty_pages"], false);
        assert_eq!(value["boot-source"]["boot_args"], BOOT_ARGS);
        assert_eq!(value["vsock"]["guest_cid"], GUEST_CID);

        let drives = value["drives"].as_array().unwrap();
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[0]["drive_id"], "tmpinit");
        assert_eq!(drives[0]["is_root_device"], true);
        assert_eq!(drives[1]["drive_id"], "rootfs");
        assert_eq!(drives[1]["is_read_only"], false);

        Ok(())
    }

    #[test]
    fn test_generated_mac_is_local_unicast() {
        let re = regex::Regex::new(r"^02(:[0-9a-f]{2}){5}$").unwrap();
        for _ in 0..32 {
            let mac = generate_guest_mac();
            assert!(re.is_match(&mac), "unexpected mac format: {}", mac);
        }
    }

    #[test]
    fn test_tap_name_is_bounded() {
        let name = tap_device_name("a1b2c3d4e5f607");
        assert!(name.len() <= 15);
        assert!(name.starts_with("tap-"));
    }
}
