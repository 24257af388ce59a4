use std::path::{Path, PathBuf};

use getset::Getters;
use serde::{Deserialize, Serialize};

use crate::utils::{
    CONTROL_SOCKET_PREFIX, HYPERVISOR_LOG_FILENAME, INIT_DRIVE_FILENAME, MACHINES_SUBDIR,
    RENDERED_CONFIG_PREFIX, ROOTFS_EXTRACT_DIRNAME, ROOTFS_IMAGE_FILENAME, RUN_DOCUMENT_FILENAME,
    VSOCK_SOCKET_PREFIX,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Every on-disk location a machine owns, derived from its identifier.
///
/// The per-machine tree lives under `{home}/machines/{id}`; the control
/// socket, vsock socket and rendered hypervisor config live at well-known
/// `/tmp` paths keyed by the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct MachinePaths {
    /// The machine identifier the paths are keyed by.
    machine_id: String,

    /// The per-machine working directory.
    workdir: PathBuf,

    /// The init drive image (`tmpinit`), the boot-time root device.
    init_drive: PathBuf,

    /// The data root filesystem image built from the source image.
    rootfs_image: PathBuf,

    /// The directory image layers are extracted into before image assembly.
    rootfs_extract_dir: PathBuf,

    /// The hypervisor log file.
    hypervisor_log: PathBuf,

    /// The persisted machine run document.
    run_document: PathBuf,

    /// The hypervisor API control socket.
    control_socket: PathBuf,

    /// The unix socket backing the guest vsock device.
    vsock_socket: PathBuf,

    /// The rendered hypervisor configuration file.
    rendered_config: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachinePaths {
    /// Derives all paths for a machine id under the given machina home.
    pub fn new(home_dir: &Path, machine_id: &str) -> Self {
        let workdir = home_dir.join(MACHINES_SUBDIR).join(machine_id);
        let tmp = std::env::temp_dir();

        Self {
            machine_id: machine_id.to_string(),
            init_drive: workdir.join(INIT_DRIVE_FILENAME),
            rootfs_image: workdir.join(ROOTFS_IMAGE_FILENAME),
            rootfs_extract_dir: workdir.join(ROOTFS_EXTRACT_DIRNAME),
            hypervisor_log: workdir.join(HYPERVISOR_LOG_FILENAME),
            run_document: workdir.join(RUN_DOCUMENT_FILENAME),
            control_socket: tmp.join(format!("{}{}.socket", CONTROL_SOCKET_PREFIX, machine_id)),
            vsock_socket: tmp.join(format!("{}{}.sock", VSOCK_SOCKET_PREFIX, machine_id)),
            rendered_config: tmp.join(format!("{}{}.json", RENDERED_CONFIG_PREFIX, machine_id)),
            workdir,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_keyed_by_machine_id() {
        let paths = MachinePaths::new(Path::new("/srv/machina"), "0123456789abcd");

        assert_eq!(
            paths.workdir(),
            Path::new("/srv/machina/machines/0123456789abcd")
        );
        assert_eq!(
            paths.init_drive(),
            Path::new("/srv/machina/machines/0123456789abcd/tmpinit")
        );
        assert_eq!(
            paths.rootfs_image(),
            Path::new("/srv/machina/machines/0123456789abcd/rootfs.ext4")
        );
        assert_eq!(
            paths.hypervisor_log(),
            Path::new("/srv/machina/machines/0123456789abcd/firecracker.log")
        );
        assert_eq!(
            paths.run_document(),
            Path::new("/srv/machina/machines/0123456789abcd/run.json")
        );
        assert!(paths
            .control_socket()
            .to_string_lossy()
            .contains("machina-firecracker-0123456789abcd"));
        assert!(paths
            .vsock_socket()
            .to_string_lossy()
            .contains("machina-vsock-0123456789abcd"));
        assert!(paths
            .rendered_config()
            .to_string_lossy()
            .contains("machina-config-0123456789abcd"));
    }

    #[test]
    fn test_distinct_ids_never_share_paths() {
        let a = MachinePaths::new(Path::new("/srv/machina"), "aaaaaaaaaaaaaa");
        let b = MachinePaths::new(Path::new("/srv/machina"), "bbbbbbbbbbbbbb");

        assert_ne!(a.workdir(), b.workdir());
        assert_ne!(a.control_socket(), b.control_socket());
        assert_ne!(a.vsock_socket(), b.vsock_socket());
        assert_ne!(a.rendered_config(), b.rendered_config());
    }
}
