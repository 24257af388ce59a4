use std::path::PathBuf;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory where machina artifacts, assets and machine state are stored.
pub const MACHINA_SUBDIR: &str = ".machina";

/// The sub directory under the machina home where per-machine workdirs live.
pub const MACHINES_SUBDIR: &str = "machines";

/// The sub directory under the machina home where bundled assets (kernel, init image) live.
pub const ASSETS_SUBDIR: &str = "assets";

/// The file name of the per-machine init drive image.
pub const INIT_DRIVE_FILENAME: &str = "tmpinit";

/// The file name of the per-machine data root filesystem image.
pub const ROOTFS_IMAGE_FILENAME: &str = "rootfs.ext4";

/// The directory name the image layers are extracted into before image assembly.
pub const ROOTFS_EXTRACT_DIRNAME: &str = "rootfs.extract";

/// The file name of the per-machine hypervisor log.
pub const HYPERVISOR_LOG_FILENAME: &str = "firecracker.log";

/// The file name of the persisted machine run document.
pub const RUN_DOCUMENT_FILENAME: &str = "run.json";

/// The default kernel image file name under the assets directory.
pub const KERNEL_FILENAME: &str = "vmlinux";

/// The default prebuilt init drive image file name under the assets directory.
pub const INIT_IMAGE_FILENAME: &str = "tmpinit.ext4";

/// Prefix for the per-machine hypervisor control socket under `/tmp`.
pub const CONTROL_SOCKET_PREFIX: &str = "machina-firecracker-";

/// Prefix for the per-machine vsock unix socket under `/tmp`.
pub const VSOCK_SOCKET_PREFIX: &str = "machina-vsock-";

/// Prefix for the per-machine rendered hypervisor config under `/tmp`.
pub const RENDERED_CONFIG_PREFIX: &str = "machina-config-";

lazy_static::lazy_static! {
    /// The default path where machina artifacts, assets and machine state are stored.
    pub static ref DEFAULT_MACHINA_HOME: PathBuf = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(MACHINA_SUBDIR);
}
