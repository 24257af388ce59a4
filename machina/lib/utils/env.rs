use std::{env, path::PathBuf};

use super::{ASSETS_SUBDIR, DEFAULT_MACHINA_HOME, INIT_IMAGE_FILENAME, KERNEL_FILENAME};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable pointing at the machina home directory.
pub const MACHINA_HOME_ENV: &str = "MACHINA_HOME";

/// Environment variable overriding the firecracker binary path.
pub const MACHINA_FIRECRACKER_BIN_ENV: &str = "MACHINA_FIRECRACKER_BIN";

/// Environment variable overriding the guest kernel image path.
pub const MACHINA_KERNEL_PATH_ENV: &str = "MACHINA_KERNEL_PATH";

/// Environment variable overriding the prebuilt init drive image path.
pub const MACHINA_INIT_IMAGE_ENV: &str = "MACHINA_INIT_IMAGE";

/// Environment variable overriding the REST server listen address.
pub const MACHINA_SERVER_ADDR_ENV: &str = "MACHINA_SERVER_ADDR";

/// The default REST server listen address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the machina home directory, from `MACHINA_HOME` or the default.
pub fn get_machina_home_path() -> PathBuf {
    env::var(MACHINA_HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| DEFAULT_MACHINA_HOME.clone())
}

/// Returns the guest kernel image path, from `MACHINA_KERNEL_PATH` or the
/// bundled asset location under the machina home.
pub fn get_kernel_path() -> PathBuf {
    env::var(MACHINA_KERNEL_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_machina_home_path().join(ASSETS_SUBDIR).join(KERNEL_FILENAME))
}

/// Returns the prebuilt init drive image path, from `MACHINA_INIT_IMAGE` or
/// the bundled asset location under the machina home.
pub fn get_init_image_path() -> PathBuf {
    env::var(MACHINA_INIT_IMAGE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            get_machina_home_path()
                .join(ASSETS_SUBDIR)
                .join(INIT_IMAGE_FILENAME)
        })
}

/// Returns the firecracker binary path override, if `MACHINA_FIRECRACKER_BIN` is set.
pub fn get_firecracker_bin_override() -> Option<PathBuf> {
    env::var(MACHINA_FIRECRACKER_BIN_ENV).ok().map(PathBuf::from)
}

/// Returns the REST server listen address, from `MACHINA_SERVER_ADDR` or the default.
pub fn get_server_addr() -> String {
    env::var(MACHINA_SERVER_ADDR_ENV).unwrap_or_else(|_| DEFAULT_SERVER_ADDR.to_string())
}
