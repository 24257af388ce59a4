use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};

use crate::{
    machine::MachinePaths,
    utils::get_firecracker_bin_override,
    MachinaError, MachinaResult,
};

use super::FirecrackerConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The hypervisor binary name looked up on `PATH` when no override is set.
const FIRECRACKER_BIN: &str = "firecracker";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Writes the rendered configuration and spawns the hypervisor process for
/// one machine, bound to its unique control socket.
///
/// Returns once the process itself is spawned; guest boot completion is not
/// awaited. The child's stdout/stderr are appended to the machine's
/// hypervisor log for diagnosis. Post-spawn failures (crash, panic) are
/// observable only through process exit and that log; there is no automatic
/// restart.
pub async fn start(
    config: &FirecrackerConfig,
    paths: &MachinePaths,
    bin_override: Option<&Path>,
) -> MachinaResult<Child> {
    let document = serde_json::to_string_pretty(config)
        .map_err(|e| MachinaError::Config(format!("failed to encode hypervisor config: {}", e)))?;
    tokio::fs::write(paths.rendered_config(), document).await?;

    let binary = resolve_binary(bin_override)?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.hypervisor_log())
        .map_err(|e| {
            MachinaError::Spawn(format!(
                "failed to open hypervisor log {}: {}",
                paths.hypervisor_log().display(),
                e
            ))
        })?;
    let stderr_log = log.try_clone().map_err(MachinaError::Io)?;

    let child = Command::new(&binary)
        .arg("--api-sock")
        .arg(paths.control_socket())
        .arg("--config-file")
        .arg(paths.rendered_config())
        .arg("--log-path")
        .arg(paths.hypervisor_log())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .spawn()
        .map_err(|e| {
            MachinaError::Spawn(format!(
                "failed to spawn {} for machine {}: {}",
                binary.display(),
                paths.machine_id(),
                e
            ))
        })?;

    tracing::info!(
        "spawned hypervisor for machine {} (pid {:?}) on {}",
        paths.machine_id(),
        child.id(),
        paths.control_socket().display()
    );

    Ok(child)
}

/// Resolves the hypervisor binary: explicit override, then the
/// `MACHINA_FIRECRACKER_BIN` environment variable, then `PATH`.
fn resolve_binary(bin_override: Option<&Path>) -> MachinaResult<PathBuf> {
    if let Some(path) = bin_override {
        return Ok(path.to_path_buf());
    }

    if let Some(path) = get_firecracker_bin_override() {
        return Ok(path);
    }

    which::which(FIRECRACKER_BIN).map_err(|e| {
        MachinaError::Spawn(format!("{} binary not found: {}", FIRECRACKER_BIN, e))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::machine::MachinePaths;
    use crate::vm::FirecrackerConfig;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_start_with_missing_binary_is_spawn_error() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let paths = MachinePaths::new(home.path(), "deadbeef001122");
        tokio::fs::create_dir_all(paths.workdir()).await?;
        tokio::fs::write(paths.hypervisor_log(), b"").await?;

        let spec = crate::machine::MachineSpec::builder()
            .image("alpine:latest")
            .guest(
                crate::machine::GuestSpec::builder()
                    .cpus(1)
                    .memory_mb(256)
                    .build(),
            )
            .build();
        let config = FirecrackerConfig::render(&spec, &paths)?;

        let result = start(
            &config,
            &paths,
            Some(home.path().join("no-such-firecracker").as_path()),
        )
        .await;

        assert!(matches!(result, Err(MachinaError::Spawn(_))));

        // The rendered config was still written to its temp path.
        assert!(paths.rendered_config().exists());
        tokio::fs::remove_file(paths.rendered_config()).await?;

        Ok(())
    }
}
