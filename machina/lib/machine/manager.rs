use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::{
    process::Child,
    sync::{Mutex, RwLock},
};
use typed_builder::TypedBuilder;

use crate::{
    guest::{GuestChannel, StatusReport, SysInfo},
    oci::{self, Reference},
    rootfs,
    utils::{self, get_init_image_path, get_machina_home_path},
    vm::{self, FirecrackerConfig},
    MachinaError, MachinaResult,
};

use super::{generate_machine_id, MachinePaths, MachineSpec, MachineState};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the exit monitor polls an auto-destroy machine's hypervisor.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Host-level configuration for a [`MachineManager`].
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct ManagerConfig {
    /// Root directory for per-machine state.
    #[builder(setter(into))]
    home_dir: PathBuf,

    /// The prebuilt init drive image copied into each machine's workdir.
    #[builder(setter(into))]
    init_image_path: PathBuf,

    /// Explicit hypervisor binary, overriding environment and `PATH` lookup.
    #[builder(default, setter(strip_option, into))]
    firecracker_bin: Option<PathBuf>,
}

/// The mutable runtime record of one machine.
///
/// A record is created on `create`, transitioned solely by its own
/// provisioning pipeline and the manager's stop/destroy operations, and
/// persisted to the machine's `run.json` after every transition. The
/// hypervisor child handle is exclusively owned here.
#[derive(Debug, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct MachineRecord {
    /// The machine identifier.
    id: String,

    /// The immutable user-provided spec.
    spec: MachineSpec,

    /// The current lifecycle state.
    state: MachineState,

    /// Every path the machine owns.
    paths: MachinePaths,

    /// When the machine was created.
    created_at: DateTime<Utc>,

    /// The error that moved the machine to `Failed`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,

    /// The supervised hypervisor process, once started.
    #[serde(skip)]
    #[getset(skip)]
    child: Option<Child>,
}

/// Owns machine identity and the lifecycle state machine.
///
/// `create` reserves a machine synchronously and dispatches its provisioning
/// pipeline onto an independent task, so machines provision fully in
/// parallel; each record is guarded by its own lock, and status reads never
/// observe a torn state.
#[derive(Debug)]
pub struct MachineManager {
    /// Host-level configuration.
    config: ManagerConfig,

    /// The live machine table. Records are never removed, so identifiers are
    /// unique for the process lifetime and `destroy` stays idempotent.
    machines: RwLock<HashMap<String, Arc<Mutex<MachineRecord>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ManagerConfig {
    /// Builds a config from the `MACHINA_*` environment.
    pub fn from_env() -> Self {
        Self {
            home_dir: get_machina_home_path(),
            init_image_path: get_init_image_path(),
            firecracker_bin: None,
        }
    }
}

impl MachineManager {
    /// Creates a manager with the given host configuration.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            machines: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a machine: validates the spec, allocates an identifier and
    /// record, synchronously reserves the derived paths (workdir, init drive
    /// payload, empty hypervisor log, run document), then dispatches the
    /// provisioning pipeline.
    ///
    /// Returns `(id, Created)` immediately; later state is observable through
    /// the run document and the error carried by [`MachinaError::NotReady`].
    pub async fn create(&self, spec: MachineSpec) -> MachinaResult<(String, MachineState)> {
        spec.validate()?;
        let _reference: Reference = spec.image().parse()?;

        // Allocate an unused id with check-and-retry while holding the table
        // lock, so two concurrent creates can never collide.
        let (id, record) = {
            let mut machines = self.machines.write().await;
            let id = loop {
                let candidate = generate_machine_id();
                if !machines.contains_key(&candidate) {
                    break candidate;
                }
            };

            let record = Arc::new(Mutex::new(MachineRecord {
                id: id.clone(),
                paths: MachinePaths::new(&self.config.home_dir, &id),
                spec,
                state: MachineState::Created,
                created_at: Utc::now(),
                last_error: None,
                child: None,
            }));
            machines.insert(id.clone(), Arc::clone(&record));

            (id, record)
        };

        if let Err(error) = self.reserve(&record).await {
            self.machines.write().await.remove(&id);
            return Err(error);
        }

        tokio::spawn(Self::run_pipeline(self.config.clone(), Arc::clone(&record)));

        tracing::info!("created machine {}", id);
        Ok((id, MachineState::Created))
    }

    /// Runs a command in a machine's guest. Requires the machine to be
    /// `Running`.
    pub async fn exec(&self, id: &str, cmd: &[String]) -> MachinaResult<String> {
        self.guest_channel(id).await?.exec(cmd).await
    }

    /// Queries a machine's guest health. Requires the machine to be `Running`.
    pub async fn status(&self, id: &str) -> MachinaResult<StatusReport> {
        self.guest_channel(id).await?.status().await
    }

    /// Queries a machine's guest metrics. Requires the machine to be `Running`.
    pub async fn sys_info(&self, id: &str) -> MachinaResult<SysInfo> {
        self.guest_channel(id).await?.sys_info().await
    }

    /// Stops a machine's hypervisor process, leaving its files in place.
    /// Repeat calls are no-ops.
    pub async fn stop(&self, id: &str) -> MachinaResult<MachineState> {
        let record = self.lookup(id).await?;
        let mut record = record.lock().await;

        if matches!(
            record.state,
            MachineState::Stopping | MachineState::Destroyed
        ) {
            return Ok(record.state);
        }

        if let Some(mut child) = record.child.take() {
            if let Err(error) = child.kill().await {
                tracing::warn!("failed to kill hypervisor for machine {}: {}", id, error);
            }
        }

        record.state = MachineState::Stopping;
        save_run_document(&record).await?;

        tracing::info!("stopped machine {}", id);
        Ok(record.state)
    }

    /// Destroys a machine: kills the supervised process if present, marks the
    /// record `Destroyed`, and removes the workdir and the machine's sockets
    /// and rendered config.
    ///
    /// Idempotent: destroying an already destroyed machine is a no-op, never
    /// an error. Unknown identifiers are [`MachinaError::NotFound`].
    pub async fn destroy(&self, id: &str) -> MachinaResult<MachineState> {
        let record = self.lookup(id).await?;
        Self::destroy_record(&record).await
    }

    /// Reserves a freshly allocated machine's on-disk state: workdir, init
    /// drive payload, empty hypervisor log, and the first run document.
    async fn reserve(&self, record: &Arc<Mutex<MachineRecord>>) -> MachinaResult<()> {
        let record = record.lock().await;

        tokio::fs::create_dir_all(record.paths.workdir()).await?;
        utils::copy_file(&self.config.init_image_path, record.paths.init_drive()).await?;
        // The hypervisor requires its log file to exist before it starts.
        tokio::fs::write(record.paths.hypervisor_log(), b"").await?;
        save_run_document(&record).await?;

        Ok(())
    }

    /// Resolves an id to its record, or [`MachinaError::NotFound`].
    async fn lookup(&self, id: &str) -> MachinaResult<Arc<Mutex<MachineRecord>>> {
        self.machines
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MachinaError::NotFound(id.to_string()))
    }

    /// Opens a guest channel for a `Running` machine.
    async fn guest_channel(&self, id: &str) -> MachinaResult<GuestChannel> {
        let record = self.lookup(id).await?;
        let record = record.lock().await;

        if !record.state.is_running() {
            return Err(MachinaError::NotReady {
                id: id.to_string(),
                state: record.state.to_string(),
            });
        }

        Ok(GuestChannel::new(record.paths.vsock_socket()))
    }

    /// Supervised pipeline driver: the outcome always lands on the record, so
    /// no failure can vanish silently.
    async fn run_pipeline(config: ManagerConfig, record: Arc<Mutex<MachineRecord>>) {
        if let Err(error) = Self::provision(config, &record).await {
            let mut record = record.lock().await;
            tracing::error!("provisioning failed for machine {}: {}", record.id, error);

            // A machine destroyed mid-pipeline keeps its terminal state.
            if !record.state.halts_pipeline() {
                record.state = MachineState::Failed;
                record.last_error = Some(error.to_string());
                if let Err(error) = save_run_document(&record).await {
                    tracing::warn!(
                        "failed to persist run document for machine {}: {}",
                        record.id,
                        error
                    );
                }
            }
        }

        // A destroy that raced the pipeline may have removed the workdir while
        // an in-flight stage was still writing into it; sweep again.
        let guard = record.lock().await;
        if guard.state == MachineState::Destroyed {
            let workdir = guard.paths.workdir().clone();
            drop(guard);
            if let Err(error) = tokio::fs::remove_dir_all(&workdir).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove workdir {}: {}", workdir.display(), error);
                }
            }
        }
    }

    /// The four provisioning stages, strictly sequential for one machine:
    /// extract → build → render → spawn. Before each stage transition the
    /// pipeline re-checks whether the machine was destroyed (or stopped) and
    /// aborts rather than leaving inconsistent on-disk or process state.
    async fn provision(
        config: ManagerConfig,
        record: &Arc<Mutex<MachineRecord>>,
    ) -> MachinaResult<()> {
        let (id, spec, paths) = {
            let mut record = record.lock().await;
            if record.state.halts_pipeline() {
                return Ok(());
            }
            record.state = MachineState::Provisioning;
            save_run_document(&record).await?;
            (record.id.clone(), record.spec.clone(), record.paths.clone())
        };

        let reference: Reference = spec.image().parse()?;

        tracing::info!("machine {}: extracting image {}", id, reference);
        oci::extract_from_image(&reference, paths.rootfs_extract_dir()).await?;

        if Self::halted(record).await {
            return Ok(());
        }

        tracing::info!("machine {}: building root filesystem image", id);
        rootfs::create_ext4_image(paths.rootfs_extract_dir(), paths.rootfs_image(), 0).await?;

        // The extracted tree is only left behind on failure, for inspection.
        if let Err(error) = tokio::fs::remove_dir_all(paths.rootfs_extract_dir()).await {
            tracing::warn!(
                "machine {}: failed to remove extracted layers: {}",
                id,
                error
            );
        }

        if Self::halted(record).await {
            return Ok(());
        }

        tracing::info!("machine {}: rendering hypervisor config", id);
        let vm_config = FirecrackerConfig::render(&spec, &paths)?;

        if Self::halted(record).await {
            return Ok(());
        }

        tracing::info!("machine {}: starting hypervisor", id);
        let child = vm::supervisor::start(&vm_config, &paths, config.firecracker_bin.as_deref())
            .await?;

        {
            let mut record = record.lock().await;
            if record.state.halts_pipeline() {
                // A destroy won the race while the hypervisor was spawning;
                // do not leak the process.
                let mut child = child;
                if let Err(error) = child.kill().await {
                    tracing::warn!("machine {}: failed to kill raced hypervisor: {}", id, error);
                }
                return Ok(());
            }

            record.child = Some(child);
            record.state = MachineState::Running;
            save_run_document(&record).await?;
        }

        if *spec.auto_destroy() {
            tokio::spawn(Self::monitor_exit(Arc::clone(record)));
        }

        tracing::info!("machine {} is running", id);
        Ok(())
    }

    /// Whether a racing stop/destroy has ended this machine's pipeline.
    async fn halted(record: &Arc<Mutex<MachineRecord>>) -> bool {
        record.lock().await.state.halts_pipeline()
    }

    /// Watches an auto-destroy machine's hypervisor and tears the machine
    /// down once the process exits.
    async fn monitor_exit(record: Arc<Mutex<MachineRecord>>) {
        loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;

            let mut guard = record.lock().await;
            match guard.child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::info!(
                            "hypervisor for machine {} exited with {}, auto-destroying",
                            guard.id,
                            status
                        );
                        drop(guard);
                        if let Err(error) = Self::destroy_record(&record).await {
                            tracing::warn!("auto-destroy failed: {}", error);
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(
                            "failed to poll hypervisor for machine {}: {}",
                            guard.id,
                            error
                        );
                        break;
                    }
                },
                // Stopped or destroyed elsewhere; nothing left to watch.
                None => break,
            }
        }
    }

    /// Destroys the machine behind a record: kill, mark, remove files.
    async fn destroy_record(record: &Arc<Mutex<MachineRecord>>) -> MachinaResult<MachineState> {
        let mut record = record.lock().await;

        if record.state == MachineState::Destroyed {
            return Ok(MachineState::Destroyed);
        }

        if let Some(mut child) = record.child.take() {
            if let Err(error) = child.kill().await {
                tracing::warn!(
                    "failed to kill hypervisor for machine {}: {}",
                    record.id,
                    error
                );
            }
        }

        record.state = MachineState::Destroyed;

        for path in [
            record.paths.control_socket(),
            record.paths.vsock_socket(),
            record.paths.rendered_config(),
        ] {
            if let Err(error) = tokio::fs::remove_file(path).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove {}: {}", path.display(), error);
                }
            }
        }

        if let Err(error) = tokio::fs::remove_dir_all(record.paths.workdir()).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to remove workdir {}: {}",
                    record.paths.workdir().display(),
                    error
                );
            }
        }

        tracing::info!("destroyed machine {}", record.id);
        Ok(MachineState::Destroyed)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Persists a record snapshot to the machine's run document.
async fn save_run_document(record: &MachineRecord) -> MachinaResult<()> {
    let document = serde_json::to_string_pretty(record)?;
    tokio::fs::write(record.paths().run_document(), document).await?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::TempDir;

    use crate::machine::GuestSpec;

    use super::*;

    fn test_manager(home: &TempDir) -> MachineManager {
        let init_image = home.path().join("tmpinit.ext4");
        std::fs::write(&init_image, b"prebuilt init drive").unwrap();

        MachineManager::new(
            ManagerConfig::builder()
                .home_dir(home.path())
                .init_image_path(init_image)
                .build(),
        )
    }

    fn sample_spec() -> MachineSpec {
        MachineSpec::builder()
            .image("alpine:latest")
            .guest(GuestSpec::builder().cpus(1).memory_mb(128).build())
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn test_create_returns_created_immediately_and_reserves_paths() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let (id, state) = manager.create(sample_spec()).await?;

        assert_eq!(state, MachineState::Created);

        let paths = MachinePaths::new(home.path(), &id);
        assert!(paths.workdir().is_dir());
        assert_eq!(
            tokio::fs::read(paths.init_drive()).await?,
            b"prebuilt init drive"
        );
        assert!(paths.hypervisor_log().exists());

        let document: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(paths.run_document()).await?)?;
        assert_eq!(document["id"], serde_json::json!(id));
        assert!(document["state"].is_string());
        assert_eq!(document["spec"]["image"], "alpine:latest");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_created_ids_never_collide() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let mut ids = HashSet::new();
        for _ in 0..8 {
            let (id, _) = manager.create(sample_spec()).await?;
            assert!(ids.insert(id), "machine id reused");
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_create_rejects_malformed_image_reference() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let spec = MachineSpec::builder()
            .image("NOT!!a//reference")
            .guest(GuestSpec::builder().cpus(1).memory_mb(128).build())
            .build();

        let result = manager.create(spec).await;

        assert!(matches!(result, Err(MachinaError::ImageReference(_))));
        assert!(manager.machines.read().await.is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_guest_operations_before_running_are_not_ready() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let (id, _) = manager.create(sample_spec()).await?;
        let result = manager.exec(&id, &["echo".to_string(), "hi".to_string()]).await;

        match result {
            Err(MachinaError::NotReady { id: ready_id, .. }) => assert_eq!(ready_id, id),
            other => panic!("expected NotReady, got {:?}", other.map(|_| ())),
        }

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_machine_is_not_found() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        assert!(matches!(
            manager.status("bbbbbbbbbbbbbb").await,
            Err(MachinaError::NotFound(_))
        ));
        assert!(matches!(
            manager.destroy("bbbbbbbbbbbbbb").await,
            Err(MachinaError::NotFound(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_destroy_is_idempotent() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let (id, _) = manager.create(sample_spec()).await?;
        let paths = MachinePaths::new(home.path(), &id);

        let first = manager.destroy(&id).await?;
        assert_eq!(first, MachineState::Destroyed);
        assert!(!paths.workdir().exists());

        // The second call is a no-op with the same end state, never an error.
        let second = manager.destroy(&id).await?;
        assert_eq!(second, MachineState::Destroyed);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_is_a_noop_after_destroy() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let (id, _) = manager.create(sample_spec()).await?;
        manager.destroy(&id).await?;

        assert_eq!(manager.stop(&id).await?, MachineState::Destroyed);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_destroyed_machine_rejects_guest_operations() -> anyhow::Result<()> {
        let home = TempDir::new()?;
        let manager = test_manager(&home);

        let (id, _) = manager.create(sample_spec()).await?;
        manager.destroy(&id).await?;

        assert!(matches!(
            manager.sys_info(&id).await,
            Err(MachinaError::NotReady { .. })
        ));

        Ok(())
    }
}
