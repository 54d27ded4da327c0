//! Spawns and supervises the hypervisor subprocess.
//!
//! Mirrors the reference runtime's invocation shape: `/bin/ip netns exec <namespace>
//! <hypervisor_binary> --api-sock <sock> {--config-file <cfg> | --level <lvl>
//! --log-path <path>} [--no-seccomp]`.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::process::Child;

use crate::error::ControllerError;
use crate::id::VmId;
use crate::process_spawner::ProcessSpawner;

/// Work directory layout for a single VM, rooted at `base_path/<vm_id>`.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub vm_dir: PathBuf,
    pub socket: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub log: PathBuf,
    pub config: PathBuf,
}

impl VmPaths {
    pub fn new(base_path: &Path, vm_id: &VmId) -> Self {
        let vm_dir = base_path.join(vm_id.as_ref());
        Self {
            socket: vm_dir.join("firecracker.sock"),
            stdout: vm_dir.join("stdout"),
            stderr: vm_dir.join("stderr"),
            log: vm_dir.join("log"),
            config: vm_dir.join("vm_config.json"),
            vm_dir,
        }
    }
}

/// Spawns the hypervisor binary inside a named network namespace and supervises its
/// exit.
pub struct SubprocessSupervisor<S: ProcessSpawner> {
    spawner: Arc<S>,
    ip_binary: PathBuf,
    hypervisor_binary: PathBuf,
}

impl<S: ProcessSpawner> SubprocessSupervisor<S> {
    pub fn new(spawner: Arc<S>, hypervisor_binary: impl Into<PathBuf>) -> Self {
        Self {
            spawner,
            ip_binary: PathBuf::from("/bin/ip"),
            hypervisor_binary: hypervisor_binary.into(),
        }
    }

    /// Directory, then stdout/stderr files, then (optionally) a pre-created log file,
    /// matching the reference runtime's exact ordering before spawn.
    async fn prepare_vm_dir(paths: &VmPaths, precreate_log: bool) -> Result<(Stdio, Stdio), std::io::Error> {
        tokio::fs::create_dir_all(&paths.vm_dir).await?;
        let mut perms = tokio::fs::metadata(&paths.vm_dir).await?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
        }
        tokio::fs::set_permissions(&paths.vm_dir, perms).await?;

        let stdout = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&paths.stdout)
            .await?
            .into_std()
            .await;
        let stderr = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&paths.stderr)
            .await?
            .into_std()
            .await;

        if precreate_log {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&paths.log)
                .await?;
        }

        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// Direct boot: the caller has already marshalled a `VmConfig` to `paths.config`.
    pub async fn spawn_direct_boot(
        &self,
        namespace: &str,
        paths: &VmPaths,
        no_seccomp: bool,
    ) -> Result<Child, ControllerError> {
        let (stdout, stderr) = Self::prepare_vm_dir(paths, false)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)?;

        let mut args = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            self.hypervisor_binary.to_string_lossy().into_owned(),
            "--api-sock".to_string(),
            paths.socket.to_string_lossy().into_owned(),
            "--config-file".to_string(),
            paths.config.to_string_lossy().into_owned(),
        ];
        if no_seccomp {
            args.push("--no-seccomp".to_string());
        }

        self.spawner
            .spawn(&self.ip_binary, args, stdout, stderr)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)
    }

    /// Blank VMM: no `--config-file`, only logging flags, never `--no-seccomp`. Used to
    /// stage an idle hypervisor for snapshot restore; always the vanilla executable,
    /// matching the reference runtime's `startVMM` (which never varies the executable
    /// or seccomp flag, unlike direct boot).
    pub async fn spawn_blank(&self, namespace: &str, paths: &VmPaths, log_level: &str) -> Result<Child, ControllerError> {
        let (stdout, stderr) = Self::prepare_vm_dir(paths, true)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)?;

        let args = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            self.hypervisor_binary.to_string_lossy().into_owned(),
            "--api-sock".to_string(),
            paths.socket.to_string_lossy().into_owned(),
            "--level".to_string(),
            log_level.to_string(),
            "--log-path".to_string(),
            paths.log.to_string_lossy().into_owned(),
        ];

        self.spawner
            .spawn(&self.ip_binary, args, stdout, stderr)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)
    }

    /// Send SIGTERM to the subprocess. Failure to signal an already-dead process is
    /// downgraded to a debug log, never an error (§7 propagation policy).
    pub fn send_sigterm(pid: u32, vm_id: &VmId) {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            log::debug!(target: "vmctl_core::supervisor", "vm_id={vm_id} SIGTERM delivery failed (likely already exited): {err}");
        }
    }

    /// Spawn a supervisor task that blocks on the child's exit and invokes
    /// `on_exit` with the final status. `on_exit` is responsible for removing the VM
    /// from the controller's maps under its own lock.
    pub fn supervise<F>(mut child: Child, vm_id: VmId, on_exit: F)
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    log::info!(target: "vmctl_core::supervisor", "vm_id={vm_id} subprocess exited: {status}");
                    on_exit(Some(status));
                }
                Ok(status) => {
                    log::warn!(target: "vmctl_core::supervisor", "vm_id={vm_id} subprocess exited non-zero: {status}");
                    on_exit(Some(status));
                }
                Err(err) => {
                    log::warn!(target: "vmctl_core::supervisor", "vm_id={vm_id} failed to await subprocess exit: {err}");
                    on_exit(None);
                }
            }
        });
    }
}
