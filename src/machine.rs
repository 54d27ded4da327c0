//! The in-memory VM record.

use std::path::PathBuf;
use std::sync::Weak;

use crate::hypervisor_client::HypervisorClient;
use crate::id::VmId;
use crate::network::NetworkBinding;
use crate::snapshot::SnapshotHandle;

/// VM lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Uninitialized,
    Ready,
    Paused,
    Resumed,
    Stopped,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Uninitialized => write!(f, "uninitialized"),
            MachineState::Ready => write!(f, "ready"),
            MachineState::Paused => write!(f, "paused"),
            MachineState::Resumed => write!(f, "resumed"),
            MachineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Mutable fields serialized under the per-VM lock: everything a multi-request
/// hypervisor exchange (pause→snapshot→resume, balloon-resize→poll) touches.
pub struct MachineInner {
    pub function: String,
    pub state: MachineState,
    pub current_balloon_mib: u64,
    pub snapshot: Option<Weak<dyn SnapshotHandle>>,
}

/// An in-memory handle to a live or pooled VM. Never `Clone` — always shared as
/// `Arc<Machine>` so the per-VM mutex and `HypervisorClient` are shared, not
/// duplicated.
pub struct Machine {
    pub vm_id: VmId,
    pub socket: PathBuf,
    pub vm_path: PathBuf,
    pub network: NetworkBinding,
    pub enable_balloon: bool,
    pub enable_faascale: bool,
    /// The VMM subprocess's pid, immutable after creation (§3 invariant). The
    /// subprocess itself is owned exclusively by its supervisor task so that
    /// `wait()` never races with anything else; this crate only ever needs the pid,
    /// to deliver SIGTERM.
    pub pid: u32,
    pub http_client: HypervisorClient,
    inner: tokio::sync::Mutex<MachineInner>,
}

impl Machine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vm_id: VmId,
        socket: PathBuf,
        vm_path: PathBuf,
        network: NetworkBinding,
        enable_balloon: bool,
        enable_faascale: bool,
        initial_balloon_mib: u64,
        pid: u32,
        function: String,
    ) -> Self {
        let http_client = HypervisorClient::new(&socket);
        Self {
            vm_id,
            socket,
            vm_path,
            network,
            enable_balloon,
            enable_faascale,
            pid,
            http_client,
            inner: tokio::sync::Mutex::new(MachineInner {
                function,
                state: MachineState::Uninitialized,
                current_balloon_mib: initial_balloon_mib,
                snapshot: None,
            }),
        }
    }

    /// Acquire the per-VM lock guarding all mutable state and multi-request
    /// exchanges. Held for the full duration of pause→snapshot→resume and
    /// balloon-resize→poll sequences (§3, §5).
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, MachineInner> {
        self.inner.lock().await
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("vm_id", &self.vm_id)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}
