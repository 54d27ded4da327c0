//! Owns the live-VM map and the idle VMM pool; implements the control-plane
//! operations named in §2.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::balloon;
use crate::config::{Balloon, BootSource, Drive, DaemonConfig, FaascaleMem, MachineConfig, NetworkInterface, VmConfig};
use crate::error::ControllerError;
use crate::function::FunctionCatalog;
use crate::guest_client::GuestClient;
use crate::hypervisor_client::{CreateSnapshotParams, LoadSnapshotParams};
use crate::id::VmId;
use crate::machine::{Machine, MachineState};
use crate::network::NetworkRegistry;
use crate::process_spawner::ProcessSpawner;
use crate::snapshot::{self, SnapshotHandle};
use crate::supervisor::{SubprocessSupervisor, VmPaths};

#[derive(Default)]
struct ControllerState {
    machines: HashMap<VmId, Arc<Machine>>,
    vmm_pool: HashSet<VmId>,
}

/// Owns `machines` and `vmm_pool` behind a single coarse mutex, held only for map
/// reads/writes and never across a hypervisor HTTP call (§5).
pub struct VmController<S: ProcessSpawner> {
    config: Arc<DaemonConfig>,
    networks: Arc<NetworkRegistry>,
    functions: Arc<dyn FunctionCatalog>,
    supervisor: Arc<SubprocessSupervisor<S>>,
    guest_client: GuestClient,
    state: std::sync::Mutex<ControllerState>,
}

impl<S: ProcessSpawner> VmController<S> {
    pub fn new(
        config: Arc<DaemonConfig>,
        networks: Arc<NetworkRegistry>,
        functions: Arc<dyn FunctionCatalog>,
        supervisor: Arc<SubprocessSupervisor<S>>,
    ) -> Self {
        Self {
            config,
            networks,
            functions,
            supervisor,
            guest_client: GuestClient::new(),
            state: std::sync::Mutex::new(ControllerState::default()),
        }
    }

    fn get_machine(&self, vm_id: &VmId) -> Result<Arc<Machine>, ControllerError> {
        self.state
            .lock()
            .unwrap()
            .machines
            .get(vm_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("vm", vm_id.to_string()))
    }

    /// Direct boot (`StartVM`, §4.4): builds a VM config, marshals it, and launches
    /// the hypervisor with `--config-file`.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_vm(
        self: &Arc<Self>,
        function_name: &str,
        namespace: &str,
        requested_vcpu: u32,
        requested_mem_mib: u64,
        enable_balloon: bool,
        enable_faascale: bool,
    ) -> Result<VmId, ControllerError> {
        if enable_balloon && enable_faascale {
            return Err(ControllerError::PreconditionViolated(
                "balloon and faascale memory modes are mutually exclusive".to_string(),
            ));
        }

        let function = self
            .functions
            .lookup(function_name)
            .ok_or_else(|| ControllerError::not_found("function", function_name))?;
        let network = self.networks.get(namespace)?.clone();

        let vcpu_count = if requested_vcpu == 0 { function.vcpu_count } else { requested_vcpu };
        let requested_mem_mib = if requested_mem_mib == 0 { function.mem_size_mib } else { requested_mem_mib };
        let machine_config = MachineConfig::new(vcpu_count, requested_mem_mib);

        let vm_id = VmId::generate();
        let paths = VmPaths::new(&self.config.base_path, &vm_id);

        let vm_config = VmConfig {
            boot_source: BootSource::new(function.kernel_path.clone()),
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: function.image_path.clone(),
                is_root_device: true,
                is_read_only: true,
            }],
            machine_config: machine_config.clone(),
            network_interfaces: vec![NetworkInterface {
                iface_id: network.iface_id.clone(),
                host_dev_name: network.host_dev_name.clone(),
                guest_mac: network.guest_mac.clone(),
            }],
            balloon: enable_balloon.then(|| Balloon::new(requested_mem_mib, function.mem_size_mib)),
            faascale_mem: enable_faascale.then(|| self.config.faascale_mem_config.unwrap_or_default().into()),
        };

        let initial_balloon_mib = vm_config.balloon.as_ref().map(|b| b.amount_mib).unwrap_or(0);

        tokio::fs::create_dir_all(&paths.vm_dir)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)?;
        let serialized = serde_json::to_vec(&vm_config).map_err(|err| ControllerError::Hypervisor(crate::error::HypervisorError::Serde(err)))?;
        tokio::fs::write(&paths.config, serialized)
            .await
            .map_err(ControllerError::SubprocessSpawnFailed)?;

        let child = self.supervisor.spawn_direct_boot(namespace, &paths, enable_faascale).await?;
        self.spawn_machine(vm_id.clone(), paths, network, enable_balloon, enable_faascale, initial_balloon_mib, child, function_name)
    }

    /// Blank VMM (`StartVMM`, §4.4): stages an idle hypervisor for snapshot restore.
    /// Inserted into `machines` first; only added to `vmm_pool` if still present
    /// there after the insert, preventing a dead subprocess from leaking into the pool.
    ///
    /// Always the vanilla executable with neither memory mode enabled, matching the
    /// reference runtime's `startVMM`: a blank VMM's `EnableBalloon`/`EnableFaascale`
    /// are left at their zero value regardless of what `LoadSnapshot` will later invoke.
    pub async fn start_vmm(self: &Arc<Self>, namespace: &str) -> Result<VmId, ControllerError> {
        let network = self.networks.get(namespace)?.clone();
        let vm_id = VmId::generate();
        let paths = VmPaths::new(&self.config.base_path, &vm_id);

        let child = self.supervisor.spawn_blank(namespace, &paths, &self.config.log_level).await?;

        let vm_id = self.spawn_machine(vm_id, paths, network, false, false, 0, child, "")?;

        let mut state = self.state.lock().unwrap();
        if state.machines.contains_key(&vm_id) {
            state.vmm_pool.insert(vm_id.clone());
        }
        Ok(vm_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_machine(
        self: &Arc<Self>,
        vm_id: VmId,
        paths: VmPaths,
        network: crate::network::NetworkBinding,
        enable_balloon: bool,
        enable_faascale: bool,
        initial_balloon_mib: u64,
        child: tokio::process::Child,
        function_name: &str,
    ) -> Result<VmId, ControllerError> {
        let pid = child.id().ok_or_else(|| {
            ControllerError::SubprocessSpawnFailed(std::io::Error::other("subprocess exited before its pid could be read"))
        })?;

        let machine = Arc::new(Machine::new(
            vm_id.clone(),
            paths.socket,
            paths.vm_dir,
            network,
            enable_balloon,
            enable_faascale,
            initial_balloon_mib,
            pid,
            function_name.to_string(),
        ));

        self.state.lock().unwrap().machines.insert(vm_id.clone(), machine);

        let controller = Arc::clone(self);
        let supervised_id = vm_id.clone();
        SubprocessSupervisor::<S>::supervise(child, vm_id.clone(), move |_status| {
            let mut state = controller.state.lock().unwrap();
            state.machines.remove(&supervised_id);
            state.vmm_pool.remove(&supervised_id);
        });

        Ok(vm_id)
    }

    /// `StopVM` (§4.4): sends SIGTERM and returns immediately; the supervisor
    /// performs actual cleanup on exit.
    pub async fn stop_vm(&self, vm_id: &VmId) -> Result<(), ControllerError> {
        let machine = self.get_machine(vm_id)?;
        SubprocessSupervisor::<S>::send_sigterm(machine.pid, vm_id);
        Ok(())
    }

    /// `TakeSnapshot` (§4.5): dial, pause, create, resume. A best-effort resume is
    /// attempted even if `create_snapshot` fails; the original error wins. If pause
    /// fails, no snapshot is taken and no resume is attempted.
    pub async fn take_snapshot(&self, vm_id: &VmId, params: CreateSnapshotParams) -> Result<(), ControllerError> {
        let machine = self.get_machine(vm_id)?;
        if let Some(parent) = params.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ControllerError::SubprocessSpawnFailed)?;
        }

        let mut inner = machine.lock().await;
        machine.http_client.dial().await?;
        machine.http_client.pause().await?;
        inner.state = MachineState::Paused;

        let create_result = machine.http_client.create_snapshot(&params).await;
        let resume_result = machine.http_client.resume().await;
        match create_result {
            Ok(()) => {
                inner.state = MachineState::Resumed;
                resume_result?;
                Ok(())
            }
            Err(err) => {
                if resume_result.is_ok() {
                    inner.state = MachineState::Resumed;
                }
                Err(err.into())
            }
        }
    }

    /// `LoadSnapshot` (§4.6). `fallback_namespace` is used only for the synchronous
    /// `start_vmm` fallback when the pool is empty; the fallback VMM is always started
    /// with neither memory mode enabled (see `start_vmm`), so a snapshot-restored VM
    /// never picks up a `-faascale` invoke suffix, matching the reference runtime.
    pub async fn load_snapshot(
        self: &Arc<Self>,
        snapshot: Arc<dyn SnapshotHandle>,
        use_ws_file: bool,
        load_params: LoadSnapshotParams,
        fallback_namespace: &str,
    ) -> Result<VmId, ControllerError> {
        snapshot::trigger_warm_up(Arc::clone(&snapshot), use_ws_file);

        let pooled = {
            let mut state = self.state.lock().unwrap();
            let popped = state.vmm_pool.iter().next().cloned();
            if let Some(ref vm_id) = popped {
                state.vmm_pool.remove(vm_id);
            }
            popped
        };

        let vm_id = match pooled {
            Some(vm_id) => vm_id,
            None => self.start_vmm(fallback_namespace).await?,
        };

        let machine = self.get_machine(&vm_id)?;
        let mut inner = machine.lock().await;
        inner.function = snapshot.function().to_string();

        machine.http_client.dial().await?;
        machine.http_client.load_snapshot(&load_params).await?;
        machine.http_client.resume().await?;
        inner.state = MachineState::Resumed;
        inner.snapshot = Some(Arc::downgrade(&snapshot));

        Ok(vm_id)
    }

    /// `WaitVMReady` (§4.7).
    pub async fn wait_vm_ready(&self, vm_id: &VmId) -> Result<(), ControllerError> {
        let machine = self.get_machine(vm_id)?;
        self.guest_client
            .wait_ready(machine.network.unique_addr, vm_id, machine.http_client.retry_schedule())
            .await
    }

    /// `InvokeFunction` (§4.7). `function.mem_size_mib` is resolved from the function
    /// catalog, not trusted from the caller, so it can never drift from the value
    /// `start_vm` used to size the balloon. Balloon VMs deflate by that amount before
    /// invoking and attempt a best-effort inflate afterward regardless of the
    /// invocation's outcome; the inflate's own failure is logged, never propagated.
    pub async fn invoke_function(
        &self,
        vm_id: &VmId,
        function_name: &str,
        params: Bytes,
        mincore: Option<i64>,
        mincore_size: Option<u64>,
    ) -> Result<Bytes, ControllerError> {
        if mincore.is_some() && mincore_size.is_some() {
            return Err(ControllerError::PreconditionViolated(
                "both mincore and mincore_size invocation modes were specified".to_string(),
            ));
        }

        let machine = self.get_machine(vm_id)?;
        let function = self
            .functions
            .lookup(function_name)
            .ok_or_else(|| ControllerError::not_found("function", function_name))?;
        let function_mem_mib = function.mem_size_mib;
        let (suffix, funcmem): (&str, u64) = if machine.enable_balloon {
            ("-balloon", 0)
        } else if machine.enable_faascale {
            ("-faascale", function_mem_mib)
        } else {
            ("", 0)
        };

        if machine.enable_balloon {
            let mut inner = machine.lock().await;
            balloon::resize(&machine, &mut inner.current_balloon_mib, -(function_mem_mib as i64)).await?;
        }

        let invoke_result = self
            .guest_client
            .invoke_function(
                machine.network.unique_addr,
                vm_id,
                function_name,
                suffix,
                funcmem,
                &self.config.redis_host,
                &self.config.redis_passwd,
                params,
            )
            .await;

        if machine.enable_balloon {
            let mut inner = machine.lock().await;
            if let Err(err) = balloon::resize(&machine, &mut inner.current_balloon_mib, function_mem_mib as i64).await {
                log::warn!(target: "vmctl_core::controller", "vm_id={vm_id} best-effort post-invocation inflate failed: {err}");
            }
        }

        invoke_result
    }
}
