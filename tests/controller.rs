//! Exercises `VmController` end-to-end against a fake hypervisor subprocess: a mock
//! HTTP server bound to the exact control socket path the controller would have
//! handed a real hypervisor binary, discovered from the `--api-sock` argument, plus a
//! mock guest agent reached over loopback TCP for invocation scenarios.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tokio::process::{Child, Command};

use vmctl_core::controller::VmController;
use vmctl_core::error::ControllerError;
use vmctl_core::function::{FunctionCatalog, FunctionSpec};
use vmctl_core::hypervisor_client::{CreateSnapshotParams, LoadSnapshotParams};
use vmctl_core::network::{NetworkBinding, NetworkRegistry};
use vmctl_core::process_spawner::ProcessSpawner;
use vmctl_core::snapshot::SnapshotHandle;

struct FakeFunctionCatalog;

impl FunctionCatalog for FakeFunctionCatalog {
    fn lookup(&self, name: &str) -> Option<FunctionSpec> {
        Some(FunctionSpec {
            name: name.to_string(),
            kernel_path: PathBuf::from("/tmp/vmlinux"),
            image_path: PathBuf::from("/tmp/rootfs.img"),
            vcpu_count: 1,
            mem_size_mib: 64,
        })
    }
}

struct FakeSnapshot {
    function: String,
    path: PathBuf,
    latch: tokio::sync::OnceCell<()>,
}

impl SnapshotHandle for FakeSnapshot {
    fn function(&self) -> &str {
        &self.function
    }
    fn snapshot_path(&self) -> &std::path::Path {
        &self.path
    }
    fn mem_file_path(&self) -> Option<&std::path::Path> {
        None
    }
    fn has_mincore_layers(&self) -> bool {
        false
    }
    fn warm_up_latch(&self) -> &tokio::sync::OnceCell<()> {
        &self.latch
    }
    fn load_ws_file(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
    fn load_mincore(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Shared observation point for the mock hypervisor control socket: records every
/// pause/resume/create-snapshot call and the full sequence of `PATCH /balloon` targets,
/// and can be told to fail the next pause.
#[derive(Default)]
struct MockHypervisorState {
    balloon_mib: AtomicU64,
    balloon_history: Mutex<Vec<u64>>,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    create_calls: AtomicUsize,
    fail_pause: AtomicBool,
}

/// Stands in for the real hypervisor binary: instead of exec-ing firecracker, it
/// starts a mock control socket bound at the `--api-sock` path it was asked to use,
/// then spawns a harmless long-lived process for the supervisor to track.
struct FakeProcessSpawner {
    hypervisor: Arc<MockHypervisorState>,
}

impl ProcessSpawner for FakeProcessSpawner {
    async fn spawn(&self, _binary_path: &std::path::Path, arguments: Vec<String>, stdout: Stdio, stderr: Stdio) -> Result<Child, std::io::Error> {
        let socket_idx = arguments.iter().position(|a| a == "--api-sock").expect("fake spawner expects --api-sock");
        let socket_path = PathBuf::from(&arguments[socket_idx + 1]);
        spawn_mock_hypervisor(socket_path, Arc::clone(&self.hypervisor));

        Command::new("sleep").arg("3600").stdout(stdout).stderr(stderr).stdin(Stdio::null()).kill_on_drop(true).spawn()
    }
}

fn spawn_mock_hypervisor(socket_path: PathBuf, state: Arc<MockHypervisorState>) {
    tokio::spawn(async move {
        let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind mock hypervisor socket");
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let state = Arc::clone(&state);
                    async move {
                        let (parts, body) = req.into_parts();
                        let bytes = body.collect().await.unwrap().to_bytes();
                        let status = match (parts.method.as_str(), parts.uri.path()) {
                            ("GET", "/") => 200,
                            ("PATCH", "/vm") => {
                                let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                                if json["state"] == "Paused" {
                                    state.pause_calls.fetch_add(1, Ordering::SeqCst);
                                    if state.fail_pause.load(Ordering::SeqCst) { 500 } else { 204 }
                                } else {
                                    state.resume_calls.fetch_add(1, Ordering::SeqCst);
                                    204
                                }
                            }
                            ("PUT", "/snapshot/create") => {
                                state.create_calls.fetch_add(1, Ordering::SeqCst);
                                204
                            }
                            ("PUT", "/snapshot/load") => 204,
                            ("PATCH", "/balloon") => {
                                let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                                let mib = json["amount_mib"].as_u64().unwrap();
                                state.balloon_mib.store(mib, Ordering::SeqCst);
                                state.balloon_history.lock().unwrap().push(mib);
                                204
                            }
                            ("GET", "/balloon/statistics") => {
                                let mib = state.balloon_mib.load(Ordering::SeqCst);
                                let body = serde_json::to_vec(&serde_json::json!({
                                    "target_pages": mib * 256,
                                    "actual_pages": mib * 256,
                                    "target_mib": mib,
                                    "actual_mib": mib,
                                }))
                                .unwrap();
                                return Ok::<_, std::convert::Infallible>(
                                    hyper::Response::builder().status(200).body(Full::new(Bytes::from(body))).unwrap(),
                                );
                            }
                            _ => 404,
                        };
                        Ok(hyper::Response::builder().status(status).body(Full::new(Bytes::new())).unwrap())
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
}

/// A mock in-guest agent, reached over plain TCP the way the real one is: answers the
/// readiness probe and records every `/invoke` query string it receives.
#[derive(Default)]
struct MockGuestAgentState {
    invocations: Mutex<Vec<String>>,
}

fn spawn_mock_guest_agent(addr: std::net::IpAddr, state: Arc<MockGuestAgentState>) {
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind((addr, 5000)).await.expect("bind mock guest agent");
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let io = hyper_util::rt::TokioIo::new(stream);
                let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let state = Arc::clone(&state);
                    async move {
                        let (parts, body) = req.into_parts();
                        let _ = body.collect().await;
                        let response = if parts.uri.path() == "/" {
                            hyper::Response::builder().status(200).body(Full::new(Bytes::from_static(b"Hello, World!"))).unwrap()
                        } else {
                            state.invocations.lock().unwrap().push(parts.uri.query().unwrap_or("").to_string());
                            hyper::Response::builder().status(200).body(Full::new(Bytes::from_static(b"invoked"))).unwrap()
                        };
                        Ok::<_, std::convert::Infallible>(response)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
}

fn test_network(namespace: &str, addr: std::net::IpAddr) -> NetworkBinding {
    NetworkBinding {
        namespace: namespace.to_string(),
        host_dev_name: "tap0".to_string(),
        iface_id: "eth0".to_string(),
        guest_mac: "AA:FC:00:00:00:01".to_string(),
        guest_addr: addr,
        unique_addr: addr,
    }
}

fn build_controller(base_path: PathBuf, addr: std::net::IpAddr, hypervisor: Arc<MockHypervisorState>) -> Arc<VmController<FakeProcessSpawner>> {
    let config = Arc::new(vmctl_core::config::DaemonConfig {
        log_level: "Info".to_string(),
        base_path,
        images: vec![],
        kernels: vec![],
        executables: vec![],
        redis_host: "127.0.0.1".to_string(),
        redis_passwd: "secret".to_string(),
        faascale_mem_config: None,
    });
    let networks = Arc::new(NetworkRegistry::new([test_network("ns0", addr)]));
    let supervisor = Arc::new(vmctl_core::supervisor::SubprocessSupervisor::new(Arc::new(FakeProcessSpawner { hypervisor }), "firecracker"));
    Arc::new(VmController::new(config, networks, Arc::new(FakeFunctionCatalog), supervisor))
}

#[tokio::test]
async fn start_vm_then_stop_vm_removes_it_from_the_controller() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());

    let vm_id = controller.start_vm("hello", "ns0", 0, 0, false, false).await.unwrap();
    controller.stop_vm(&vm_id).await.unwrap();

    // give the supervisor task a moment to observe the child's exit.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let err = controller.stop_vm(&vm_id).await.unwrap_err();
    assert_matches!(err, ControllerError::NotFound { what: "vm", .. });
}

#[tokio::test]
async fn start_vm_rejects_mutually_exclusive_memory_modes() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());

    let err = controller.start_vm("hello", "ns0", 0, 0, true, true).await.unwrap_err();
    assert_matches!(err, ControllerError::PreconditionViolated(_));
}

#[tokio::test]
async fn take_snapshot_pauses_and_resumes_around_a_create() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisorState::default());
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::clone(&hypervisor));
    let vm_id = controller.start_vm("hello", "ns0", 0, 0, false, false).await.unwrap();

    let snap_dir = dir.path().join("snap");
    let params = CreateSnapshotParams {
        snapshot_type: "Full",
        snapshot_path: snap_dir.join("state"),
        mem_file_path: snap_dir.join("mem"),
        version: None,
    };
    controller.take_snapshot(&vm_id, params).await.unwrap();

    assert_eq!(hypervisor.pause_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hypervisor.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hypervisor.resume_calls.load(Ordering::SeqCst), 1);
}

/// S6: a failing pause must abort the snapshot before `/snapshot/create` is ever
/// reached, and must not attempt a resume (there is nothing paused to resume from).
#[tokio::test]
async fn take_snapshot_aborts_and_skips_create_and_resume_when_pause_fails() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisorState::default());
    hypervisor.fail_pause.store(true, Ordering::SeqCst);
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::clone(&hypervisor));
    let vm_id = controller.start_vm("hello", "ns0", 0, 0, false, false).await.unwrap();

    let snap_dir = dir.path().join("snap");
    let params = CreateSnapshotParams {
        snapshot_type: "Full",
        snapshot_path: snap_dir.join("state"),
        mem_file_path: snap_dir.join("mem"),
        version: None,
    };
    let err = controller.take_snapshot(&vm_id, params).await.unwrap_err();

    assert_matches!(err, ControllerError::Hypervisor(_));
    assert_eq!(hypervisor.pause_calls.load(Ordering::SeqCst), 1);
    assert_eq!(hypervisor.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(hypervisor.resume_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn load_snapshot_falls_back_to_starting_a_fresh_vmm_when_the_pool_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());

    let snapshot = Arc::new(FakeSnapshot {
        function: "hello".to_string(),
        path: dir.path().join("snap/state"),
        latch: tokio::sync::OnceCell::new(),
    });
    let params = LoadSnapshotParams {
        snapshot_path: snapshot.snapshot_path().to_path_buf(),
        load_ws: false,
        ..Default::default()
    };

    let vm_id = controller.load_snapshot(snapshot, false, params, "ns0").await.unwrap();
    controller.wait_vm_ready(&vm_id).await.unwrap_err(); // no real guest agent is listening
}

#[tokio::test]
async fn load_snapshot_reuses_a_pooled_vmm() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());
    let pooled_id = controller.start_vmm("ns0").await.unwrap();

    let snapshot = Arc::new(FakeSnapshot {
        function: "hello".to_string(),
        path: dir.path().join("snap/state"),
        latch: tokio::sync::OnceCell::new(),
    });
    let params = LoadSnapshotParams {
        snapshot_path: snapshot.snapshot_path().to_path_buf(),
        load_ws: false,
        ..Default::default()
    };

    let vm_id = controller.load_snapshot(snapshot, false, params, "ns0").await.unwrap();
    assert_eq!(vm_id, pooled_id);
}

/// S5: a VM stopped while pooled must be gone from the pool, so a subsequent
/// `load_snapshot` cannot reuse it and has to start a fresh VMM instead.
#[tokio::test]
async fn load_snapshot_skips_a_vmm_that_was_stopped_while_pooled() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());
    let pooled_id = controller.start_vmm("ns0").await.unwrap();
    controller.stop_vm(&pooled_id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let snapshot = Arc::new(FakeSnapshot {
        function: "hello".to_string(),
        path: dir.path().join("snap/state"),
        latch: tokio::sync::OnceCell::new(),
    });
    let params = LoadSnapshotParams {
        snapshot_path: snapshot.snapshot_path().to_path_buf(),
        load_ws: false,
        ..Default::default()
    };

    let vm_id = controller.load_snapshot(snapshot, false, params, "ns0").await.unwrap();
    assert_ne!(vm_id, pooled_id);
}

#[tokio::test]
async fn stop_vm_on_an_unknown_id_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::default());
    let err = controller.stop_vm(&vmctl_core::id::VmId::generate()).await.unwrap_err();
    assert_matches!(err, ControllerError::NotFound { what: "vm", .. });
}

/// S1: a cold-start VM (neither balloon nor faascale) invokes with no suffix and
/// `funcmem=0`.
#[tokio::test]
async fn invoke_function_on_a_cold_vm_uses_no_suffix_and_zero_funcmem() {
    let dir = tempfile::tempdir().unwrap();
    let addr: std::net::IpAddr = "127.0.0.21".parse().unwrap();
    let controller = build_controller(dir.path().to_path_buf(), addr, Arc::default());
    let guest = Arc::new(MockGuestAgentState::default());
    spawn_mock_guest_agent(addr, Arc::clone(&guest));

    let vm_id = controller.start_vm("hello", "ns0", 0, 0, false, false).await.unwrap();
    controller.wait_vm_ready(&vm_id).await.unwrap();

    let body = controller.invoke_function(&vm_id, "hello", Bytes::new(), None, None).await.unwrap();
    assert_eq!(body.as_ref(), b"invoked");

    let invocations = guest.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert!(invocations[0].contains("function=hello") && !invocations[0].contains("hello-"));
    assert!(invocations[0].contains("funcmem=0"));
}

/// S4: a balloon VM deflates by the catalog's function mem size before invoking and
/// re-inflates back to the pre-invocation target afterward: target trace `(T-M, T)`.
#[tokio::test]
async fn invoke_function_on_a_balloon_vm_deflates_then_reinflates() {
    let dir = tempfile::tempdir().unwrap();
    let addr: std::net::IpAddr = "127.0.0.22".parse().unwrap();
    let hypervisor = Arc::new(MockHypervisorState::default());
    let controller = build_controller(dir.path().to_path_buf(), addr, Arc::clone(&hypervisor));
    let guest = Arc::new(MockGuestAgentState::default());
    spawn_mock_guest_agent(addr, Arc::clone(&guest));

    // requested_mem_mib=1024, function mem_size_mib=64 (from FakeFunctionCatalog) floored to
    // 512 inside Balloon::new -> T = 1024 - 512 = 512. invoke_function then deflates/inflates
    // by the function's raw (unfloored) mem_size_mib, 64 -> trace (512-64, 512) = (448, 512).
    let vm_id = controller.start_vm("hello", "ns0", 0, 1024, true, false).await.unwrap();
    controller.wait_vm_ready(&vm_id).await.unwrap();

    let body = controller.invoke_function(&vm_id, "hello", Bytes::new(), None, None).await.unwrap();
    assert_eq!(body.as_ref(), b"invoked");

    let invocations = guest.invocations.lock().unwrap();
    assert!(invocations[0].contains("function=hello-balloon"));
    assert!(invocations[0].contains("funcmem=0"));

    assert_eq!(*hypervisor.balloon_history.lock().unwrap(), vec![448, 512]);
}

/// S7: specifying both mincore invocation modes is rejected before any hypervisor or
/// guest call is made, even for a VM id that doesn't exist.
#[tokio::test]
async fn invoke_function_rejects_both_mincore_modes_before_any_call() {
    let dir = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MockHypervisorState::default());
    let controller = build_controller(dir.path().to_path_buf(), "127.0.0.1".parse().unwrap(), Arc::clone(&hypervisor));

    let err = controller
        .invoke_function(&vmctl_core::id::VmId::generate(), "hello", Bytes::new(), Some(1), Some(2))
        .await
        .unwrap_err();

    assert_matches!(err, ControllerError::PreconditionViolated(_));
    assert_eq!(hypervisor.pause_calls.load(Ordering::SeqCst), 0);
    assert_eq!(hypervisor.create_calls.load(Ordering::SeqCst), 0);
}
