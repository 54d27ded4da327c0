//! Spawns the hypervisor subprocess.
//!
//! The reference runtime always execs the hypervisor directly inside a pre-existing
//! network namespace; it never jails or elevates the subprocess (§9 design notes), so
//! only a direct spawner is implemented here.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// Spawns a process from a binary path and argument list, with stdout/stderr
/// redirected to the given sinks.
pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        binary_path: &Path,
        arguments: Vec<String>,
        stdout: Stdio,
        stderr: Stdio,
    ) -> impl std::future::Future<Output = Result<Child, std::io::Error>> + Send;
}

/// Directly invokes the given binary path with no privilege escalation or jailing.
#[derive(Debug, Default)]
pub struct DirectProcessSpawner;

impl ProcessSpawner for DirectProcessSpawner {
    async fn spawn(
        &self,
        binary_path: &Path,
        arguments: Vec<String>,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<Child, std::io::Error> {
        Command::new(binary_path)
            .args(arguments)
            .stdout(stdout)
            .stderr(stderr)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
    }
}
