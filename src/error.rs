//! Layered error taxonomy for the control plane, mirroring the reference runtime's
//! practice of wrapping a lower-layer error inside a higher-layer one.

use crate::id::VmId;

/// Errors from a single exchange with a hypervisor control socket.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// The dial retry schedule was exhausted without a 2xx response.
    #[error("connecting to the hypervisor control socket timed out")]
    ConnectTimeout,
    /// The control API responded with a status >= 300.
    #[error("hypervisor control API rejected the request with status {status}: {body}")]
    Rejected { status: http::StatusCode, body: String },
    /// A transport-level error occurred talking to an already-dialed socket.
    #[error("hypervisor control socket became unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    /// The hyper-util connection pool reported an error.
    #[error("hypervisor HTTP client failed: {0}")]
    Client(#[source] hyper_util::client::legacy::Error),
    /// The control API's JSON request or response body could not be (de)serialized.
    #[error("malformed hypervisor control API payload: {0}")]
    Serde(#[source] serde_json::Error),
    /// Building the outgoing HTTP request failed.
    #[error("could not build hypervisor control API request: {0}")]
    Request(#[source] http::Error),
    /// The control socket path could not be turned into a valid request URI.
    #[error("route `{route}` could not be resolved against the hypervisor control socket")]
    InvalidSocketUri { route: String },
}

/// Errors surfaced by [`crate::controller::VmController`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No VM, namespace or snapshot matched the given identifier.
    #[error("{what} `{id}` was not found")]
    NotFound { what: &'static str, id: String },
    /// An operation was attempted against a VM in an incompatible state, or with
    /// mutually exclusive flags set (balloon + faascale, both mincore modes, ...).
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),
    /// A hypervisor control-socket exchange failed.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    /// A balloon resize did not converge within the retry budget.
    #[error("balloon resize for `{vm_id}` did not converge: target {target_mib} MiB, actual {actual_mib} MiB")]
    BalloonNotConverged {
        vm_id: VmId,
        target_mib: u64,
        actual_mib: u64,
    },
    /// The guest readiness probe never observed the sentinel response.
    #[error("guest agent on `{vm_id}` never became ready")]
    NotReady { vm_id: VmId },
    /// The guest `/invoke` endpoint returned a non-success status.
    #[error("function invocation on `{vm_id}` failed with status {status}")]
    InvocationFailed { vm_id: VmId, status: http::StatusCode },
    /// The hypervisor subprocess could not be spawned.
    #[error("failed to spawn hypervisor subprocess: {0}")]
    SubprocessSpawnFailed(#[source] std::io::Error),
}

impl ControllerError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        ControllerError::NotFound { what, id: id.into() }
    }
}
