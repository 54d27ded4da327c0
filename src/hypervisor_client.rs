//! Per-VM client speaking the hypervisor control HTTP protocol over a Unix socket.
//!
//! Unlike the reference runtime's lazily-initialized client, this one is created once
//! at VM construction and shared for the VM's lifetime (§9 redesign note): the dialer
//! closes over the VM's socket path, so the client is inherently per-VM and there is
//! no benefit to deferring its construction.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_client_sockets::{HyperUnixConnector, UnixUriExt};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::HypervisorError;
use crate::retry::RetrySchedule;

/// Decoded balloon telemetry, `GET /balloon/statistics`.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct BalloonStats {
    pub target_pages: u64,
    pub actual_pages: u64,
    pub target_mib: u64,
    pub actual_mib: u64,
}

#[derive(Debug, Serialize)]
struct VmStateBody {
    state: &'static str,
}

#[derive(Debug, Serialize)]
struct SetBalloonBody {
    amount_mib: u64,
}

/// Fields of the `PUT /snapshot/create` body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSnapshotParams {
    pub snapshot_type: &'static str,
    pub snapshot_path: PathBuf,
    pub mem_file_path: PathBuf,
    pub version: Option<String>,
}

/// Fields of the `PUT /snapshot/load` body, as documented in §6.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSnapshotParams {
    pub snapshot_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_file_path: Option<PathBuf>,
    pub enable_diff_snapshots: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_user_page_faults: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sock_file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_regions: Option<std::collections::HashMap<u64, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_regions: Option<Vec<(u64, u64)>>,
    pub load_ws: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fadvise: Option<String>,
}

/// A client for a single VM's hypervisor control socket.
pub struct HypervisorClient {
    socket_path: PathBuf,
    client: Client<HyperUnixConnector, Full<Bytes>>,
    retry_schedule: RetrySchedule,
}

impl std::fmt::Debug for HypervisorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl HypervisorClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::builder(TokioExecutor::new()).build(HyperUnixConnector),
            retry_schedule: RetrySchedule::default(),
        }
    }

    fn uri(&self, route: &str) -> Result<http::Uri, HypervisorError> {
        http::Uri::unix(&self.socket_path, route).map_err(|_| HypervisorError::InvalidSocketUri { route: route.to_string() })
    }

    async fn send(&self, method: Method, route: &str, body: Option<Vec<u8>>) -> Result<(StatusCode, Bytes), HypervisorError> {
        let uri = self.uri(route)?;
        let body = body.unwrap_or_default();
        let request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(HypervisorError::Request)?;

        let response = self.client.request(request).await.map_err(HypervisorError::Client)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| HypervisorError::Unreachable(std::io::Error::other(err)))?
            .to_bytes();

        log::debug!(target: "vmctl_core::hypervisor_client", "{method} {route} -> {status}");
        Ok((status, body))
    }

    async fn send_expect_ok(&self, method: Method, route: &str, body: Option<Vec<u8>>) -> Result<Bytes, HypervisorError> {
        let (status, body) = self.send(method, route, body).await?;
        if status.as_u16() >= 300 {
            log::warn!(target: "vmctl_core::hypervisor_client", "{method} {route} rejected with {status}");
            return Err(HypervisorError::Rejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, route: &str, body: Option<Vec<u8>>) -> Result<T, HypervisorError> {
        let body = self.send_expect_ok(method, route, body).await?;
        serde_json::from_slice(&body).map_err(HypervisorError::Serde)
    }

    /// `GET /`, asserting a 2xx response; retried on the bounded geometric schedule.
    /// Returns `ConnectTimeout` once the schedule is exhausted.
    pub async fn dial(&self) -> Result<(), HypervisorError> {
        let result = self
            .retry_schedule
            .run(|| async { self.send(Method::GET, "/", None).await.ok().filter(|(status, _)| status.as_u16() < 300) })
            .await;
        match result {
            Some(_) => Ok(()),
            None => Err(HypervisorError::ConnectTimeout),
        }
    }

    /// `PATCH /vm` with `{"state":"Paused"}`.
    pub async fn pause(&self) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(&VmStateBody { state: "Paused" }).map_err(HypervisorError::Serde)?;
        self.send_expect_ok(Method::PATCH, "/vm", Some(body)).await?;
        Ok(())
    }

    /// `PATCH /vm` with `{"state":"Resumed"}`.
    pub async fn resume(&self) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(&VmStateBody { state: "Resumed" }).map_err(HypervisorError::Serde)?;
        self.send_expect_ok(Method::PATCH, "/vm", Some(body)).await?;
        Ok(())
    }

    /// `PUT /snapshot/create`.
    pub async fn create_snapshot(&self, params: &CreateSnapshotParams) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(params).map_err(HypervisorError::Serde)?;
        self.send_expect_ok(Method::PUT, "/snapshot/create", Some(body)).await?;
        Ok(())
    }

    /// `PUT /snapshot/load`.
    pub async fn load_snapshot(&self, params: &LoadSnapshotParams) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(params).map_err(HypervisorError::Serde)?;
        self.send_expect_ok(Method::PUT, "/snapshot/load", Some(body)).await?;
        Ok(())
    }

    /// `PATCH /balloon` with `{"amount_mib":N}`.
    pub async fn set_balloon(&self, target_mib: u64) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(&SetBalloonBody { amount_mib: target_mib }).map_err(HypervisorError::Serde)?;
        self.send_expect_ok(Method::PATCH, "/balloon", Some(body)).await?;
        Ok(())
    }

    /// `GET /balloon/statistics`.
    pub async fn get_balloon_stats(&self) -> Result<BalloonStats, HypervisorError> {
        self.send_json(Method::GET, "/balloon/statistics", None).await
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn retry_schedule(&self) -> &RetrySchedule {
        &self.retry_schedule
    }
}
