//! Client for the guest agent HTTP endpoint (`http://<uniqueAddr>:5000/`), reached
//! over plain TCP rather than the hypervisor's Unix control socket.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::{ControllerError, HypervisorError};
use crate::id::VmId;
use crate::retry::RetrySchedule;

const GUEST_AGENT_PORT: u16 = 5000;
const READY_BODY: &[u8] = b"Hello, World!";

pub struct GuestClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for GuestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// `GET /`, 5-second per-attempt timeout, bounded geometric retry; ready iff
    /// `status < 300 AND body == "Hello, World!"` (§4.7).
    pub async fn wait_ready(&self, addr: IpAddr, vm_id: &VmId, schedule: &RetrySchedule) -> Result<(), ControllerError> {
        let uri: http::Uri = format!("http://{addr}:{GUEST_AGENT_PORT}/").parse().expect("well-formed guest uri");

        let ready = schedule
            .run(|| async {
                let request = Request::builder().method(Method::GET).uri(uri.clone()).body(Full::new(Bytes::new())).ok()?;
                let attempt = tokio::time::timeout(Duration::from_secs(5), self.client.request(request)).await;
                match attempt {
                    Ok(Ok(response)) if response.status().as_u16() < 300 => {
                        let body = response.into_body().collect().await.ok()?.to_bytes();
                        (body.as_ref() == READY_BODY).then_some(())
                    }
                    _ => None,
                }
            })
            .await;

        ready.ok_or_else(|| {
            log::warn!(target: "vmctl_core::guest_client", "vm_id={vm_id} guest agent never became ready");
            ControllerError::NotReady { vm_id: vm_id.clone() }
        })
    }

    /// `POST /invoke?function=<name[+suffix]>&redishost=<h>&redispasswd=<p>&funcmem=<n>`,
    /// body = raw invocation params, no per-attempt timeout (§4.7).
    #[allow(clippy::too_many_arguments)]
    pub async fn invoke_function(
        &self,
        addr: IpAddr,
        vm_id: &VmId,
        function: &str,
        suffix: &str,
        funcmem_mib: u64,
        redis_host: &str,
        redis_passwd: &str,
        params: Bytes,
    ) -> Result<Bytes, ControllerError> {
        let uri: http::Uri = format!(
            "http://{addr}:{GUEST_AGENT_PORT}/invoke?function={function}{suffix}&redishost={redis_host}&redispasswd={redis_passwd}&funcmem={funcmem_mib}"
        )
        .parse()
        .expect("well-formed invoke uri");

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(params))
            .map_err(|err| ControllerError::Hypervisor(HypervisorError::Request(err)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| ControllerError::Hypervisor(HypervisorError::Client(err)))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ControllerError::Hypervisor(HypervisorError::Unreachable(std::io::Error::other(err))))?
            .to_bytes();

        if status.as_u16() >= 300 {
            log::warn!(target: "vmctl_core::guest_client", "vm_id={vm_id} invocation of `{function}` failed with {status}");
            return Err(ControllerError::InvocationFailed { vm_id: vm_id.clone(), status });
        }
        Ok(body)
    }
}
