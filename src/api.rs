//! Clients for the cluster's externally observable surfaces.
//!
//! Scenarios only see the three traits below; the HTTP implementations talk to
//! a real cluster and tests substitute in-process fakes.

use crate::error::{Error, Result};
use crate::workload::{CompletedWorkload, PlacementRecord, WorkloadDescriptor};
use reqwest::header::{CONTENT_TYPE, HOST};
use reqwest::{Certificate, Client, Identity, StatusCode};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Desired-state API: submit workloads and read back their placement.
pub trait DesiredState: Send + Sync {
    fn desire(&self, workload: &WorkloadDescriptor) -> impl Future<Output = Result<()>> + Send;

    fn placement(
        &self,
        process_guid: &str,
        index: u32,
    ) -> impl Future<Output = Result<PlacementRecord>> + Send;

    fn completed_workloads(&self) -> impl Future<Output = Result<Vec<CompletedWorkload>>> + Send;
}

/// Routability check against the routing layer. Returns the HTTP status.
pub trait RoutingProbe: Send + Sync {
    fn status(&self) -> impl Future<Output = Result<u16>> + Send;
}

/// Addresses of one worker agent's admin and secure listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub cell_id: String,
    pub listen_port: u16,
    pub secure_port: u16,
}

/// Administrative calls against a worker agent.
pub trait AgentAdmin: Send + Sync {
    /// Requests evacuation; returns the response status.
    fn evacuate(&self, agent: &AgentEndpoint) -> impl Future<Output = Result<u16>> + Send;

    /// Asks the agent to stop one workload instance. Non-success statuses are
    /// errors.
    fn stop_instance(
        &self,
        agent: &AgentEndpoint,
        placement: &PlacementRecord,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpDesiredState {
    client: Client,
    base_url: String,
}

impl HttpDesiredState {
    /// Creates a client for the desired-state API.
    ///
    /// # Arguments
    /// * `base_url` - Scheme, host and port of the API; a trailing `/` is ignored
    /// * `timeout` - Per-request timeout
    ///
    /// # Returns
    /// * `Ok(HttpDesiredState)` - The client
    /// * `Err(Error::Http)` - The HTTP client could not be built
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl DesiredState for HttpDesiredState {
    async fn desire(&self, workload: &WorkloadDescriptor) -> Result<()> {
        let url = format!("{}/v1/desired_lrp/desire", self.base_url);
        debug!("desiring {} via {}", workload.process_guid, url);
        self.client
            .post(url)
            .json(workload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn placement(&self, process_guid: &str, index: u32) -> Result<PlacementRecord> {
        let url = format!("{}/v1/actual_lrps/{}/{}", self.base_url, process_guid, index);
        let record = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(record)
    }

    async fn completed_workloads(&self) -> Result<Vec<CompletedWorkload>> {
        let url = format!("{}/v1/tasks?state=completed", self.base_url);
        let tasks = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(tasks)
    }
}

/// Plain GET against the router with a virtual `Host` header.
#[derive(Debug, Clone)]
pub struct HttpRoutingProbe {
    client: Client,
    url: String,
    host: String,
}

impl HttpRoutingProbe {
    /// Creates a probe for one routed application.
    ///
    /// # Arguments
    /// * `router_addr` - `host:port` of the router
    /// * `virtual_host` - Route the application is registered under, sent as `Host`
    pub fn new(router_addr: &str, virtual_host: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(DEFAULT_HTTP_TIMEOUT).build()?,
            url: format!("http://{}/", router_addr),
            host: virtual_host.to_string(),
        })
    }
}

impl RoutingProbe for HttpRoutingProbe {
    async fn status(&self) -> Result<u16> {
        let response = self
            .client
            .get(&self.url)
            .header(HOST, &self.host)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Mutual-TLS client for agent admin endpoints on 127.0.0.1.
#[derive(Debug, Clone)]
pub struct TlsAgentAdmin {
    client: Client,
}

impl TlsAgentAdmin {
    /// Builds a mutual-TLS client from PEM files.
    ///
    /// # Arguments
    /// * `cert` - Client certificate
    /// * `key` - Private key of the client certificate
    /// * `ca` - CA the agents' server certificates chain to
    /// * `timeout` - Per-request timeout
    ///
    /// # Returns
    /// * `Ok(TlsAgentAdmin)` - The client
    /// * `Err(Error::Config)` - A PEM file could not be read
    /// * `Err(Error::Http)` - The PEM material was rejected
    pub fn from_files(cert: &Path, key: &Path, ca: &Path, timeout: Duration) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))
        };

        let mut identity_pem = read(cert)?;
        identity_pem.push(b'\n');
        identity_pem.extend(read(key)?);

        let client = Client::builder()
            .timeout(timeout)
            .identity(Identity::from_pem(&identity_pem)?)
            .add_root_certificate(Certificate::from_pem(&read(ca)?)?)
            .build()?;
        Ok(Self { client })
    }
}

impl AgentAdmin for TlsAgentAdmin {
    async fn evacuate(&self, agent: &AgentEndpoint) -> Result<u16> {
        // The admin listener's certificate carries 127.0.0.1 as an IP SAN
        let url = format!("https://127.0.0.1:{}/evacuate", agent.listen_port);
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/html")
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    async fn stop_instance(&self, agent: &AgentEndpoint, placement: &PlacementRecord) -> Result<()> {
        let url = format!(
            "https://127.0.0.1:{}/v1/lrps/{}/instances/{}/stop",
            agent.secure_port, placement.process_guid, placement.instance_guid
        );
        self.client.post(url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// True for `202 Accepted`, the only successful answer to an evacuation request.
pub fn is_accepted(status: u16) -> bool {
    status == StatusCode::ACCEPTED.as_u16()
}

pub fn is_ok(status: u16) -> bool {
    status == StatusCode::OK.as_u16()
}
