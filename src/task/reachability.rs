//! Network reachability precondition.
//!
//! [`ReachabilityCondition`] performs a single probe against a host before a
//! task may run. The default [`TcpProbe`] treats a host as reachable when a
//! TCP connection to it can be opened within the configured timeout.

use crate::task::condition::Condition;
use crate::task::operation::Task;
use crate::task::types::{ConditionResult, TaskError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Reachability settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReachabilityConfig {
    /// Host probed when a condition is built without one
    #[serde(default = "default_host")]
    pub default_host: String,

    /// How long one probe may take
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_host() -> String {
    "https://example.com".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            default_host: default_host(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ReachabilityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Decides whether a host can be reached
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, host: &Url) -> bool;
}

/// Probe that opens a TCP connection to the host's address
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(default_probe_timeout_ms()))
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, host: &Url) -> bool {
        let (Some(hostname), Some(port)) = (host.host_str(), host.port_or_known_default()) else {
            debug!("URL {} has no host or port to probe", host);
            return false;
        };

        match tokio::time::timeout(self.timeout, TcpStream::connect((hostname, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                debug!("Host {}:{} unreachable: {}", hostname, port, error);
                false
            }
            Err(_) => {
                debug!("Probe of {}:{} timed out after {:?}", hostname, port, self.timeout);
                false
            }
        }
    }
}

/// Satisfied only when the host is reachable
#[derive(Clone)]
pub struct ReachabilityCondition {
    host: Url,
    probe: Arc<dyn ReachabilityProbe>,
}

impl ReachabilityCondition {
    /// Probe `host` over TCP with the default timeout
    pub fn new(host: Url) -> Self {
        Self::with_probe(host, Arc::new(TcpProbe::default()))
    }

    pub fn with_probe(host: Url, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self { host, probe }
    }

    /// Build from configuration; `host` overrides the configured default
    pub fn from_config(config: &ReachabilityConfig, host: Option<&str>) -> Result<Self, url::ParseError> {
        let host = Url::parse(host.unwrap_or(&config.default_host))?;
        Ok(Self::with_probe(
            host,
            Arc::new(TcpProbe::new(config.probe_timeout())),
        ))
    }

    pub fn host(&self) -> &Url {
        &self.host
    }
}

impl std::fmt::Debug for ReachabilityCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReachabilityCondition")
            .field("host", &self.host.as_str())
            .finish()
    }
}

#[async_trait]
impl Condition for ReachabilityCondition {
    fn name(&self) -> String {
        "Reachability".to_string()
    }

    async fn evaluate(&self, task: &Task) -> ConditionResult {
        if self.probe.is_reachable(&self.host).await {
            return ConditionResult::Satisfied;
        }

        debug!("Task {} blocked: {} unreachable", task.label(), self.host);
        ConditionResult::Failed(TaskError::UnreachableNetwork {
            host: self.host.to_string(),
        })
    }
}
