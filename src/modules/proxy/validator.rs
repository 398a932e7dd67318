//! Bulk reachability checks for proxy candidates.
//!
//! Each candidate gets one bounded-timeout request routed through it. Probes
//! run as independent tasks gated by a semaphore, and results flow back to a
//! single collector through the join set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DEFAULT_ECHO_URL: &str = "http://httpbin.org/ip";
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of simultaneous probes.
pub const DEFAULT_CONCURRENCY: usize = 20;

#[derive(Debug, Error)]
pub enum ProxyProbeError {
    #[error("invalid proxy address {address}: {message}")]
    InvalidAddress { address: String, message: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("echo endpoint answered with status {0}")]
    Status(u16),
}

/// Single reachability check through one candidate.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, candidate: &str) -> Result<(), ProxyProbeError>;
}

/// Probe that fetches a known-good echo endpoint through the candidate.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    echo_url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(echo_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            echo_url: echo_url.into(),
            timeout,
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_URL, DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ProxyProbe for HttpProbe {
    async fn probe(&self, candidate: &str) -> Result<(), ProxyProbeError> {
        let invalid = |err: reqwest::Error| ProxyProbeError::InvalidAddress {
            address: candidate.to_string(),
            message: err.to_string(),
        };
        let proxy = reqwest::Proxy::all(candidate).map_err(invalid)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|err| ProxyProbeError::Transport(err.to_string()))?;

        let response = client
            .get(&self.echo_url)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProxyProbeError::Timeout(self.timeout)
                } else {
                    ProxyProbeError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProxyProbeError::Status(status.as_u16()))
        }
    }
}

/// Runs probes for a batch of candidates with bounded concurrency.
#[derive(Clone)]
pub struct ProxyValidator {
    probe: Arc<dyn ProxyProbe>,
}

impl ProxyValidator {
    pub fn new(probe: Arc<dyn ProxyProbe>) -> Self {
        Self { probe }
    }

    /// Return the subset of `candidates` whose probe succeeded. At most
    /// `concurrency` probes are in flight at any time.
    pub async fn validate_batch(
        &self,
        candidates: HashSet<String>,
        concurrency: usize,
    ) -> HashSet<String> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for candidate in candidates {
            let probe = self.probe.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => probe.probe(&candidate).await,
                    Err(_) => Err(ProxyProbeError::Transport("probe pool closed".into())),
                };
                (candidate, outcome)
            });
        }

        let mut reachable = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((candidate, Ok(()))) => {
                    log::debug!("proxy reachable: {candidate}");
                    reachable.insert(candidate);
                }
                Ok((candidate, Err(err))) => {
                    log::debug!("proxy unreachable {candidate}: {err}");
                }
                Err(err) => {
                    log::warn!("proxy probe task aborted: {err}");
                }
            }
        }
        reachable
    }
}

impl Default for ProxyValidator {
    fn default() -> Self {
        Self::new(Arc::new(HttpProbe::default()))
    }
}
