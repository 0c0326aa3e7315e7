//! Bringing a deployment up, waiting for it to become reachable and tearing it down.

use std::time::Duration;

use tokio::time::{self, Instant};
use url::Url;

use crate::api::ClusterApi;
use crate::descriptor::DeploymentDescriptor;

/// Shortest wait between two polls of the benchmark API, whatever the configured interval.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEPLOYMENT_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Applies deployment descriptors using an external deployment tool.
#[allow(async_fn_in_trait)]
pub trait DeploymentDriver {
    /// Create and start every service in `descriptor` as the deployment `deployment_id`.
    async fn up(
        &self,
        deployment_id: &str,
        descriptor: &DeploymentDescriptor,
    ) -> anyhow::Result<()>;

    /// Stop and remove everything belonging to `deployment_id`.
    ///
    /// Must succeed if the deployment was only partially created, or never created.
    async fn down(&self, deployment_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Provisioning,
    Ready,
    /// The API never became reachable
    Unreachable,
    TornDown,
}

/// A provisioned deployment. Passed through the runner in place of any global "current cluster".
#[derive(Debug)]
pub struct DeploymentHandle {
    id: String,
    scenario_name: String,
    api_url: Url,
    state: DeploymentState,
}

impl DeploymentHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    /// Root URL of the benchmark API for this deployment.
    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }
}

impl Drop for DeploymentHandle {
    fn drop(&mut self) {
        if self.state != DeploymentState::TornDown {
            log::error!(
                "Deployment '{}' for scenario '{}' was dropped without being torn down, it may still be running",
                self.id,
                self.scenario_name
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("Deployment for scenario '{scenario}' does not publish the benchmark API port")]
    NoApiPort { scenario: String },
    #[error("Invalid benchmark API URL for deployment '{id}': {source}")]
    ApiUrl {
        id: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Failed to provision deployment '{id}': {reason}")]
    Provision { id: String, reason: String },
}

/// How long, and how often, to probe the health endpoint of a new deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

#[derive(Debug)]
pub struct ClusterLifecycleManager<D> {
    driver: D,
    /// Host that published ports are reached on
    api_host: String,
}

impl<D: DeploymentDriver> ClusterLifecycleManager<D> {
    pub fn new(driver: D, api_host: impl Into<String>) -> Self {
        Self {
            driver,
            api_host: api_host.into(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Provision the deployment described by `descriptor`.
    ///
    /// Provisioning is not retried. If the driver fails part way, whatever it created is removed
    /// again before the error is returned.
    pub async fn up(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> Result<DeploymentHandle, DeploymentError> {
        let scenario = descriptor.scenario_name();
        let port = descriptor
            .api_host_port()
            .ok_or_else(|| DeploymentError::NoApiPort {
                scenario: scenario.to_string(),
            })?;

        let id = deployment_id(scenario);
        let api_url = Url::parse(&format!("http://{}:{port}/", self.api_host)).map_err(|source| {
            DeploymentError::ApiUrl {
                id: id.clone(),
                source,
            }
        })?;

        log::info!(
            "Provisioning deployment '{id}' for scenario '{scenario}' with {} worker(s)",
            descriptor.workers().len()
        );

        if let Err(e) = self.driver.up(&id, descriptor).await {
            log::error!("Provisioning deployment '{id}' failed, removing partial deployment");
            if let Err(down_err) = self.driver.down(&id).await {
                log::error!("Failed to remove partial deployment '{id}': {down_err:?}");
            }
            return Err(DeploymentError::Provision {
                id,
                reason: format!("{e:#}"),
            });
        }

        Ok(DeploymentHandle {
            id,
            scenario_name: scenario.to_string(),
            api_url,
            state: DeploymentState::Provisioning,
        })
    }

    /// Probe the deployment's health endpoint until it answers or `policy.timeout` elapses.
    ///
    /// Probes start immediately and then follow a fixed cadence of `policy.poll_interval`, which
    /// is never shorter than 100ms. Failed probes are only logged. No probe runs past the timeout.
    pub async fn wait_ready<A: ClusterApi>(
        &self,
        handle: &mut DeploymentHandle,
        api: &A,
        policy: &ReadinessPolicy,
    ) -> Readiness {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        let interval = policy.poll_interval.max(MIN_POLL_INTERVAL);
        let mut next_probe = started;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match time::timeout(remaining, api.health(handle.api_url())).await {
                Ok(Ok(())) => {
                    log::info!(
                        "Deployment '{}' ready after {attempts} probe(s) in {:?}",
                        handle.id,
                        started.elapsed()
                    );
                    handle.state = DeploymentState::Ready;
                    return Readiness::Ready;
                }
                Ok(Err(e)) => {
                    log::debug!("Health probe {attempts} for '{}' failed: {e}", handle.id)
                }
                Err(_) => log::debug!(
                    "Health probe {attempts} for '{}' did not answer before the deadline",
                    handle.id
                ),
            }

            next_probe += interval;
            if next_probe >= deadline || Instant::now() >= deadline {
                break;
            }
            time::sleep_until(next_probe).await;
        }

        log::warn!(
            "Deployment '{}' was not ready within {:?} after {attempts} probe(s)",
            handle.id,
            policy.timeout
        );
        handle.state = DeploymentState::Unreachable;
        Readiness::TimedOut
    }

    /// Tear the deployment down. Failures are logged and not returned.
    ///
    /// Calling this again on a handle that is already torn down does nothing.
    pub async fn down(&self, handle: &mut DeploymentHandle) {
        if handle.state == DeploymentState::TornDown {
            log::debug!("Deployment '{}' is already torn down", handle.id);
            return;
        }

        log::info!("Tearing down deployment '{}'", handle.id);
        if let Err(e) = self.driver.down(&handle.id).await {
            log::error!("Failed to tear down deployment '{}': {e:?}", handle.id);
        }
        handle.state = DeploymentState::TornDown;
    }
}

/// A deployment id is safe to use as a compose project name and unique per provisioning.
fn deployment_id(scenario_name: &str) -> String {
    let sanitized = scenario_name
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
            _ => '-',
        })
        .collect::<String>();

    format!(
        "st-{sanitized}-{}",
        nanoid::nanoid!(8, &DEPLOYMENT_ID_ALPHABET)
    )
}
