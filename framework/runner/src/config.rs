use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::DescriptorConfig;
use crate::invoker::{CompletionPolicy, RetryPolicy};
use crate::lifecycle::ReadinessPolicy;

/// Everything needed to run a batch, assembled from the command line and environment.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub descriptor: DescriptorConfig,
    /// Host that each deployment's published API port is reached on
    pub api_host: String,
    pub readiness: ReadinessPolicy,
    pub retry: RetryPolicy,
    pub completion: CompletionPolicy,
    /// Bound on a single HTTP request to the benchmark API
    pub request_timeout: Duration,
    pub results_root: PathBuf,
    /// Where compose files for live deployments are written
    pub work_dir: PathBuf,
    pub no_progress: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            descriptor: DescriptorConfig::default(),
            api_host: "127.0.0.1".to_string(),
            readiness: ReadinessPolicy::default(),
            retry: RetryPolicy::default(),
            completion: CompletionPolicy::default(),
            request_timeout: Duration::from_secs(30),
            results_root: PathBuf::from("results"),
            work_dir: PathBuf::from(".spark-tunnel"),
            no_progress: false,
        }
    }
}
