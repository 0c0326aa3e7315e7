use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use url::Url;

use crate::config::RunnerConfig;
use crate::descriptor::{DescriptorConfig, ProxyConfig, ResourceLimits};
use crate::invoker::{CompletionPolicy, RetryPolicy};
use crate::lifecycle::ReadinessPolicy;

/// Settings that shape the deployment of every scenario.
#[derive(Debug, Clone, Args)]
pub struct DeploymentArgs {
    /// Path of the dataset as seen from inside the containers
    #[arg(long, env = "DATASET_PATH", default_value = "/data/train.csv")]
    pub dataset_path: String,

    /// Host directory to mount into every container at `/data`
    #[arg(long, env = "ST_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Memory for the Spark driver inside the benchmark API, such as `16g`
    #[arg(long, env = "DRIVER_MEMORY", default_value = "16g")]
    pub driver_memory: String,

    #[arg(long, env = "ST_SPARK_IMAGE", default_value = "bitnami/spark:3.5")]
    pub spark_image: String,

    #[arg(
        long,
        env = "ST_API_IMAGE",
        default_value = "spark-tunnel/benchmark-api:latest"
    )]
    pub api_image: String,

    /// Host port the benchmark API of a deployment is published on
    #[arg(long, env = "ST_API_PORT", default_value_t = 8000)]
    pub api_port: u16,

    /// Refuse to deploy scenarios with more workers than this
    #[arg(long, env = "ST_MAX_WORKERS", default_value_t = 64)]
    pub max_workers: u32,

    /// Refuse to deploy scenarios asking for more memory in total, in GB
    #[arg(long, env = "ST_MAX_TOTAL_MEMORY_GB", default_value_t = 4096.0)]
    pub max_total_memory_gb: f64,

    /// Refuse to deploy scenarios asking for more cores in total
    #[arg(long, env = "ST_MAX_TOTAL_CORES", default_value_t = 1024)]
    pub max_total_cores: u32,

    /// Proxy for plain HTTP traffic from the benchmark API
    #[arg(long, env = "http_proxy")]
    pub http_proxy: Option<Url>,

    /// Proxy for HTTPS traffic from the benchmark API
    #[arg(long, env = "https_proxy")]
    pub https_proxy: Option<Url>,
}

impl DeploymentArgs {
    pub fn to_descriptor_config(&self) -> DescriptorConfig {
        DescriptorConfig {
            spark_image: self.spark_image.clone(),
            api_image: self.api_image.clone(),
            dataset_path: self.dataset_path.clone(),
            data_dir: self.data_dir.clone(),
            driver_memory: self.driver_memory.clone(),
            api_port: self.api_port,
            limits: ResourceLimits {
                max_workers: self.max_workers,
                max_total_memory_gb: self.max_total_memory_gb,
                max_total_cores: self.max_total_cores,
            },
            proxy: ProxyConfig {
                http: self.http_proxy.clone(),
                https: self.https_proxy.clone(),
            },
            ..DescriptorConfig::default()
        }
    }
}

/// Settings for running a batch.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub deployment: DeploymentArgs,

    /// Host that published API ports are reached on
    #[arg(long, env = "ST_API_HOST", default_value = "127.0.0.1")]
    pub api_host: String,

    /// How long to wait for a new deployment's API to become healthy, in seconds
    #[arg(long, env = "ST_READY_TIMEOUT", default_value_t = 300)]
    pub ready_timeout: u64,

    /// Seconds between health probes of a new deployment
    #[arg(
        long,
        env = "ST_READY_POLL_INTERVAL",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ready_poll_interval: u64,

    /// Attempts for each call to the benchmark API before giving up on transient errors
    #[arg(long, env = "ST_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Seconds to wait before the first retry, doubling on each further retry
    #[arg(long, env = "ST_INITIAL_BACKOFF", default_value_t = 2)]
    pub initial_backoff: u64,

    /// How long a benchmark may run before it is recorded as timed out, in seconds
    #[arg(long, env = "ST_BENCHMARK_TIMEOUT", default_value_t = 3600)]
    pub benchmark_timeout: u64,

    /// Seconds between status polls of a running benchmark
    #[arg(
        long,
        env = "ST_POLL_INTERVAL",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval: u64,

    /// Bound on each HTTP request to the benchmark API, in seconds
    #[arg(long, env = "ST_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Directory that batch results are written under
    #[arg(long, env = "ST_RESULTS_ROOT", default_value = "results")]
    pub results_root: PathBuf,

    /// Directory for the compose files of live deployments
    #[arg(long, env = "ST_WORK_DIR", default_value = ".spark-tunnel")]
    pub work_dir: PathBuf,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by
    /// anyone and is just adding noise to the logs.
    #[arg(long, default_value = "false")]
    pub no_progress: bool,
}

impl RunArgs {
    pub fn to_config(&self) -> RunnerConfig {
        let retry = RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_secs(self.initial_backoff),
            ..RetryPolicy::default()
        };

        RunnerConfig {
            descriptor: self.deployment.to_descriptor_config(),
            api_host: self.api_host.clone(),
            readiness: ReadinessPolicy {
                timeout: Duration::from_secs(self.ready_timeout),
                poll_interval: Duration::from_secs(self.ready_poll_interval),
            },
            retry,
            completion: CompletionPolicy {
                poll_interval: Duration::from_secs(self.poll_interval),
                timeout: Duration::from_secs(self.benchmark_timeout),
            },
            request_timeout: Duration::from_secs(self.request_timeout),
            results_root: self.results_root.clone(),
            work_dir: self.work_dir.clone(),
            no_progress: self.no_progress,
        }
    }
}
