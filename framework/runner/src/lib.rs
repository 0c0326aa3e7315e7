mod api;
mod catalog;
mod cli;
mod compose;
mod config;
mod descriptor;
mod invoker;
mod lifecycle;
mod orchestrator;
mod progress;
mod results;
mod run;
mod shutdown;
mod types;

pub mod prelude {
    pub use crate::api::{
        ApiError, BenchmarkReport, BenchmarkRequest, BenchmarkStatus, ClusterApi, HttpClusterApi,
    };
    pub use crate::catalog::{load_scenarios, parse_scenarios, ConfigError, Scenario, ScenarioError};
    pub use crate::cli::{DeploymentArgs, RunArgs};
    pub use crate::compose::{docker_path, ComposeDriver, ST_DOCKER_PATH_ENV};
    pub use crate::config::RunnerConfig;
    pub use crate::descriptor::{
        format_memory, BuildError, DeploymentDescriptor, DescriptorBuilder, DescriptorConfig,
        ProxyConfig, ResourceLimits, ServiceRole, ServiceSpec, API_SERVICE, MASTER_SERVICE,
        SHARED_NETWORK,
    };
    pub use crate::invoker::{BenchmarkInvoker, CompletionPolicy, RetryPolicy};
    pub use crate::lifecycle::{
        ClusterLifecycleManager, DeploymentDriver, DeploymentError, DeploymentHandle,
        DeploymentState, Readiness, ReadinessPolicy,
    };
    pub use crate::orchestrator::{Orchestrator, BATCH_CANCELLED, CANCELLED};
    pub use crate::results::{PersistError, ResultsStore, RESULTS_CSV_FILE, RUN_SUMMARY_FILE};
    pub use crate::run::run;
    pub use crate::types::SparkTunnelResult;

    pub use spark_tunnel_core::prelude::*;
    pub use spark_tunnel_summary_model::{
        BatchTimestamp, RunBatch, RunResult, RunStatus, ScenarioParameters, StageMetric,
    };
}
