use anyhow::Context;
use spark_tunnel_summary_model::{BatchTimestamp, RunBatch};

use crate::api::HttpClusterApi;
use crate::catalog::Scenario;
use crate::compose::{docker_path, ComposeDriver};
use crate::config::RunnerConfig;
use crate::orchestrator::Orchestrator;
use crate::results::ResultsStore;
use crate::shutdown::start_shutdown_listener;
use crate::types::SparkTunnelResult;

/// Run a batch of scenarios against docker compose deployments.
///
/// Fails only when the batch cannot start. Once it has started every scenario gets a result in
/// the returned [RunBatch], whatever happened to it.
pub fn run(config: &RunnerConfig, scenarios: &[Scenario]) -> SparkTunnelResult<RunBatch> {
    let docker = docker_path()?;
    log::debug!("Using docker at '{}'", docker.display());

    let batch = BatchTimestamp::now();
    let store = ResultsStore::new(&config.results_root);
    let batch_dir = store
        .reserve_batch(&batch)
        .context("Failed to reserve the results directory for this batch")?;
    log::info!("Writing results for batch {batch} to '{}'", batch_dir.display());

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let shutdown_handle = start_shutdown_listener(&runtime);

    let driver = ComposeDriver::new(docker, &config.work_dir);
    let api = HttpClusterApi::new(config.request_timeout)?;
    let mut orchestrator = Orchestrator::new(config, driver, api, shutdown_handle.new_listener());

    Ok(runtime.block_on(orchestrator.run_batch(&batch, scenarios)))
}
