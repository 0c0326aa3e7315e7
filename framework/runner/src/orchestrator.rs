use chrono::Utc;
use spark_tunnel_core::prelude::ShutdownListener;
use spark_tunnel_summary_model::{BatchTimestamp, RunBatch, RunResult, RunStatus};

use crate::api::ClusterApi;
use crate::catalog::Scenario;
use crate::config::RunnerConfig;
use crate::descriptor::DescriptorBuilder;
use crate::invoker::{not_run, BenchmarkInvoker};
use crate::lifecycle::{
    ClusterLifecycleManager, DeploymentDriver, DeploymentHandle, Readiness, ReadinessPolicy,
};
use crate::progress::BatchProgress;
use crate::results::ResultsStore;

pub const CANCELLED: &str = "cancelled";
pub const BATCH_CANCELLED: &str = "batch cancelled before scenario started";

/// Runs the scenarios of a batch one after the other, each on its own deployment.
pub struct Orchestrator<D, A> {
    builder: DescriptorBuilder,
    lifecycle: ClusterLifecycleManager<D>,
    api: A,
    invoker: BenchmarkInvoker,
    store: ResultsStore,
    readiness: ReadinessPolicy,
    shutdown: ShutdownListener,
    show_progress: bool,
}

enum Step<T> {
    Done(T),
    Cancelled,
}

impl<D: DeploymentDriver, A: ClusterApi> Orchestrator<D, A> {
    pub fn new(config: &RunnerConfig, driver: D, api: A, shutdown: ShutdownListener) -> Self {
        Self {
            builder: DescriptorBuilder::new(config.descriptor.clone()),
            lifecycle: ClusterLifecycleManager::new(driver, config.api_host.clone()),
            api,
            invoker: BenchmarkInvoker::new(config.retry, config.completion),
            store: ResultsStore::new(&config.results_root),
            readiness: config.readiness,
            shutdown,
            show_progress: !config.no_progress,
        }
    }

    pub fn driver(&self) -> &D {
        self.lifecycle.driver()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> &ResultsStore {
        &self.store
    }

    /// Run every scenario in order, producing exactly one result per scenario.
    ///
    /// Failures are recorded in the scenario's result and the batch moves on. Each result is
    /// persisted as soon as it is known, and a deployment is always torn down before the next
    /// scenario starts. After a shutdown request the remaining scenarios are recorded as failed
    /// without being deployed.
    pub async fn run_batch(&mut self, batch: &BatchTimestamp, scenarios: &[Scenario]) -> RunBatch {
        log::info!("Starting batch {batch} with {} scenario(s)", scenarios.len());

        let progress = BatchProgress::new(scenarios.len(), self.show_progress);
        let mut run_batch = RunBatch::new(batch.clone());

        for scenario in scenarios {
            let (result, handle) = if self.shutdown.should_shutdown() {
                log::info!("Skipping scenario '{}'", scenario.name());
                (
                    not_run(scenario, Utc::now(), RunStatus::Failed, BATCH_CANCELLED),
                    None,
                )
            } else {
                progress.start_scenario(scenario.name());
                self.run_scenario(scenario).await
            };

            if let Err(e) = self.store.persist(batch, &result) {
                log::error!("Failed to persist results for '{}': {e}", scenario.name());
                run_batch.unpersisted.push(scenario.name().to_string());
            }

            if let Some(mut handle) = handle {
                self.lifecycle.down(&mut handle).await;
            }

            progress.finish_scenario(&result);
            run_batch.results.push(result);
        }

        progress.finish();
        log::info!(
            "Batch {batch} finished: {} succeeded, {} failed, {} timed out",
            run_batch.count_with_status(RunStatus::Success),
            run_batch.count_with_status(RunStatus::Failed),
            run_batch.count_with_status(RunStatus::TimedOut),
        );

        run_batch
    }

    /// Returns the handle of any deployment that was provisioned so the caller can tear it down.
    async fn run_scenario(&mut self, scenario: &Scenario) -> (RunResult, Option<DeploymentHandle>) {
        let started_at = Utc::now();
        log::info!("Running scenario '{}'", scenario.name());

        let descriptor = match self.builder.build(scenario) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::error!("Scenario '{}' cannot be deployed: {e}", scenario.name());
                return (
                    not_run(scenario, started_at, RunStatus::Failed, e.to_string()),
                    None,
                );
            }
        };

        let mut handle = match self.lifecycle.up(&descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Scenario '{}': {e}", scenario.name());
                return (
                    not_run(scenario, started_at, RunStatus::Failed, e.to_string()),
                    None,
                );
            }
        };

        if self.shutdown.should_shutdown() {
            return (
                not_run(scenario, started_at, RunStatus::Failed, CANCELLED),
                Some(handle),
            );
        }

        let readiness = tokio::select! {
            readiness = self.lifecycle.wait_ready(&mut handle, &self.api, &self.readiness) => {
                Step::Done(readiness)
            }
            _ = self.shutdown.wait_for_shutdown() => Step::Cancelled,
        };
        match readiness {
            Step::Done(Readiness::Ready) => {}
            Step::Done(Readiness::TimedOut) => {
                let detail = format!(
                    "Benchmark API at {} was not ready within {:?}",
                    handle.api_url(),
                    self.readiness.timeout
                );
                return (
                    not_run(scenario, started_at, RunStatus::TimedOut, detail),
                    Some(handle),
                );
            }
            Step::Cancelled => {
                return (
                    not_run(scenario, started_at, RunStatus::Failed, CANCELLED),
                    Some(handle),
                );
            }
        }

        let result = tokio::select! {
            result = self.invoker.run(&self.api, &handle, scenario) => Step::Done(result),
            _ = self.shutdown.wait_for_shutdown() => Step::Cancelled,
        };
        let result = match result {
            Step::Done(result) => result,
            Step::Cancelled => {
                let mut result = not_run(scenario, started_at, RunStatus::Failed, CANCELLED);
                result.benchmark_ran = true;
                result
            }
        };

        (result, Some(handle))
    }
}
