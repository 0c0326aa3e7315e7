//! Running one benchmark against a ready deployment.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use spark_tunnel_summary_model::{RunResult, RunStatus};
use url::Url;

use crate::api::{ApiError, BenchmarkReport, BenchmarkRequest, BenchmarkStatus, ClusterApi};
use crate::catalog::Scenario;
use crate::lifecycle::{DeploymentHandle, MIN_POLL_INTERVAL};

/// Retry behaviour for individual benchmark API calls.
///
/// Only transient errors are retried. The wait before attempt `n + 1` is
/// `initial_backoff * multiplier^(n - 1)`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Treated as 1 if set to 0.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// The wait after failed attempt number `attempt`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// How to wait for a submitted benchmark to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// An API call that kept failing, or failed in a way that retrying cannot fix.
#[derive(Debug)]
struct CallFailed {
    attempts: u32,
    error: ApiError,
}

impl std::fmt::Display for CallFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            ApiError::Transient(e) => write!(f, "gave up after {} attempt(s): {e}", self.attempts),
            ApiError::Definitive(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug)]
enum Failure {
    Submit(CallFailed),
    Poll { run_id: String, failed: CallFailed },
    Job { run_id: String, message: String },
    Incomplete { run_id: String, after: Duration },
}

#[derive(Debug, Clone, Default)]
pub struct BenchmarkInvoker {
    retry: RetryPolicy,
    completion: CompletionPolicy,
}

impl BenchmarkInvoker {
    pub fn new(retry: RetryPolicy, completion: CompletionPolicy) -> Self {
        Self { retry, completion }
    }

    /// Submit the benchmark for `scenario` and wait for its metrics.
    ///
    /// Never fails: every outcome, including exhausted retries, is described by the returned
    /// [RunResult] so that the batch can continue with the next scenario.
    pub async fn run<A: ClusterApi>(
        &self,
        api: &A,
        handle: &DeploymentHandle,
        scenario: &Scenario,
    ) -> RunResult {
        let started_at = Utc::now();
        let request = BenchmarkRequest::from(scenario);

        log::info!(
            "Starting benchmark for scenario '{}' on deployment '{}'",
            scenario.name(),
            handle.id()
        );

        match self.execute(api, handle.api_url(), &request).await {
            Ok(report) => {
                log::info!(
                    "Benchmark for scenario '{}' completed with {} stage(s)",
                    scenario.name(),
                    report.metrics.len()
                );
                RunResult {
                    scenario_name: scenario.name().to_string(),
                    parameters: *scenario.parameters(),
                    started_at,
                    ended_at: Utc::now(),
                    status: RunStatus::Success,
                    benchmark_ran: true,
                    stage_metrics: report.metrics,
                    error_detail: None,
                    rows_processed: report.rows_processed,
                    elapsed_seconds: report.elapsed_seconds,
                    remark: scenario.remark().map(str::to_string),
                }
            }
            Err(failure) => {
                let (status, ran, detail) = match failure {
                    Failure::Submit(failed) => (
                        RunStatus::Failed,
                        false,
                        format!("Benchmark submission failed: {failed}"),
                    ),
                    Failure::Poll { run_id, failed } => (
                        RunStatus::Failed,
                        true,
                        format!("Polling benchmark {run_id} failed: {failed}"),
                    ),
                    Failure::Job { run_id, message } => (
                        RunStatus::Failed,
                        true,
                        format!("Benchmark {run_id} failed on the cluster: {message}"),
                    ),
                    Failure::Incomplete { run_id, after } => (
                        RunStatus::TimedOut,
                        true,
                        format!("Benchmark {run_id} did not complete within {after:?}"),
                    ),
                };
                log::error!("Scenario '{}': {detail}", scenario.name());

                let mut result = not_run(scenario, started_at, status, detail);
                result.benchmark_ran = ran;
                result
            }
        }
    }

    async fn execute<A: ClusterApi>(
        &self,
        api: &A,
        base_url: &Url,
        request: &BenchmarkRequest,
    ) -> Result<BenchmarkReport, Failure> {
        let run_id = self
            .with_retry("submit", || api.submit(base_url, request))
            .await
            .map_err(Failure::Submit)?;
        log::debug!("Benchmark submitted as run {run_id}");

        let interval = self.completion.poll_interval.max(MIN_POLL_INTERVAL);
        let poll = async {
            loop {
                let status = match self
                    .with_retry("status", || api.status(base_url, &run_id))
                    .await
                {
                    Ok(status) => status,
                    Err(failed) => {
                        return Err(Failure::Poll {
                            run_id: run_id.clone(),
                            failed,
                        })
                    }
                };

                match status {
                    BenchmarkStatus::Pending => {
                        log::trace!("Benchmark {run_id} still running");
                        tokio::time::sleep(interval).await;
                    }
                    BenchmarkStatus::Done(report) => return Ok(report),
                    BenchmarkStatus::Error(message) => {
                        return Err(Failure::Job {
                            run_id: run_id.clone(),
                            message,
                        })
                    }
                }
            }
        };

        match tokio::time::timeout(self.completion.timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::Incomplete {
                run_id: run_id.clone(),
                after: self.completion.timeout,
            }),
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CallFailed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    log::warn!(
                        "Benchmark {operation} attempt {attempt}/{max_attempts} failed: {error}, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(CallFailed {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}

/// A result for a scenario whose benchmark was never started.
pub(crate) fn not_run(
    scenario: &Scenario,
    started_at: DateTime<Utc>,
    status: RunStatus,
    detail: impl Into<String>,
) -> RunResult {
    RunResult {
        scenario_name: scenario.name().to_string(),
        parameters: *scenario.parameters(),
        started_at,
        ended_at: Utc::now(),
        status,
        benchmark_ran: false,
        stage_metrics: Vec::new(),
        error_detail: Some(detail.into()),
        rows_processed: None,
        elapsed_seconds: None,
        remark: scenario.remark().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use spark_tunnel_summary_model::{ScenarioParameters, StageMetric};
    use tokio::time::Instant;

    use super::*;
    use crate::descriptor::{DeploymentDescriptor, DescriptorBuilder, DescriptorConfig};
    use crate::lifecycle::{ClusterLifecycleManager, DeploymentDriver};

    struct NoopDriver;

    impl DeploymentDriver for NoopDriver {
        async fn up(&self, _: &str, _: &DeploymentDescriptor) -> anyhow::Result<()> {
            Ok(())
        }

        async fn down(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Replays scripted responses, repeating the last one once the script runs out.
    struct ScriptedApi {
        submits: RefCell<VecDeque<Result<String, ApiError>>>,
        statuses: RefCell<VecDeque<Result<BenchmarkStatus, ApiError>>>,
        submit_calls: Cell<u32>,
        status_calls: Cell<u32>,
        requests: RefCell<Vec<BenchmarkRequest>>,
    }

    impl ScriptedApi {
        fn new(
            submits: Vec<Result<String, ApiError>>,
            statuses: Vec<Result<BenchmarkStatus, ApiError>>,
        ) -> Self {
            Self {
                submits: RefCell::new(submits.into()),
                statuses: RefCell::new(statuses.into()),
                submit_calls: Cell::new(0),
                status_calls: Cell::new(0),
                requests: RefCell::new(Vec::new()),
            }
        }

        fn next<T: Clone>(queue: &RefCell<VecDeque<T>>) -> T {
            let mut queue = queue.borrow_mut();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().expect("script must not be empty")
            }
        }
    }

    impl ClusterApi for ScriptedApi {
        async fn health(&self, _: &Url) -> Result<(), ApiError> {
            Ok(())
        }

        async fn submit(&self, _: &Url, request: &BenchmarkRequest) -> Result<String, ApiError> {
            self.submit_calls.set(self.submit_calls.get() + 1);
            self.requests.borrow_mut().push(request.clone());
            Self::next(&self.submits)
        }

        async fn status(&self, _: &Url, _: &str) -> Result<BenchmarkStatus, ApiError> {
            self.status_calls.set(self.status_calls.get() + 1);
            Self::next(&self.statuses)
        }
    }

    fn scenario() -> Scenario {
        Scenario::new(
            "invoke",
            ScenarioParameters {
                num_workers: 2,
                mem_per_worker: 4.0,
                cores_per_worker: 2,
                dataset_scale: 0.25,
            },
        )
        .unwrap()
    }

    fn report() -> BenchmarkReport {
        BenchmarkReport {
            metrics: vec![StageMetric {
                stage_id: 0,
                stage_name: "clean".to_string(),
                num_tasks: 4,
                duration_ms: 1500,
                executor_run_time_ms: 5000,
                executor_cpu_time_ms: 4200,
                records_read: 1000,
                bytes_read: 2048,
                shuffle_read_bytes: 0,
                shuffle_write_bytes: 0,
            }],
            rows_processed: Some(1000),
            elapsed_seconds: Some(2.0),
        }
    }

    fn invoker(max_attempts: u32) -> BenchmarkInvoker {
        BenchmarkInvoker::new(
            RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                multiplier: 2,
            },
            CompletionPolicy {
                poll_interval: Duration::from_secs(5),
                timeout: Duration::from_secs(60),
            },
        )
    }

    async fn handle() -> (ClusterLifecycleManager<NoopDriver>, DeploymentHandle) {
        let manager = ClusterLifecycleManager::new(NoopDriver, "127.0.0.1");
        let descriptor = DescriptorBuilder::new(DescriptorConfig::default())
            .build(&scenario())
            .unwrap();
        let handle = manager.up(&descriptor).await.unwrap();
        (manager, handle)
    }

    fn transient() -> ApiError {
        ApiError::Transient("503 Service Unavailable".to_string())
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
        };

        let waits = (1..=6).map(|n| policy.backoff(n).as_secs()).collect::<Vec<_>>();
        assert_eq!(waits, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.backoff(100), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_records_metrics() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Ok("run-1".to_string())],
            vec![
                Ok(BenchmarkStatus::Pending),
                Ok(BenchmarkStatus::Pending),
                Ok(BenchmarkStatus::Done(report())),
            ],
        );

        let result = invoker(3).run(&api, &handle, &scenario()).await;

        assert_eq!(result.status, RunStatus::Success);
        assert!(result.benchmark_ran);
        assert_eq!(result.stage_metrics, report().metrics);
        assert_eq!(result.throughput(), Some(500.0));
        assert_eq!(result.error_detail, None);
        assert_eq!(result.remark, None);
        assert_eq!(api.status_calls.get(), 3);
        assert_eq!(
            api.requests.borrow()[0],
            BenchmarkRequest {
                dataset_scale: 0.25,
                cores_per_worker: 2,
                mem_per_worker: 4.0,
                num_workers: 2,
            }
        );

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_up_to_max_attempts() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(vec![Err(transient())], vec![Ok(BenchmarkStatus::Pending)]);

        let start = Instant::now();
        let result = invoker(4).run(&api, &handle, &scenario()).await;

        assert_eq!(api.submit_calls.get(), 4);
        assert_eq!(api.status_calls.get(), 0);
        // Waits of 1, 2 and 4 seconds between the four attempts
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(result.status, RunStatus::Failed);
        assert!(!result.benchmark_ran);
        let detail = result.error_detail.unwrap();
        assert!(detail.contains("gave up after 4 attempt(s)"), "{detail}");

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Err(transient()), Ok("run-2".to_string())],
            vec![Err(transient()), Ok(BenchmarkStatus::Done(report()))],
        );

        let result = invoker(3).run(&api, &handle, &scenario()).await;

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(api.submit_calls.get(), 2);
        assert_eq!(api.status_calls.get(), 2);

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_error_is_not_retried() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Err(ApiError::Definitive(
                "400 Bad Request: dataset_scale must be <= 1".to_string(),
            ))],
            vec![Ok(BenchmarkStatus::Pending)],
        );

        let start = Instant::now();
        let result = invoker(5).run(&api, &handle, &scenario()).await;

        assert_eq!(api.submit_calls.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error_detail.unwrap().contains("400 Bad Request"));

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_metrics_fail_without_retry() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Ok("run-3".to_string())],
            vec![Err(ApiError::Definitive(
                "Benchmark reported done without metrics".to_string(),
            ))],
        );

        let result = invoker(5).run(&api, &handle, &scenario()).await;

        assert_eq!(api.status_calls.get(), 1);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.benchmark_ran);

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn job_error_is_recorded() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Ok("run-4".to_string())],
            vec![Ok(BenchmarkStatus::Error("OutOfMemoryError".to_string()))],
        );

        let result = invoker(3).run(&api, &handle, &scenario()).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.benchmark_ran);
        assert_eq!(
            result.error_detail.as_deref(),
            Some("Benchmark run-4 failed on the cluster: OutOfMemoryError")
        );

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_completing_benchmark_times_out() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Ok("run-5".to_string())],
            vec![Ok(BenchmarkStatus::Pending)],
        );

        let start = Instant::now();
        let result = invoker(3).run(&api, &handle, &scenario()).await;

        assert_eq!(result.status, RunStatus::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        // Polls at 0, 5, ..., 55 seconds, and possibly one racing the deadline
        assert!(api.status_calls.get() >= 12);

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_is_still_bounded_by_the_timeout() {
        let (manager, mut handle) = handle().await;
        let api = ScriptedApi::new(
            vec![Ok("run-6".to_string())],
            vec![Ok(BenchmarkStatus::Pending)],
        );
        let invoker = BenchmarkInvoker::new(
            RetryPolicy::default(),
            CompletionPolicy {
                poll_interval: Duration::ZERO,
                timeout: Duration::from_secs(1),
            },
        );

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            invoker.run(&api, &handle, &scenario()),
        )
        .await
        .expect("polling must stop at the completion timeout");

        assert_eq!(result.status, RunStatus::TimedOut);
        assert!(api.status_calls.get() <= 11, "{}", api.status_calls.get());

        manager.down(&mut handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn remark_is_carried_into_every_result() {
        let (manager, mut handle) = handle().await;
        let scenario = scenario().with_remark("Baseline configuration");

        let done = ScriptedApi::new(
            vec![Ok("run-7".to_string())],
            vec![Ok(BenchmarkStatus::Done(report()))],
        );
        let result = invoker(1).run(&done, &handle, &scenario).await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.remark.as_deref(), Some("Baseline configuration"));

        let rejected = ScriptedApi::new(
            vec![Err(ApiError::Definitive("400 Bad Request".to_string()))],
            vec![Ok(BenchmarkStatus::Pending)],
        );
        let result = invoker(1).run(&rejected, &handle, &scenario).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.remark.as_deref(), Some("Baseline configuration"));

        manager.down(&mut handle).await;
    }
}
