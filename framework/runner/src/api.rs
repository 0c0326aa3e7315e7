//! Client side of the benchmark API served by each deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_tunnel_summary_model::StageMetric;
use url::Url;

use crate::catalog::Scenario;

/// Body of `POST /benchmark`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BenchmarkRequest {
    pub dataset_scale: f64,
    pub cores_per_worker: u32,
    pub mem_per_worker: f64,
    pub num_workers: u32,
}

impl From<&Scenario> for BenchmarkRequest {
    fn from(scenario: &Scenario) -> Self {
        Self {
            dataset_scale: scenario.dataset_scale(),
            cores_per_worker: scenario.cores_per_worker(),
            mem_per_worker: scenario.memory_per_worker(),
            num_workers: scenario.worker_count(),
        }
    }
}

/// Measurements reported for a completed benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub metrics: Vec<StageMetric>,
    pub rows_processed: Option<u64>,
    pub elapsed_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BenchmarkStatus {
    /// Accepted and not finished yet
    Pending,
    Done(BenchmarkReport),
    /// The job ran and failed on the cluster
    Error(String),
}

/// A failed call to the benchmark API.
///
/// Transient errors are expected to go away by waiting: the service is still starting, the
/// network dropped, or the server reported a 5xx. Definitive errors mean the request or the
/// response has the wrong shape, and repeating the call gives the same answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Definitive(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// The operations the runner needs from a deployment's benchmark API.
///
/// `base_url` is the root of the API for one deployment, such as `http://127.0.0.1:8000/`.
#[allow(async_fn_in_trait)]
pub trait ClusterApi {
    /// `GET /health`, succeeding only on a 2xx response.
    async fn health(&self, base_url: &Url) -> Result<(), ApiError>;

    /// `POST /benchmark`, returning the run id assigned by the cluster.
    async fn submit(
        &self,
        base_url: &Url,
        request: &BenchmarkRequest,
    ) -> Result<String, ApiError>;

    /// `GET /benchmark/{run_id}`
    async fn status(&self, base_url: &Url, run_id: &str) -> Result<BenchmarkStatus, ApiError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RunId {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
struct SubmitResponse {
    run_id: RunId,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    metrics: Option<Vec<StageMetric>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    rows_processed: Option<u64>,
    #[serde(default)]
    elapsed_seconds: Option<f64>,
}

impl TryFrom<StatusResponse> for BenchmarkStatus {
    type Error = ApiError;

    fn try_from(response: StatusResponse) -> Result<Self, ApiError> {
        match response.status.as_str() {
            "pending" | "running" => Ok(BenchmarkStatus::Pending),
            "done" => {
                let metrics = response.metrics.ok_or_else(|| {
                    ApiError::Definitive("Benchmark reported done without metrics".to_string())
                })?;
                Ok(BenchmarkStatus::Done(BenchmarkReport {
                    metrics,
                    rows_processed: response.rows_processed,
                    elapsed_seconds: response.elapsed_seconds,
                }))
            }
            "error" => Ok(BenchmarkStatus::Error(
                response
                    .error
                    .unwrap_or_else(|| "Benchmark failed without an error message".to_string()),
            )),
            other => Err(ApiError::Definitive(format!(
                "Unexpected benchmark status '{other}'"
            ))),
        }
    }
}

/// [ClusterApi] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClusterApi {
    client: reqwest::Client,
}

impl HttpClusterApi {
    /// Every request is bounded by `request_timeout`.
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        Ok(Self { client })
    }

    async fn read_body(response: reqwest::Response) -> Result<bytes::Bytes, ApiError> {
        let status = response.status();
        let url = response.url().clone();
        let body = response.bytes().await.map_err(classify)?;

        if status.is_success() {
            return Ok(body);
        }

        let detail = String::from_utf8_lossy(&body);
        let message = format!("{url} responded with {status}: {}", detail.trim());
        if status.is_server_error() {
            Err(ApiError::Transient(message))
        } else {
            Err(ApiError::Definitive(message))
        }
    }
}

impl ClusterApi for HttpClusterApi {
    async fn health(&self, base_url: &Url) -> Result<(), ApiError> {
        let response = self
            .client
            .get(endpoint(base_url, &["health"])?)
            .send()
            .await
            .map_err(classify)?;

        Self::read_body(response).await.map(|_| ())
    }

    async fn submit(&self, base_url: &Url, request: &BenchmarkRequest) -> Result<String, ApiError> {
        let response = self
            .client
            .post(endpoint(base_url, &["benchmark"])?)
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let body = Self::read_body(response).await?;
        let submitted: SubmitResponse = decode(&body)?;

        Ok(match submitted.run_id {
            RunId::Text(id) => id,
            RunId::Number(id) => id.to_string(),
        })
    }

    async fn status(&self, base_url: &Url, run_id: &str) -> Result<BenchmarkStatus, ApiError> {
        let response = self
            .client
            .get(endpoint(base_url, &["benchmark", run_id])?)
            .send()
            .await
            .map_err(classify)?;

        let body = Self::read_body(response).await?;
        decode::<StatusResponse>(&body)?.try_into()
    }
}

fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::Definitive(format!("'{base_url}' cannot be used as a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Definitive(format!("Unexpected response payload: {e}")))
}

fn classify(err: reqwest::Error) -> ApiError {
    if err.is_builder() || err.is_decode() {
        ApiError::Definitive(err.to_string())
    } else {
        ApiError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(json: &str) -> Result<BenchmarkStatus, ApiError> {
        decode::<StatusResponse>(json.as_bytes())?.try_into()
    }

    #[test]
    fn endpoint_appends_segments() {
        let base = Url::parse("http://127.0.0.1:8000/").unwrap();
        assert_eq!(
            endpoint(&base, &["benchmark", "run 1"]).unwrap().as_str(),
            "http://127.0.0.1:8000/benchmark/run%201"
        );

        let nested = Url::parse("http://cluster/api/").unwrap();
        assert_eq!(
            endpoint(&nested, &["health"]).unwrap().as_str(),
            "http://cluster/api/health"
        );
    }

    #[test]
    fn pending_and_running_are_pending() {
        assert_eq!(status(r#"{"status": "pending"}"#), Ok(BenchmarkStatus::Pending));
        assert_eq!(status(r#"{"status": "running"}"#), Ok(BenchmarkStatus::Pending));
    }

    #[test]
    fn done_carries_metrics() {
        let parsed = status(
            r#"{"status": "done", "rows_processed": 500, "elapsed_seconds": 2.5,
                "metrics": [{"stage_id": 1, "stage_name": "load", "num_tasks": 4, "duration_ms": 900}]}"#,
        )
        .unwrap();

        let BenchmarkStatus::Done(report) = parsed else {
            panic!("expected done, got {parsed:?}");
        };
        assert_eq!(report.metrics.len(), 1);
        assert_eq!(report.metrics[0].stage_name, "load");
        assert_eq!(report.rows_processed, Some(500));
    }

    #[test]
    fn error_status_is_a_job_failure() {
        assert_eq!(
            status(r#"{"status": "error", "error": "executor lost"}"#),
            Ok(BenchmarkStatus::Error("executor lost".to_string()))
        );
    }

    #[test]
    fn unexpected_shapes_are_definitive() {
        for body in [
            r#"{"status": "done"}"#,
            r#"{"status": "done", "metrics": {"stage_id": 1}}"#,
            r#"{"status": "done", "metrics": [{"stage": 1}]}"#,
            r#"{"status": "exploded"}"#,
            r#"{"state": "done"}"#,
            "not json",
        ] {
            let err = status(body).unwrap_err();
            assert!(!err.is_transient(), "{body} gave {err:?}");
        }
    }

    #[test]
    fn numeric_run_ids_are_accepted() {
        let submitted: SubmitResponse = decode(br#"{"run_id": 42}"#).unwrap();
        assert!(matches!(submitted.run_id, RunId::Number(42)));
    }
}
