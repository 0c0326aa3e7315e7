use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::path::Path;

/// Format of a [BatchTimestamp], for example `20240101T000000`.
pub const BATCH_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Identifies one batch of runs and names its top-level results directory.
///
/// Generated once per batch, in UTC, at one second resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BatchTimestamp(String);

impl BatchTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(BATCH_TIMESTAMP_FORMAT).to_string())
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        NaiveDateTime::parse_from_str(value, BATCH_TIMESTAMP_FORMAT).map_err(|e| {
            anyhow::anyhow!("Invalid batch timestamp '{value}', expected {BATCH_TIMESTAMP_FORMAT}: {e}")
        })?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BatchTimestamp {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BatchTimestamp> for String {
    fn from(value: BatchTimestamp) -> Self {
        value.0
    }
}

/// The resources and data size a scenario was run with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScenarioParameters {
    pub num_workers: u32,
    /// Memory per worker, in GB
    pub mem_per_worker: f64,
    pub cores_per_worker: u32,
    /// Fraction of the dataset to process
    pub dataset_scale: f64,
}

/// Terminal outcome of one scenario.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    TimedOut,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
            RunStatus::TimedOut => f.write_str("timed_out"),
        }
    }
}

/// Measurements for a single stage of the benchmark job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageMetric {
    pub stage_id: u64,
    pub stage_name: String,
    pub num_tasks: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub executor_run_time_ms: u64,
    #[serde(default)]
    pub executor_cpu_time_ms: u64,
    #[serde(default)]
    pub records_read: u64,
    #[serde(default)]
    pub bytes_read: u64,
    #[serde(default)]
    pub shuffle_read_bytes: u64,
    #[serde(default)]
    pub shuffle_write_bytes: u64,
}

/// The result of running one scenario against its own deployment.
///
/// Created once the scenario has concluded and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub scenario_name: String,
    pub parameters: ScenarioParameters,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Whether the benchmark job was accepted by the cluster.
    ///
    /// Separates a benchmark that ran and measured poorly from one that never ran because
    /// provisioning or readiness failed.
    pub benchmark_ran: bool,
    pub stage_metrics: Vec<StageMetric>,
    /// Human-readable reason for a [RunStatus::Failed] or [RunStatus::TimedOut] result
    pub error_detail: Option<String>,
    /// Number of dataset rows the benchmark processed, if reported
    pub rows_processed: Option<u64>,
    /// Benchmark wall-clock time as reported by the cluster, in seconds
    pub elapsed_seconds: Option<f64>,
    /// Free-text note copied from the scenario configuration
    #[serde(default)]
    pub remark: Option<String>,
}

impl RunResult {
    /// Rows processed per second, when the cluster reported both rows and elapsed time.
    pub fn throughput(&self) -> Option<f64> {
        match (self.rows_processed, self.elapsed_seconds) {
            (Some(rows), Some(elapsed)) if elapsed > 0.0 => Some(rows as f64 / elapsed),
            _ => None,
        }
    }

    /// Total stage duration in milliseconds.
    pub fn total_stage_duration_ms(&self) -> u64 {
        self.stage_metrics.iter().map(|s| s.duration_ms).sum()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// All results from a single orchestrator invocation, in scenario order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunBatch {
    pub batch_timestamp: BatchTimestamp,
    pub results: Vec<RunResult>,
    /// Names of the scenarios whose results could not be written to storage
    pub unpersisted: Vec<String>,
}

impl RunBatch {
    pub fn new(batch_timestamp: BatchTimestamp) -> Self {
        Self {
            batch_timestamp,
            results: Vec::new(),
            unpersisted: Vec::new(),
        }
    }

    pub fn count_with_status(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Append a run result to a JSON lines file, creating the file if needed.
pub fn append_run_result(run_result: &RunResult, path: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_result(run_result, &mut file)?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Serialize a run result to a writer
pub fn store_run_result<W: Write>(run_result: &RunResult, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_result)?;
    Ok(())
}

/// Load every run result from a reader over the format written by [append_run_result].
///
/// Blank lines are skipped.
pub fn load_run_results<R: Read>(reader: R) -> anyhow::Result<Vec<RunResult>> {
    let reader = std::io::BufReader::new(reader);
    let mut results = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        results.push(serde_json::from_str(&line)?);
    }
    Ok(results)
}
