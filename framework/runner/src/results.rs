//! Results layout on disk.
//!
//! ```text
//! <root>/<batch timestamp>/run_summary.jsonl
//! <root>/<batch timestamp>/<scenario name>/results.csv
//! <root>/<batch timestamp>/<scenario name>/metrics/summary.json
//! <root>/<batch timestamp>/<scenario name>/metrics/stage_metrics.json
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use spark_tunnel_summary_model::{
    append_run_result, load_run_results, BatchTimestamp, RunResult, StageMetric,
};

pub const RUN_SUMMARY_FILE: &str = "run_summary.jsonl";
pub const RESULTS_CSV_FILE: &str = "results.csv";
pub const METRICS_DIR: &str = "metrics";

const CSV_HEADER: [&str; 20] = [
    "scenario_name",
    "status",
    "num_workers",
    "mem_per_worker",
    "cores_per_worker",
    "dataset_scale",
    "stage_id",
    "stage_name",
    "num_tasks",
    "duration_ms",
    "executor_run_time_ms",
    "executor_cpu_time_ms",
    "records_read",
    "bytes_read",
    "shuffle_read_bytes",
    "shuffle_write_bytes",
    "started_at",
    "ended_at",
    "rows_processed",
    "elapsed_seconds",
];

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Results for batch {batch} already exist at '{}'", path.display())]
    BatchExists { batch: BatchTimestamp, path: PathBuf },
    #[error("Failed to {action} '{}': {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Failed to write '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to append to '{}': {source:#}", path.display())]
    Summary {
        path: PathBuf,
        source: anyhow::Error,
    },
}

/// Summary written next to the stage metrics of each scenario.
#[derive(Serialize)]
struct ScenarioSummary<'a> {
    batch_timestamp: &'a BatchTimestamp,
    #[serde(flatten)]
    result: &'a RunResult,
    total_stage_duration_ms: u64,
    throughput_rows_per_second: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ResultsStore {
    root: PathBuf,
}

impl ResultsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, batch: &BatchTimestamp) -> PathBuf {
        self.root.join(batch.as_str())
    }

    pub fn scenario_dir(&self, batch: &BatchTimestamp, scenario_name: &str) -> PathBuf {
        self.batch_dir(batch).join(scenario_name)
    }

    /// Create the directory for a new batch, refusing to reuse one from an earlier batch.
    pub fn reserve_batch(&self, batch: &BatchTimestamp) -> Result<PathBuf, PersistError> {
        fs::create_dir_all(&self.root).map_err(|source| PersistError::Io {
            action: "create results root",
            path: self.root.clone(),
            source,
        })?;

        let path = self.batch_dir(batch);
        match fs::create_dir(&path) {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(PersistError::BatchExists {
                batch: batch.clone(),
                path,
            }),
            Err(source) => Err(PersistError::Io {
                action: "create batch directory",
                path,
                source,
            }),
        }
    }

    /// Write the result of one scenario, returning the scenario's results directory.
    pub fn persist(
        &self,
        batch: &BatchTimestamp,
        result: &RunResult,
    ) -> Result<PathBuf, PersistError> {
        let scenario_dir = self.scenario_dir(batch, &result.scenario_name);
        let metrics_dir = scenario_dir.join(METRICS_DIR);
        fs::create_dir_all(&metrics_dir).map_err(|source| PersistError::Io {
            action: "create results directory",
            path: metrics_dir.clone(),
            source,
        })?;

        write_csv(&scenario_dir.join(RESULTS_CSV_FILE), result)?;

        write_json(
            &metrics_dir.join("summary.json"),
            &ScenarioSummary {
                batch_timestamp: batch,
                result,
                total_stage_duration_ms: result.total_stage_duration_ms(),
                throughput_rows_per_second: result.throughput(),
            },
        )?;
        write_json(&metrics_dir.join("stage_metrics.json"), &result.stage_metrics)?;

        let summary_path = self.batch_dir(batch).join(RUN_SUMMARY_FILE);
        append_run_result(result, &summary_path).map_err(|source| PersistError::Summary {
            path: summary_path,
            source,
        })?;

        log::debug!(
            "Persisted results for '{}' to '{}'",
            result.scenario_name,
            scenario_dir.display()
        );

        Ok(scenario_dir)
    }

    /// Load the run summaries of every batch under the root, oldest batch first.
    ///
    /// Directories that are not named like a batch are skipped.
    pub fn load_batches(&self) -> anyhow::Result<Vec<(BatchTimestamp, Vec<RunResult>)>> {
        let mut batches = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read results root '{}'", self.root.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(batch) = entry
                .file_name()
                .to_str()
                .and_then(|name| BatchTimestamp::parse(name).ok())
            else {
                log::debug!("Skipping '{}'", entry.path().display());
                continue;
            };

            let summary_path = entry.path().join(RUN_SUMMARY_FILE);
            if !summary_path.exists() {
                log::debug!("Batch {batch} has no run summary");
                continue;
            }

            let file = fs::File::open(&summary_path)
                .with_context(|| format!("Failed to open '{}'", summary_path.display()))?;
            let results = load_run_results(file)
                .with_context(|| format!("Failed to load '{}'", summary_path.display()))?;
            batches.push((batch, results));
        }

        batches.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(batches)
    }
}

fn write_csv(path: &Path, result: &RunResult) -> Result<(), PersistError> {
    let csv_err = |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer.write_record(CSV_HEADER).map_err(csv_err)?;

    // A run without stage metrics still gets one row carrying its outcome
    let stages: Vec<Option<&StageMetric>> = if result.stage_metrics.is_empty() {
        vec![None]
    } else {
        result.stage_metrics.iter().map(Some).collect()
    };

    let parameters = &result.parameters;
    for stage in stages {
        let mut record = Vec::with_capacity(CSV_HEADER.len());
        record.extend([
            result.scenario_name.clone(),
            result.status.to_string(),
            parameters.num_workers.to_string(),
            parameters.mem_per_worker.to_string(),
            parameters.cores_per_worker.to_string(),
            parameters.dataset_scale.to_string(),
        ]);
        record.extend(stage.map(stage_fields).unwrap_or_default());
        record.extend([
            result.started_at.to_rfc3339(),
            result.ended_at.to_rfc3339(),
            optional_field(result.rows_processed),
            optional_field(result.elapsed_seconds),
        ]);
        writer.write_record(&record).map_err(csv_err)?;
    }

    writer.flush().map_err(|source| PersistError::Io {
        action: "flush",
        path: path.to_path_buf(),
        source,
    })
}

fn stage_fields(stage: &StageMetric) -> [String; 10] {
    [
        stage.stage_id.to_string(),
        stage.stage_name.clone(),
        stage.num_tasks.to_string(),
        stage.duration_ms.to_string(),
        stage.executor_run_time_ms.to_string(),
        stage.executor_cpu_time_ms.to_string(),
        stage.records_read.to_string(),
        stage.bytes_read.to_string(),
        stage.shuffle_read_bytes.to_string(),
        stage.shuffle_write_bytes.to_string(),
    ]
}

fn optional_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let file = fs::File::create(path).map_err(|source| PersistError::Io {
        action: "create",
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(file, value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use spark_tunnel_summary_model::{RunStatus, ScenarioParameters};

    use super::*;

    fn result(name: &str, stages: usize) -> RunResult {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        RunResult {
            scenario_name: name.to_string(),
            parameters: ScenarioParameters {
                num_workers: 1,
                mem_per_worker: 4.0,
                cores_per_worker: 2,
                dataset_scale: 0.1,
            },
            started_at,
            ended_at: started_at + chrono::Duration::seconds(30),
            status: RunStatus::Success,
            benchmark_ran: true,
            stage_metrics: (0..stages as u64)
                .map(|stage_id| StageMetric {
                    stage_id,
                    stage_name: format!("stage, {stage_id}"),
                    num_tasks: 2,
                    duration_ms: 100 * (stage_id + 1),
                    executor_run_time_ms: 0,
                    executor_cpu_time_ms: 0,
                    records_read: 10,
                    bytes_read: 0,
                    shuffle_read_bytes: 0,
                    shuffle_write_bytes: 0,
                })
                .collect(),
            error_detail: None,
            rows_processed: Some(100),
            elapsed_seconds: Some(2.0),
            remark: None,
        }
    }

    fn batch(value: &str) -> BatchTimestamp {
        BatchTimestamp::parse(value).unwrap()
    }

    #[test]
    fn persist_writes_under_batch_and_scenario() {
        let root = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(root.path());
        let batch = batch("20240101T000000");
        let mut result = result("x", 2);
        result.remark = Some("Baseline configuration".to_string());

        let dir = store.persist(&batch, &result).unwrap();

        assert_eq!(dir, root.path().join("20240101T000000").join("x"));
        assert!(dir.join(RESULTS_CSV_FILE).is_file());
        assert!(dir.join("metrics").join("summary.json").is_file());
        assert!(dir.join("metrics").join("stage_metrics.json").is_file());

        let mut reader = csv::Reader::from_path(dir.join(RESULTS_CSV_FILE)).unwrap();
        assert_eq!(reader.headers().unwrap().len(), CSV_HEADER.len());
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][7], "stage, 1");
        assert_eq!(&rows[1][9], "200");
        assert_eq!(&rows[1][18], "100");
        assert_eq!(&rows[1][19], "2");

        let summary: serde_json::Value = serde_json::from_reader(
            fs::File::open(dir.join("metrics").join("summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["batch_timestamp"], "20240101T000000");
        assert_eq!(summary["scenario_name"], "x");
        assert_eq!(summary["total_stage_duration_ms"], 300);
        assert_eq!(summary["throughput_rows_per_second"], 50.0);
        assert_eq!(summary["remark"], "Baseline configuration");
    }

    #[test]
    fn result_without_stages_gets_one_outcome_row() {
        let root = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(root.path());
        let mut failed = result("broken", 0);
        failed.status = RunStatus::Failed;
        failed.error_detail = Some("never became ready".to_string());
        failed.rows_processed = None;
        failed.elapsed_seconds = None;

        let dir = store.persist(&batch("20240101T000000"), &failed).unwrap();

        let mut reader = csv::Reader::from_path(dir.join(RESULTS_CSV_FILE)).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(&header[0], "scenario_name");
        assert_eq!(&header[19], "elapsed_seconds");
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "broken");
        assert_eq!(&rows[0][1], "failed");
        assert_eq!(&rows[0][6], "");
        assert_eq!(&rows[0][16], "2024-01-01T00:00:00+00:00");
        assert_eq!(&rows[0][19], "");
    }

    #[test]
    fn batches_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(root.path());
        let first = batch("20240101T000000");
        let second = batch("20240101T000500");

        store.reserve_batch(&first).unwrap();
        store.persist(&first, &result("x", 1)).unwrap();
        store.reserve_batch(&second).unwrap();
        store.persist(&second, &result("x", 3)).unwrap();

        let batches = store.load_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, first);
        assert_eq!(batches[0].1[0].stage_metrics.len(), 1);
        assert_eq!(batches[1].0, second);
        assert_eq!(batches[1].1[0].stage_metrics.len(), 3);
    }

    #[test]
    fn reserving_an_existing_batch_fails() {
        let root = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(root.path());
        let batch = batch("20240101T000000");

        store.reserve_batch(&batch).unwrap();
        assert!(matches!(
            store.reserve_batch(&batch),
            Err(PersistError::BatchExists { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_root_is_a_persist_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, "file in the way").unwrap();
        let store = ResultsStore::new(&blocker);

        let err = store
            .persist(&batch("20240101T000000"), &result("x", 1))
            .unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }), "{err:?}");
    }

    #[test]
    fn load_batches_skips_foreign_directories() {
        let root = tempfile::tempdir().unwrap();
        let store = ResultsStore::new(root.path());
        fs::create_dir(root.path().join("scratch")).unwrap();
        store
            .persist(&batch("20240101T000000"), &result("x", 1))
            .unwrap();

        let batches = store.load_batches().unwrap();
        assert_eq!(batches.len(), 1);
    }
}
