use std::cmp::Ordering;

use spark_tunnel_runner::prelude::{BatchTimestamp, RunResult, RunStatus};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
pub struct RunRow {
    pub batch: String,
    pub scenario: String,
    pub status: RunStatus,
    pub workers: u32,
    #[tabled(rename = "mem_per_worker_gb", display = "float2")]
    pub mem_per_worker: f64,
    pub cores_per_worker: u32,
    #[tabled(display = "float2")]
    pub dataset_scale: f64,
    pub stages: usize,
    pub total_stage_ms: u64,
    #[tabled(rename = "elapsed_s", display = "optional_float2")]
    pub elapsed_seconds: Option<f64>,
    #[tabled(rename = "rows_per_s", display = "optional_float2")]
    pub throughput: Option<f64>,
    #[tabled(display = "optional_text")]
    pub remark: Option<String>,
}

impl RunRow {
    pub fn new(batch: &BatchTimestamp, result: &RunResult) -> Self {
        Self {
            batch: batch.to_string(),
            scenario: result.scenario_name.clone(),
            status: result.status,
            workers: result.parameters.num_workers,
            mem_per_worker: result.parameters.mem_per_worker,
            cores_per_worker: result.parameters.cores_per_worker,
            dataset_scale: result.parameters.dataset_scale,
            stages: result.stage_metrics.len(),
            total_stage_ms: result.total_stage_duration_ms(),
            elapsed_seconds: result.elapsed_seconds,
            throughput: result.throughput(),
            remark: result.remark.clone(),
        }
    }
}

/// Order rows by benchmark wall-clock time, fastest first. Rows without a time go last.
pub fn sort_by_elapsed(rows: &mut [RunRow]) {
    rows.sort_by(|a, b| match (a.elapsed_seconds, b.elapsed_seconds) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

pub fn results_table(rows: &[RunRow]) -> String {
    let mut table = Table::new(rows);
    table.with(Style::modern());
    table.to_string()
}

fn float2(n: &f64) -> String {
    format!("{:.2}", n)
}

fn optional_float2(n: &Option<f64>) -> String {
    n.as_ref().map(float2).unwrap_or_else(|| "-".to_string())
}

fn optional_text(text: &Option<String>) -> String {
    text.clone().unwrap_or_else(|| "-".to_string())
}
