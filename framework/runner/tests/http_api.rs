use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use spark_tunnel_runner::prelude::*;
use url::Url;

async fn serve(router: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

fn client() -> HttpClusterApi {
    HttpClusterApi::new(Duration::from_secs(5)).unwrap()
}

fn request() -> BenchmarkRequest {
    BenchmarkRequest {
        dataset_scale: 0.5,
        cores_per_worker: 2,
        mem_per_worker: 4.0,
        num_workers: 3,
    }
}

#[tokio::test]
async fn healthy_api_answers_ok() {
    let base = serve(Router::new().route("/health", get(|| async { "ok" }))).await;

    assert_eq!(client().health(&base).await, Ok(()));
}

#[tokio::test]
async fn server_errors_are_transient() {
    let base = serve(Router::new().route(
        "/health",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "starting") }),
    ))
    .await;

    let err = client().health(&base).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
    assert!(err.to_string().contains("starting"), "{err}");
}

#[tokio::test]
async fn connection_refused_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let base = Url::parse(&format!("http://{addr}/")).unwrap();

    let err = client().health(&base).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn slow_responses_time_out_as_transient() {
    let base = serve(Router::new().route(
        "/health",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "late"
        }),
    ))
    .await;
    let api = HttpClusterApi::new(Duration::from_millis(200)).unwrap();

    let err = api.health(&base).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn submit_posts_scenario_parameters() {
    let base = serve(Router::new().route(
        "/benchmark",
        post(|Json(body): Json<Value>| async move {
            Json(json!({ "run_id": format!("run-{}-{}", body["num_workers"], body["cores_per_worker"]) }))
        }),
    ))
    .await;

    let run_id = client().submit(&base, &request()).await.unwrap();
    assert_eq!(run_id, "run-3-2");
}

#[tokio::test]
async fn rejected_submission_is_definitive() {
    let base = serve(Router::new().route(
        "/benchmark",
        post(|| async { (StatusCode::BAD_REQUEST, "dataset_scale out of range") }),
    ))
    .await;

    let err = client().submit(&base, &request()).await.unwrap_err();
    assert!(!err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn status_reports_metrics_when_done() {
    let base = serve(Router::new().route(
        "/benchmark/{run_id}",
        get(|Path(run_id): Path<String>| async move {
            if run_id == "finished" {
                Json(json!({
                    "status": "done",
                    "rows_processed": 2000,
                    "elapsed_seconds": 4.0,
                    "metrics": [
                        {"stage_id": 0, "stage_name": "read", "num_tasks": 8, "duration_ms": 2100},
                        {"stage_id": 1, "stage_name": "aggregate", "num_tasks": 4, "duration_ms": 900,
                         "shuffle_read_bytes": 1024}
                    ]
                }))
            } else {
                Json(json!({ "status": "running" }))
            }
        }),
    ))
    .await;
    let api = client();

    assert_eq!(
        api.status(&base, "other").await,
        Ok(BenchmarkStatus::Pending)
    );

    let BenchmarkStatus::Done(report) = api.status(&base, "finished").await.unwrap() else {
        panic!("expected a finished benchmark");
    };
    assert_eq!(report.metrics.len(), 2);
    assert_eq!(report.metrics[1].shuffle_read_bytes, 1024);
    assert_eq!(report.metrics[0].shuffle_read_bytes, 0);
    assert_eq!(report.rows_processed, Some(2000));
}

#[tokio::test]
async fn malformed_metrics_are_definitive() {
    let base = serve(Router::new().route(
        "/benchmark/{run_id}",
        get(|| async { Json(json!({ "status": "done", "metrics": {"stage_id": 0} })) }),
    ))
    .await;

    let err = client().status(&base, "abc").await.unwrap_err();
    assert!(!err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn missing_run_is_definitive() {
    let base = serve(Router::new()).await;

    let err = client().status(&base, "unknown").await.unwrap_err();
    assert!(!err.is_transient(), "{err:?}");
    assert!(err.to_string().contains("404"), "{err}");
}
