//! Integration tests for the HTTP API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt; // for .collect().await
use plotq_rs::device::command::DeviceCommand;
use plotq_rs::device::DeviceController;
use plotq_rs::file_manager::FileManager;
use plotq_rs::host::PlotterHost;
use plotq_rs::queue::QueueManager;
use plotq_rs::store::InMemoryJobStore;
use plotq_rs::web::{create_router, AppState, AppStateInner};
use plotq_shared::JobParameters;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt; // for `oneshot`

const BOUNDARY: &str = "plotq-test-boundary";

struct TestApp {
    router: Router,
    state: AppState,
    _dir: TempDir,
}

fn test_app(api_key: Option<&str>, max_queue_size: usize, max_upload_bytes: usize) -> TestApp {
    let dir = tempdir().unwrap();
    let files = FileManager::new(dir.path());
    let queue = QueueManager::new(Arc::new(InMemoryJobStore::new()), files.clone());
    let command = DeviceCommand::new("sh", vec!["-c".to_string(), "exec sleep 30".to_string(), "plotter".to_string()]);
    let device = DeviceController::new(command, "AxiDraw");
    let host = Arc::new(PlotterHost::new(queue, device));
    let state = Arc::new(AppStateInner {
        host,
        files,
        api_key: api_key.map(str::to_string),
        max_queue_size,
        max_upload_bytes,
        rate_limiter: None,
    });
    TestApp {
        router: create_router(state.clone(), "/api"),
        state,
        _dir: dir,
    }
}

fn default_app() -> TestApp {
    test_app(None, 10, 1024 * 1024)
}

fn multipart_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    if let Some((filename, content)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: image/svg+xml\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn submit_request(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(multipart_body(file, fields)))
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

const SVG: &[u8] = b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>";

#[tokio::test]
async fn submit_returns_job_and_position() {
    let app = default_app();
    let (status, json) = send(&app, submit_request(Some(("cat.svg", SVG)), &[("speed", "40")])).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["status"], "queued");
    assert_eq!(json["position"], 1);
    let id = json["job_id"].as_str().unwrap().to_string();

    let (status, json) = send(&app, submit_request(Some(("cat.svg", SVG)), &[])).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["position"], 2);

    let (status, job) = send(&app, request("GET", &format!("/api/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["filename"], "cat.svg");
    assert_eq!(job["parameters"]["speed"], 40);
    assert_eq!(job["position"], 1);
    assert_eq!(job["progress"], 0);
}

#[tokio::test]
async fn duplicate_names_are_stored_separately() {
    let app = default_app();
    send(&app, submit_request(Some(("cat.svg", SVG)), &[])).await;
    let (_, json) = send(&app, submit_request(Some(("cat.svg", SVG)), &[])).await;
    let id = json["job_id"].as_str().unwrap();
    let (job, _) = app.state.host.job(id).await.unwrap();
    assert_eq!(job.filename, "cat_1.svg");
    assert!(job.filepath.exists());
}

#[tokio::test]
async fn submit_rejects_non_svg_files() {
    let app = default_app();
    let (status, json) = send(&app, submit_request(Some(("notes.txt", b"hello")), &[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Only SVG files are supported");
}

#[tokio::test]
async fn submit_rejects_missing_file_and_bad_parameters() {
    let app = default_app();
    let (status, _) = send(&app, submit_request(None, &[("speed", "40")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, submit_request(Some(("a.svg", SVG)), &[("speed", "0")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, submit_request(Some(("a.svg", SVG)), &[("speed", "fast")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, submit_request(Some(("a.svg", SVG)), &[("layers", "1;rm -rf")])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(app.state.host.queue().queue_size().await.unwrap(), 0);
}

#[tokio::test]
async fn submit_rejects_oversized_files() {
    let app = test_app(None, 10, 16);
    let big = vec![b'x'; 100];
    let (status, _) = send(&app, submit_request(Some(("big.svg", &big)), &[])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn submit_rejects_when_queue_is_full() {
    let app = test_app(None, 1, 1024);
    let (status, _) = send(&app, submit_request(Some(("a.svg", SVG)), &[])).await;
    assert_eq!(status, StatusCode::OK);
    let (status, json) = send(&app, submit_request(Some(("b.svg", SVG)), &[])).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"], "Queue is full (max 1 jobs)");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_never_exceed_the_queue_limit() {
    let app = test_app(None, 3, 1024);
    let mut handles = Vec::new();
    for i in 0..10 {
        let router = app.router.clone();
        let name = format!("{i}.svg");
        handles.push(tokio::spawn(async move {
            let req = submit_request(Some((name.as_str(), SVG)), &[]);
            router.oneshot(req).await.unwrap().status()
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => accepted += 1,
            status => assert_eq!(status, StatusCode::TOO_MANY_REQUESTS),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(app.state.host.queue().queue_size().await.unwrap(), 3);

    // rejected uploads do not leave files behind
    let stored = std::fs::read_dir(app.state.files.uploads_dir()).unwrap().count();
    assert_eq!(stored, 3);
}

#[tokio::test]
async fn list_filters_by_status_and_limit() {
    let app = default_app();
    let (_, first) = send(&app, submit_request(Some(("1.svg", SVG)), &[])).await;
    send(&app, submit_request(Some(("2.svg", SVG)), &[])).await;
    send(&app, submit_request(Some(("3.svg", SVG)), &[])).await;
    let first = first["job_id"].as_str().unwrap();
    let (status, _) = send(&app, request("POST", &format!("/api/jobs/{first}/cancel"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, all) = send(&app, request("GET", "/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 3);
    assert_eq!(all[0]["filename"], "3.svg");

    let (_, queued) = send(&app, request("GET", "/api/jobs?status=queued")).await;
    let queued = queued.as_array().unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|j| j["status"] == "queued" && j["position"].is_number()));

    let (_, cancelled) = send(&app, request("GET", "/api/jobs?status=cancelled")).await;
    assert_eq!(cancelled[0]["job_id"], first);
    assert!(cancelled[0]["position"].is_null());

    let (_, limited) = send(&app, request("GET", "/api/jobs?limit=1")).await;
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = default_app();
    for (method, uri) in [
        ("GET", "/api/jobs/missing"),
        ("DELETE", "/api/jobs/missing"),
        ("POST", "/api/jobs/missing/cancel"),
    ] {
        let (status, json) = send(&app, request(method, uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }
}

#[tokio::test]
async fn cancel_and_delete_a_queued_job() {
    let app = default_app();
    let (_, json) = send(&app, submit_request(Some(("a.svg", SVG)), &[])).await;
    let id = json["job_id"].as_str().unwrap().to_string();
    let (job, _) = app.state.host.job(&id).await.unwrap();

    let (status, json) = send(&app, request("POST", &format!("/api/jobs/{id}/cancel"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], format!("Job {id} cancelled"));

    let (status, _) = send(&app, request("POST", &format!("/api/jobs/{id}/cancel"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(&app, request("DELETE", &format!("/api/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], format!("Job {id} deleted"));
    assert!(!job.filepath.exists());

    let (status, _) = send(&app, request("GET", &format!("/api/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plotter_endpoints_on_an_idle_device() {
    let app = default_app();
    let (status, json) = send(&app, request("GET", "/api/plotter/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "idle");
    assert!(json["current_job"].is_null());

    for uri in ["/api/plotter/pause", "/api/plotter/resume", "/api/plotter/cancel"] {
        let (status, _) = send(&app, request("POST", uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[cfg(unix)]
#[tokio::test]
async fn busy_device_pause_is_not_implemented_and_cancel_stops_it() {
    let app = default_app();
    let (_, json) = send(&app, submit_request(Some(("a.svg", SVG)), &[])).await;
    let id = json["job_id"].as_str().unwrap().to_string();
    let dispatch = app.state.host.dispatch_next().await.unwrap().unwrap();
    assert_eq!(dispatch.job.id, id);
    let run = tokio::spawn(dispatch.run.wait());

    let (_, status_json) = send(&app, request("GET", "/api/plotter/status")).await;
    assert_eq!(status_json["state"], "busy");
    assert_eq!(status_json["current_job"], id.as_str());

    let (status, json) = send(&app, request("POST", "/api/plotter/pause")).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(json["error"], "Pause not implemented");

    let (status, _) = send(&app, request("DELETE", &format!("/api/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(&app, request("POST", "/api/plotter/cancel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], format!("Job {id} cancelled"));
    assert_eq!(run.await.unwrap(), plotq_shared::RunOutcome::Cancelled);

    let (_, job) = send(&app, request("GET", &format!("/api/jobs/{id}"))).await;
    assert_eq!(job["status"], "cancelled");
}

#[tokio::test]
async fn health_reports_service_state() {
    let app = default_app();
    app.state
        .host
        .submit("a.svg", "/tmp/a.svg", JobParameters::default())
        .await
        .unwrap();
    let (status, json) = send(&app, request("GET", "/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["queue_size"], 1);
    assert_eq!(json["plotter_connected"], false);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn api_key_guards_everything_but_health() {
    let app = test_app(Some("s3cret"), 10, 1024);

    let (status, json) = send(&app, request("GET", "/api/jobs")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Invalid or missing API key. Provide X-API-Key header.");

    let wrong = Request::builder()
        .uri("/api/plotter/status")
        .header("X-API-Key", "nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::FORBIDDEN);

    let right = Request::builder()
        .uri("/api/jobs")
        .header("X-API-Key", "s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, right).await.0, StatusCode::OK);

    let (status, _) = send(&app, request("GET", "/api/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn routes_live_under_the_prefix() {
    let app = default_app();
    let (status, _) = send(&app, request("GET", "/health")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
