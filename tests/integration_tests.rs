//! Integration tests: runs the workflow against a stub True API on an
//! ephemeral port, signing through a stub csptest script.
#![cfg(unix)]

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use signer::CspTestSigner;
use tempfile::TempDir;
use tokio::task;
use tokio::time::sleep;
use trueapi_submit::config::RetryPolicy;
use trueapi_submit::exchange::ReqwestExchange;
use trueapi_submit::{
    ErrorKind, Orchestrator, Step, WorkflowConfig, WorkflowFailure, WorkflowReport, WorkflowState,
};

const PREFIX: &str = "/api/v3/true-api";

#[derive(Clone, Copy)]
struct Scenario {
    challenge_status: u16,
    challenge_delay: Duration,
    submit_status: u16,
    submit_body: &'static str,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            challenge_status: 200,
            challenge_delay: Duration::ZERO,
            submit_status: 200,
            submit_body: "doc-123\n",
        }
    }
}

#[derive(Default)]
struct Hits {
    key: AtomicUsize,
    sign_in: AtomicUsize,
    create: AtomicUsize,
    info: AtomicUsize,
}

#[derive(Debug, Clone)]
struct Captured {
    query: HashMap<String, String>,
    authorization: Option<String>,
    body: String,
}

#[derive(Clone)]
struct StubApi {
    scenario: Scenario,
    hits: Arc<Hits>,
    sign_in_bodies: Arc<Mutex<Vec<String>>>,
    submissions: Arc<Mutex<Vec<Captured>>>,
    info_auth: Arc<Mutex<Vec<Option<String>>>>,
}

impl StubApi {
    fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            hits: Arc::default(),
            sign_in_bodies: Arc::default(),
            submissions: Arc::default(),
            info_auth: Arc::default(),
        }
    }

    fn hits(&self) -> [usize; 4] {
        [
            self.hits.key.load(Ordering::SeqCst),
            self.hits.sign_in.load(Ordering::SeqCst),
            self.hits.create.load(Ordering::SeqCst),
            self.hits.info.load(Ordering::SeqCst),
        ]
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

async fn auth_key(State(api): State<StubApi>) -> (StatusCode, String) {
    api.hits.key.fetch_add(1, Ordering::SeqCst);
    sleep(api.scenario.challenge_delay).await;
    if api.scenario.challenge_status != 200 {
        return (status(api.scenario.challenge_status), "service unavailable".into());
    }
    (StatusCode::OK, r#"{"uuid":"u1","data":"d1"}"#.into())
}

async fn sign_in(State(api): State<StubApi>, body: String) -> (StatusCode, String) {
    api.hits.sign_in.fetch_add(1, Ordering::SeqCst);
    api.sign_in_bodies.lock().unwrap().push(body);
    (StatusCode::OK, r#"{"token":"tok1"}"#.into())
}

async fn create(
    State(api): State<StubApi>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    api.hits.create.fetch_add(1, Ordering::SeqCst);
    api.submissions.lock().unwrap().push(Captured {
        query,
        authorization: bearer(&headers),
        body,
    });
    (
        status(api.scenario.submit_status),
        api.scenario.submit_body.to_string(),
    )
}

async fn info(
    State(api): State<StubApi>,
    UrlPath(uid): UrlPath<String>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    api.hits.info.fetch_add(1, Ordering::SeqCst);
    api.info_auth.lock().unwrap().push(bearer(&headers));
    if uid != "doc-123" {
        return (StatusCode::NOT_FOUND, r#"{"error_message":"no such document"}"#.into());
    }
    (StatusCode::OK, r#"{"status":"PROCESSING"}"#.into())
}

async fn spawn_stub(api: StubApi) -> SocketAddr {
    let app = Router::new()
        .route(&format!("{PREFIX}/auth/key"), get(auth_key))
        .route(&format!("{PREFIX}/auth/simpleSignIn"), post(sign_in))
        .route(&format!("{PREFIX}/lk/documents/create"), post(create))
        .route(&format!("{PREFIX}/doc/:uid/info"), get(info))
        .with_state(api);

    // Bind to an ephemeral port (0)
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    task::spawn(async move {
        axum::serve(listener, app)
            .await
            .unwrap_or_else(|e| eprintln!("Stub server error: {}", e));
    });

    // Give the server a moment to start up
    sleep(Duration::from_millis(50)).await;
    addr
}

/// A csptest stand-in run through `/bin/sh`. Each call appends the
/// certificate serial to `calls.log`.
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(signer_body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let script = format!(
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    -in) IN="$2"; shift ;;
    -out) OUT="$2"; shift ;;
    -my) CERT="$2"; shift ;;
  esac
  shift
done
echo "$CERT" >> "{log}"
{signer_body}
"#,
            log = dir.path().join("calls.log").display()
        );
        fs::write(dir.path().join("csptest.sh"), script).unwrap();
        fs::write(
            dir.path().join("receipt.json"),
            "{\n  \"inn\": \"7700000000\",\n  \"products\": [ {\"cis\": \"010461\"} ]\n}\n",
        )
        .unwrap();
        Self { dir }
    }

    fn echoing() -> Self {
        Self::new(
            r#"if [ "$(cat "$IN")" = "d1" ]; then
  printf 'c2ln\nbmVk\n' > "$OUT"
else
  printf 'ZG9j\nc2lnbg==\n' > "$OUT"
fi"#,
        )
    }

    fn signer(&self) -> CspTestSigner {
        CspTestSigner::new("/bin/sh").with_mode_args([
            self.dir.path().join("csptest.sh").into_os_string(),
            "-sfsign".into(),
            "-sign".into(),
        ])
    }

    fn document(&self) -> PathBuf {
        self.dir.path().join("receipt.json")
    }

    fn signer_calls(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("calls.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

fn config(addr: SocketAddr, fixture: &Fixture) -> WorkflowConfig {
    WorkflowConfig::new(
        format!("http://{addr}{PREFIX}"),
        "0a1b2c",
        "LK_RECEIPT",
        fixture.document(),
    )
}

async fn run(
    config: WorkflowConfig,
    signer: CspTestSigner,
) -> Result<WorkflowReport, WorkflowFailure> {
    run_with_timeout(config, signer, Duration::from_secs(10)).await
}

/// The blocking client must neither be created nor dropped on a runtime thread.
async fn run_with_timeout(
    config: WorkflowConfig,
    signer: CspTestSigner,
    timeout: Duration,
) -> Result<WorkflowReport, WorkflowFailure> {
    task::spawn_blocking(move || {
        let http = ReqwestExchange::new(Some(timeout)).unwrap();
        Orchestrator::new(config, http, signer).run()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_with_status_poll() {
    let api = StubApi::new(Scenario::default());
    let addr = spawn_stub(api.clone()).await;
    let fixture = Fixture::echoing();
    let cfg = config(addr, &fixture)
        .with_tenant("7700000000")
        .with_status_poll(Duration::from_millis(50));

    let report = run(cfg, fixture.signer()).await.unwrap();

    assert_eq!(report.final_state, WorkflowState::StatusChecked);
    assert_eq!(report.doc_uid, "doc-123");
    let status = report.status.as_ref().unwrap();
    assert_eq!(status.status_code, 200);
    assert_eq!(status.body, r#"{"status":"PROCESSING"}"#);
    assert_eq!(api.hits(), [1, 1, 1, 1]);
    assert_eq!(fixture.signer_calls(), ["0a1b2c", "0a1b2c"]);

    let sign_in: serde_json::Value =
        serde_json::from_str(&api.sign_in_bodies.lock().unwrap()[0]).unwrap();
    assert_eq!(
        sign_in,
        serde_json::json!({"uuid": "u1", "data": "c2lnbmVk", "inn": "7700000000"})
    );

    let submission = api.submissions.lock().unwrap()[0].clone();
    assert_eq!(submission.query.get("pg").map(String::as_str), Some("petfood"));
    assert_eq!(submission.authorization.as_deref(), Some("Bearer tok1"));
    let body: serde_json::Value = serde_json::from_str(&submission.body).unwrap();
    assert_eq!(body["document_format"], "MANUAL");
    assert_eq!(body["type"], "LK_RECEIPT");
    assert_eq!(body["signature"], "ZG9jc2lnbg==");

    assert_eq!(
        api.info_auth.lock().unwrap().as_slice(),
        [Some("Bearer tok1".to_string())]
    );

    // the report is what --json prints
    let printed = serde_json::to_value(&report).unwrap();
    assert_eq!(printed["final_state"], "StatusChecked");
    assert_eq!(printed["status"]["status_code"], 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_challenge_failure_stops_all_downstream_calls() {
    let api = StubApi::new(Scenario {
        challenge_status: 500,
        ..Default::default()
    });
    let addr = spawn_stub(api.clone()).await;
    let fixture = Fixture::echoing();
    let cfg = config(addr, &fixture).with_status_poll(Duration::from_millis(1));

    let failure = run(cfg, fixture.signer()).await.unwrap_err();

    assert_eq!(failure.reached, WorkflowState::Init);
    assert_eq!(failure.kind(), ErrorKind::Transport);
    assert_eq!(failure.error.status(), Some(500));
    assert_eq!(api.hits(), [1, 0, 0, 0]);
    assert!(fixture.signer_calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_submission_reports_server_message() {
    let api = StubApi::new(Scenario {
        submit_status: 422,
        submit_body: r#"{"error_message":"invalid format"}"#,
        ..Default::default()
    });
    let addr = spawn_stub(api.clone()).await;
    let fixture = Fixture::echoing();
    let cfg = config(addr, &fixture).with_status_poll(Duration::from_millis(1));

    let failure = run(cfg, fixture.signer()).await.unwrap_err();

    assert_eq!(failure.reached, WorkflowState::DocumentSigned);
    assert_eq!(failure.error.step(), Step::Submit);
    assert_eq!(failure.error.server_message(), Some("invalid format"));
    assert_eq!(api.hits(), [1, 1, 1, 0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signer_rejection_stops_before_sign_in() {
    let api = StubApi::new(Scenario::default());
    let addr = spawn_stub(api.clone()).await;
    let fixture = Fixture::new(
        r#"echo "Error: certificate $CERT not found" >&2
exit 1"#,
    );

    let failure = run(config(addr, &fixture), fixture.signer())
        .await
        .unwrap_err();

    assert_eq!(failure.reached, WorkflowState::ChallengeFetched);
    assert_eq!(failure.kind(), ErrorKind::Signer);
    assert!(
        failure
            .to_string()
            .contains("Error: certificate 0a1b2c not found")
    );
    assert_eq!(api.hits(), [1, 0, 0, 0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_service_is_connection_error() {
    // Grab a free port, then close it again.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fixture = Fixture::echoing();
    let cfg = config(addr, &fixture).with_retry(RetryPolicy {
        get_attempts: 2,
        backoff: Duration::from_millis(5),
    });

    let failure = run(cfg, fixture.signer()).await.unwrap_err();

    assert_eq!(failure.reached, WorkflowState::Init);
    assert_eq!(failure.kind(), ErrorKind::Connection);
    assert_eq!(failure.error.step(), Step::FetchChallenge);
    assert!(fixture.signer_calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_timeout_is_connection_error() {
    let api = StubApi::new(Scenario {
        challenge_delay: Duration::from_secs(3),
        ..Default::default()
    });
    let addr = spawn_stub(api.clone()).await;
    let fixture = Fixture::echoing();

    let failure = run_with_timeout(
        config(addr, &fixture),
        fixture.signer(),
        Duration::from_millis(200),
    )
    .await
    .unwrap_err();

    assert_eq!(failure.reached, WorkflowState::Init);
    assert_eq!(failure.kind(), ErrorKind::Connection);
    assert_eq!(failure.error.step(), Step::FetchChallenge);
    assert_eq!(api.hits(), [1, 0, 0, 0]);
    assert!(fixture.signer_calls().is_empty());
}
