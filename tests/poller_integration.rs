//! End-to-end tests for the adaptive poller against a live provider stub.
//!
//! A tiny Axum server plays the provider registration page; the poller
//! probes it for real over HTTP, writes detection-log entries, and
//! dispatches a recording executor when the page flips to open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::{Router, extract::State, routing::get};
use chrono::{Duration, Utc};
use uuid::Uuid;

use campclerk::classifier::SignalClassifier;
use campclerk::db::{Database, LibSqlBackend};
use campclerk::executor::{AttemptExecutor, ExecutorError};
use campclerk::plan::{DetectionSignal, PlanStatus, RegistrationPlan};
use campclerk::poller::Poller;
use campclerk::window::QuarterSeasonFallback;

#[derive(Default)]
struct RecordingExecutor {
    launches: AtomicU32,
}

#[async_trait]
impl AttemptExecutor for RecordingExecutor {
    async fn launch(&self, _plan_id: Uuid, _session_id: Uuid) -> Result<(), ExecutorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(
        &self,
        _session_id: Uuid,
        _checkpoint: Option<campclerk::checkpoint::Checkpoint>,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }
}

type SharedBody = Arc<std::sync::RwLock<String>>;

async fn page_handler(State(body): State<SharedBody>) -> String {
    body.read().expect("lock").clone()
}

/// Serve a mutable provider page on a random port.
async fn start_provider_stub(initial: &str) -> Option<(SocketAddr, SharedBody)> {
    let body: SharedBody = Arc::new(std::sync::RwLock::new(initial.to_string()));
    let app = Router::new()
        .route("/signup", get(page_handler))
        .with_state(body.clone());

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.to_string().contains("Operation not permitted") => return None,
        Err(e) => panic!("Failed to bind provider stub: {e}"),
    };
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some((addr, body))
}

async fn harness() -> (Arc<dyn Database>, Arc<RecordingExecutor>, Poller) {
    let backend = LibSqlBackend::new_memory().await.expect("memory db");
    backend.run_migrations().await.expect("migrations");
    let db: Arc<dyn Database> = Arc::new(backend);
    let executor = Arc::new(RecordingExecutor::default());
    let poller = Poller::new(
        db.clone(),
        SignalClassifier::new(StdDuration::from_secs(2)).expect("classifier"),
        executor.clone(),
        Arc::new(QuarterSeasonFallback),
    );
    (db, executor, poller)
}

fn plan_for(url: String) -> RegistrationPlan {
    let mut plan = RegistrationPlan::new("u1", "camp-42");
    plan.detection_url = Some(url);
    // Window is imminent so the tightest tier applies.
    plan.manual_open_at = Some(Utc::now() + Duration::minutes(30));
    plan
}

#[tokio::test]
async fn closed_page_logs_and_does_not_dispatch() {
    let Some((addr, _body)) = start_provider_stub("Registration closed for 2026.").await else {
        return;
    };
    let (db, executor, poller) = harness().await;
    let plan = plan_for(format!("http://{}/signup", addr));
    db.create_plan(&plan).await.expect("create");

    let summary = poller.tick(Utc::now()).await.expect("tick");
    assert_eq!(summary.probed, 1);
    assert_eq!(summary.opens, 0);
    assert_eq!(executor.launches.load(Ordering::SeqCst), 0);

    let latest = db
        .latest_detection(plan.id)
        .await
        .expect("query")
        .expect("entry");
    assert_eq!(latest.signal, DetectionSignal::ClosedDetected);

    // Plan stays active and keeps being watched.
    let stored = db.get_plan(plan.id).await.expect("query").expect("found");
    assert_eq!(stored.status, PlanStatus::Active);
}

#[tokio::test]
async fn staleness_guard_skips_recent_probes() {
    let Some((addr, _body)) = start_provider_stub("Nothing yet.").await else {
        return;
    };
    let (db, _executor, poller) = harness().await;
    let plan = plan_for(format!("http://{}/signup", addr));
    db.create_plan(&plan).await.expect("create");

    let now = Utc::now();
    let first = poller.tick(now).await.expect("tick");
    assert_eq!(first.probed, 1);

    // Same instant: the 1-minute tier interval has not elapsed.
    let second = poller.tick(now + Duration::seconds(30)).await.expect("tick");
    assert_eq!(second.probed, 0);
    assert_eq!(second.skipped, 1);

    // A minute later the guard reopens.
    let third = poller.tick(now + Duration::seconds(61)).await.expect("tick");
    assert_eq!(third.probed, 1);

    assert_eq!(db.list_detections(plan.id, 10).await.expect("list").len(), 2);
}

#[tokio::test]
async fn open_page_dispatches_once_and_retires_the_plan() {
    let Some((addr, body)) = start_provider_stub("Coming soon.").await else {
        return;
    };
    let (db, executor, poller) = harness().await;
    let plan = plan_for(format!("http://{}/signup", addr));
    db.create_plan(&plan).await.expect("create");

    let now = Utc::now();
    poller.tick(now).await.expect("tick");
    assert_eq!(executor.launches.load(Ordering::SeqCst), 0);

    // The page flips open.
    *body.write().expect("lock") = "<h1>Camp 2026</h1><a>Register Now</a>".to_string();

    let summary = poller
        .tick(now + Duration::minutes(2))
        .await
        .expect("tick");
    assert_eq!(summary.opens, 1);
    assert_eq!(executor.launches.load(Ordering::SeqCst), 1);

    let stored = db.get_plan(plan.id).await.expect("query").expect("found");
    assert_eq!(stored.status, PlanStatus::Done);

    // Retired plans leave the poll set entirely.
    let after = poller
        .tick(now + Duration::minutes(4))
        .await
        .expect("tick");
    assert_eq!(after.examined, 0);
    assert_eq!(executor.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_failure_logs_error_not_closed() {
    let (db, executor, poller) = harness().await;
    // Unroutable port: the probe fails at the transport layer.
    let plan = plan_for("http://127.0.0.1:1/signup".to_string());
    db.create_plan(&plan).await.expect("create");

    let summary = poller.tick(Utc::now()).await.expect("tick");
    assert_eq!(summary.probed, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(executor.launches.load(Ordering::SeqCst), 0);

    let latest = db
        .latest_detection(plan.id)
        .await
        .expect("query")
        .expect("entry");
    assert_eq!(latest.signal, DetectionSignal::Error);

    // The error entry still arms the staleness guard.
    let skipped = poller.tick(Utc::now()).await.expect("tick");
    assert_eq!(skipped.skipped, 1);
}
