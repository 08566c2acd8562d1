//! Executor proxy over HTTP, driven through `ExecutorClient`.

use execq::client::ExecutorClient;
use execq::engine::{Backoff, RetryPolicy};
use execq::error::Error;
use execq::model::{Lease, NewRecord, State};
use execq::proxy::{ExecutorProxy, QueueHandle, QueueRegistry};
use execq::store::{ExecutorStore, MemoryExecutorStore, MemoryStore, Store};
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "executor-s3cret";

struct TestProxy {
    base_url: String,
    store: Arc<MemoryStore>,
    executors: Arc<MemoryExecutorStore>,
    shutdown: CancellationToken,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestProxy {
    fn client(&self, token: &str, executor: &str) -> ExecutorClient {
        ExecutorClient::new(&self.base_url, SecretString::from(token), executor).unwrap()
    }
}

async fn start_proxy(max_retries: u32) -> TestProxy {
    let store = Arc::new(MemoryStore::new("codeintel"));
    let mut registry = QueueRegistry::new();
    registry
        .register(QueueHandle::new(store.clone(), SecretString::from(TOKEN)))
        .unwrap();

    let retry = RetryPolicy {
        max_retries,
        backoff: Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_secs(1),
            jitter: 0.0,
        },
    };
    let executors = Arc::new(MemoryExecutorStore::new());
    let proxy = Arc::new(ExecutorProxy::new(
        Arc::new(registry),
        retry,
        executors.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(execq::proxy::http::serve(listener, proxy, shutdown.clone()));

    TestProxy {
        base_url,
        store,
        executors,
        shutdown,
    }
}

#[tokio::test]
async fn healthz_responds() {
    let proxy = start_proxy(3).await;
    let resp = reqwest::get(format!("{}/healthz", proxy.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn dequeue_heartbeat_complete() {
    let proxy = start_proxy(3).await;
    let id = proxy
        .store
        .enqueue(NewRecord::new(json!({ "repo": "github.com/a/b" })))
        .await
        .unwrap()
        .id;
    let client = proxy.client(TOKEN, "executor-1");

    let job = client.dequeue("codeintel").await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.queue, "codeintel");
    assert_eq!(job.attempt, 1);
    assert_eq!(job.payload, json!({ "repo": "github.com/a/b" }));

    let record = proxy.store.get(id).await.unwrap();
    assert_eq!(record.state, State::Processing);
    assert_eq!(record.worker_hostname.as_deref(), Some("executor-1"));
    assert_eq!(record.claim_token.as_deref(), Some(job.token.as_str()));

    let lease = job.lease();
    let report = client.heartbeat("codeintel", &[lease.clone()]).await.unwrap();
    assert_eq!(report.known, vec![id]);
    assert!(report.canceled.is_empty());

    client.mark_complete("codeintel", &lease).await.unwrap();
    // Retried completion is accepted without change.
    client.mark_complete("codeintel", &lease).await.unwrap();
    assert_eq!(proxy.store.get(id).await.unwrap().state, State::Completed);

    // Nothing left to hand out.
    assert!(client.dequeue("codeintel").await.unwrap().is_none());
}

#[tokio::test]
async fn bad_token_is_rejected_without_mutation() {
    let proxy = start_proxy(3).await;
    let id = proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;

    let client = proxy.client("wrong", "executor-1");
    assert!(matches!(
        client.dequeue("codeintel").await,
        Err(Error::Unauthorized)
    ));
    assert_eq!(proxy.store.get(id).await.unwrap().state, State::Queued);
}

#[tokio::test]
async fn unknown_queue_is_not_found() {
    let proxy = start_proxy(3).await;
    let client = proxy.client(TOKEN, "executor-1");
    assert!(matches!(
        client.dequeue("insights").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn errored_job_is_retried_until_limit() {
    let proxy = start_proxy(1).await;
    let id = proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let client = proxy.client(TOKEN, "executor-1");

    let first = client.dequeue("codeintel").await.unwrap().unwrap();
    client.mark_errored("codeintel", &first.lease(), "oom").await.unwrap();
    let record = proxy.store.get(id).await.unwrap();
    assert_eq!(record.state, State::Errored);
    assert!(record.process_after.is_some());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = client.dequeue("codeintel").await.unwrap().unwrap();
    assert_eq!(job.attempt, 2);

    client
        .mark_errored("codeintel", &job.lease(), "oom again")
        .await
        .unwrap();
    let record = proxy.store.get(id).await.unwrap();
    assert_eq!(record.state, State::Failed);
    assert_eq!(record.num_failures, 2);
    assert_eq!(record.failure_message.as_deref(), Some("oom again"));
}

#[tokio::test]
async fn other_executor_cannot_report_outcome() {
    let proxy = start_proxy(3).await;
    let id = proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;

    let owner = proxy.client(TOKEN, "executor-1");
    let intruder = proxy.client(TOKEN, "executor-2");
    let job = owner.dequeue("codeintel").await.unwrap().unwrap();

    // Knowing the id is not enough without the claim token.
    let guessed = Lease {
        id,
        token: Lease::mint_token(),
    };
    assert!(matches!(
        intruder.mark_complete("codeintel", &guessed).await,
        Err(Error::OwnershipLost { .. })
    ));
    let report = intruder.heartbeat("codeintel", &[guessed]).await.unwrap();
    assert!(report.known.is_empty());

    owner
        .mark_failed("codeintel", &job.lease(), "gave up")
        .await
        .unwrap();
    assert_eq!(proxy.store.get(id).await.unwrap().state, State::Failed);
}

#[tokio::test]
async fn heartbeat_reports_canceled_jobs() {
    let proxy = start_proxy(3).await;
    let id = proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let client = proxy.client(TOKEN, "executor-1");

    let job = client.dequeue("codeintel").await.unwrap().unwrap();
    proxy.store.cancel(id).await.unwrap();

    let report = client.heartbeat("codeintel", &[job.lease()]).await.unwrap();
    assert!(report.known.is_empty());
    assert_eq!(report.canceled, vec![id]);
}

#[tokio::test]
async fn stale_job_from_same_executor_is_rejected_after_reset() {
    let proxy = start_proxy(3).await;
    let id = proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let client = proxy.client(TOKEN, "executor-1");

    let stale = client.dequeue("codeintel").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    proxy
        .store
        .requeue_stalled(Duration::from_millis(5))
        .await
        .unwrap();
    let fresh = client.dequeue("codeintel").await.unwrap().unwrap();
    assert_eq!(fresh.id, id);
    assert_ne!(fresh.token, stale.token);

    let report = client.heartbeat("codeintel", &[stale.lease()]).await.unwrap();
    assert!(report.known.is_empty());
    assert!(report.canceled.is_empty());
    assert!(matches!(
        client.mark_complete("codeintel", &stale.lease()).await,
        Err(Error::OwnershipLost { .. })
    ));
    assert_eq!(proxy.store.get(id).await.unwrap().state, State::Processing);

    client.mark_complete("codeintel", &fresh.lease()).await.unwrap();
    assert_eq!(proxy.store.get(id).await.unwrap().state, State::Completed);
}

#[tokio::test]
async fn malformed_body_is_a_json_bad_request() {
    let proxy = start_proxy(3).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/queue/codeintel/heartbeat", proxy.base_url))
        .bearer_auth(TOKEN)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(r#"{"executor_name": "executor-1", "jobs": [1, 2]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
    assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));

    let resp = reqwest::Client::new()
        .post(format!("{}/queue/codeintel/dequeue", proxy.base_url))
        .bearer_auth(TOKEN)
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn dequeue_and_heartbeat_register_the_executor() {
    let proxy = start_proxy(3).await;
    proxy.store.enqueue(NewRecord::new(json!({}))).await.unwrap();
    let client = proxy.client(TOKEN, "executor-7");

    assert!(proxy.executors.list_executors().await.unwrap().is_empty());
    let job = client.dequeue("codeintel").await.unwrap().unwrap();

    let seen = proxy.executors.list_executors().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "executor-7");
    assert_eq!(seen[0].queue, "codeintel");
    let first_seen = seen[0].last_seen_at;

    tokio::time::sleep(Duration::from_millis(5)).await;
    client.heartbeat("codeintel", &[job.lease()]).await.unwrap();
    let seen = proxy.executors.list_executors().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].last_seen_at > first_seen);

    // Rejected requests never register anyone.
    proxy
        .client("wrong", "intruder")
        .dequeue("codeintel")
        .await
        .unwrap_err();
    assert_eq!(proxy.executors.list_executors().await.unwrap().len(), 1);
}
