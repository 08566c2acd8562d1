//! Store contract tests against the in-memory store.

use execq::engine::Resetter;
use execq::error::Error;
use execq::model::{ClaimFilter, Lease, NewRecord, State};
use execq::store::{MemoryStore, Store};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Claim the next record as `worker` and return its lease.
async fn claim_lease(store: &dyn Store, worker: &str) -> Lease {
    store
        .claim(worker, &ClaimFilter::any())
        .await
        .unwrap()
        .and_then(|r| r.lease())
        .expect("a claimable record")
}

#[tokio::test]
async fn concurrent_claims_never_share_a_record() {
    let store = Arc::new(MemoryStore::new("exclusive"));
    for i in 0..100 {
        store.enqueue(NewRecord::new(json!({ "n": i }))).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(record) = store.claim(&worker, &ClaimFilter::any()).await.unwrap() {
                assert_eq!(record.worker_hostname.as_deref(), Some(worker.as_str()));
                claimed.push(record.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "record {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(store.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn stalled_record_is_reset_exactly_once() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new("recovery"));
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;

    // A worker claims the record and then dies without heartbeating.
    store.claim("crashed", &ClaimFilter::any()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let resetter = Resetter::new(
        Arc::clone(&store),
        Duration::from_millis(5),
        Duration::from_millis(10),
    );
    assert_eq!(resetter.run_once().await.unwrap(), vec![id]);
    assert!(resetter.run_once().await.unwrap().is_empty());

    let record = store.get(id).await.unwrap();
    assert_eq!(record.state, State::Queued);
    assert_eq!(record.num_resets, 1);
    assert_eq!(record.worker_hostname, None);
    assert_eq!(record.last_heartbeat_at, None);

    let reclaimed = store.claim("healthy", &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.num_resets, 1);
}

#[tokio::test]
async fn heartbeating_record_is_not_reset() {
    let store = MemoryStore::new("alive");
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let lease = claim_lease(&store, "w1").await;
    assert_eq!(lease.id, id);

    store.heartbeat(&lease).await.unwrap();
    let reset = store.requeue_stalled(Duration::from_secs(60)).await.unwrap();
    assert!(reset.is_empty());
    assert_eq!(store.get(id).await.unwrap().state, State::Processing);
}

#[tokio::test]
async fn completion_is_idempotent() {
    let store = MemoryStore::new("idempotent");
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let lease = claim_lease(&store, "w1").await;

    assert!(store.mark_complete(&lease).await.unwrap());
    let first = store.get(id).await.unwrap();

    assert!(!store.mark_complete(&lease).await.unwrap());
    let second = store.get(id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.state, State::Completed);

    // Any other lease still cannot touch it.
    let other = Lease {
        id,
        token: Lease::mint_token(),
    };
    assert!(matches!(
        store.mark_complete(&other).await,
        Err(Error::OwnershipLost { .. })
    ));
}

#[tokio::test]
async fn reset_invalidates_previous_owner() {
    let store = MemoryStore::new("ownership");
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let old = claim_lease(&store, "old").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.requeue_stalled(Duration::from_millis(5)).await.unwrap();
    let before = store.get(id).await.unwrap();
    assert_eq!(before.claim_token, None);

    assert!(matches!(
        store.heartbeat(&old).await,
        Err(Error::OwnershipLost { .. })
    ));
    assert!(matches!(
        store.mark_complete(&old).await,
        Err(Error::OwnershipLost { .. })
    ));
    assert!(matches!(
        store.mark_errored(&old, "late", chrono::Utc::now()).await,
        Err(Error::OwnershipLost { .. })
    ));
    assert_eq!(store.get(id).await.unwrap(), before);

    // Once re-claimed, the old owner's report is rejected as well.
    let new = claim_lease(&store, "new").await;
    assert!(matches!(
        store.mark_failed(&old, "late").await,
        Err(Error::OwnershipLost { .. })
    ));
    assert!(store.mark_complete(&new).await.unwrap());
}

#[tokio::test]
async fn reclaim_by_same_identity_rejects_stale_lease() {
    let store = MemoryStore::new("same-identity");
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;

    let stale = claim_lease(&store, "executor-1").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        store.requeue_stalled(Duration::from_millis(5)).await.unwrap(),
        vec![id]
    );

    // The same worker name claims the record again.
    let fresh = claim_lease(&store, "executor-1").await;
    assert_eq!(fresh.id, id);
    assert_ne!(fresh.token, stale.token);

    assert!(matches!(
        store.heartbeat(&stale).await,
        Err(Error::OwnershipLost { .. })
    ));
    let report = store.heartbeat_many(&[stale.clone(), fresh.clone()]).await.unwrap();
    assert_eq!(report.known, vec![id]);
    assert!(matches!(
        store.mark_complete(&stale).await,
        Err(Error::OwnershipLost { .. })
    ));
    assert_eq!(store.get(id).await.unwrap().state, State::Processing);

    assert!(store.mark_complete(&fresh).await.unwrap());
    // The stale lease cannot pass for a retried completion either.
    assert!(matches!(
        store.mark_complete(&stale).await,
        Err(Error::OwnershipLost { .. })
    ));
}

#[tokio::test]
async fn errored_record_is_reclaimed_after_process_after() {
    let store = MemoryStore::new("retry");
    let id = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let first = claim_lease(&store, "w1").await;

    let later = chrono::Utc::now() + chrono::Duration::milliseconds(30);
    store.mark_errored(&first, "boom", later).await.unwrap();

    let record = store.get(id).await.unwrap();
    assert_eq!(record.state, State::Errored);
    assert_eq!(record.num_failures, 1);
    assert_eq!(record.failure_message.as_deref(), Some("boom"));
    assert!(store.claim("w1", &ClaimFilter::any()).await.unwrap().is_none());
    assert_eq!(store.depth().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let again = store.claim("w2", &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.state, State::Processing);
    assert_eq!(again.num_failures, 1);

    store.mark_complete(&again.lease().unwrap()).await.unwrap();
    assert_eq!(store.get(id).await.unwrap().failure_message, None);
}

#[tokio::test]
async fn canceled_records_are_reported_and_never_claimed() {
    let store = MemoryStore::new("cancel");
    let queued = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;
    let running = store.enqueue(NewRecord::new(json!({}))).await.unwrap().id;

    assert!(store.cancel(queued).await.unwrap());
    let claimed = store.claim("w1", &ClaimFilter::any()).await.unwrap().unwrap();
    assert_eq!(claimed.id, running);

    assert!(store.cancel(running).await.unwrap());
    assert!(!store.cancel(running).await.unwrap());

    let lease = claimed.lease().unwrap();
    let report = store.heartbeat_many(&[lease]).await.unwrap();
    assert!(report.known.is_empty());
    assert_eq!(report.canceled, vec![running]);
    assert!(store.claim("w1", &ClaimFilter::any()).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_by_state() {
    let store = MemoryStore::new("list");
    for i in 0..3 {
        store.enqueue(NewRecord::new(json!({ "n": i }))).await.unwrap();
    }
    store.claim("w1", &ClaimFilter::any()).await.unwrap().unwrap();

    assert_eq!(store.list(None, 10).await.unwrap().len(), 3);
    assert_eq!(store.list(Some(State::Queued), 10).await.unwrap().len(), 2);
    assert_eq!(store.list(Some(State::Processing), 10).await.unwrap().len(), 1);
    assert_eq!(store.list(None, 2).await.unwrap().len(), 2);
}
