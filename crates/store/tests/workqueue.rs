#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kfed_core::FedError;
use kfed_store::{retry, retry_on_conflict, spawn_workers, Backoff, Reconciler, Requeue, RetryPolicy, WorkQueue};

fn queue() -> WorkQueue { WorkQueue::new("test", Backoff::new(Duration::from_millis(5), Duration::from_millis(50))) }

#[tokio::test]
async fn duplicate_adds_collapse() {
    let q = queue();
    q.add("a");
    q.add("a");
    q.add("b");
    assert_eq!(q.len(), 2);
    assert_eq!(q.get().await.as_deref(), Some("a"));
    assert_eq!(q.get().await.as_deref(), Some("b"));
    assert!(q.is_empty());
}

#[tokio::test]
async fn key_readded_while_processing_waits_for_done() {
    let q = queue();
    q.add("a");
    let k = q.get().await.unwrap();
    q.add("a");
    // parked, not handed to a second worker
    assert_eq!(q.len(), 0);
    q.done(&k);
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await.as_deref(), Some("a"));
}

#[tokio::test]
async fn shutdown_wakes_waiters_with_none() {
    let q = queue();
    let waiter = {
        let q = q.clone();
        tokio::spawn(async move { q.get().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    q.shutdown();
    assert_eq!(waiter.await.unwrap(), None);
    q.add("late");
    assert!(q.is_empty());
}

#[tokio::test]
async fn rate_limited_keys_come_back_and_forget_resets() {
    let q = queue();
    q.add_rate_limited("a");
    q.add_rate_limited("a");
    assert_eq!(q.num_requeues("a"), 2);
    let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
    assert_eq!(got.as_deref(), Some("a"));
    q.forget("a");
    assert_eq!(q.num_requeues("a"), 0);
}

struct Counting {
    seen: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait::async_trait]
impl Reconciler for Counting {
    async fn reconcile(&self, _key: &str) -> Requeue {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Requeue::Done
    }
}

#[tokio::test]
async fn same_key_never_runs_concurrently() {
    let q = queue();
    let r = Arc::new(Counting { seen: AtomicUsize::new(0), in_flight: AtomicUsize::new(0), max_in_flight: AtomicUsize::new(0) });
    let handles = spawn_workers(&q, Arc::clone(&r), 4);
    for _ in 0..20 {
        q.add("only");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shutdown();
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(r.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(r.seen.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn retry_on_conflict_stops_after_policy() {
    let calls = AtomicUsize::new(0);
    let res: Result<(), FedError> = retry_on_conflict(RetryPolicy::once(), |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(FedError::Conflict("stale".into())) }
    })
    .await;
    assert!(res.unwrap_err().is_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_gives_up_on_non_retryable() {
    let calls = AtomicUsize::new(0);
    let res: Result<u32, FedError> = retry(RetryPolicy::default(), FedError::is_retryable, |attempt| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                Err(FedError::Transient("blip".into()))
            } else if attempt == 1 {
                Err(FedError::Config("broken".into()))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;
    assert!(matches!(res, Err(FedError::Config(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
