//! kfed store: keyed work queues, backoff, the bounded retry combinator and
//! the worker pool every controller runs on.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kfed_core::{FedError, FedResult};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(100), max: Duration::from_secs(300) } }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

/// Bounded retry policy for write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { attempts: 5, backoff: Backoff::new(Duration::from_millis(50), Duration::from_secs(5)) } }
}

impl RetryPolicy {
    /// One re-fetch-and-retry, no sleep in between.
    pub fn once() -> Self { Self { attempts: 2, backoff: Backoff::new(Duration::ZERO, Duration::ZERO) } }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the policy is exhausted.
/// `op` receives the zero-based attempt number.
pub async fn retry<T, F, Fut, P>(policy: RetryPolicy, mut should_retry: P, mut op: F) -> FedResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FedResult<T>>,
    P: FnMut(&FedError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < policy.attempts && should_retry(&e) => {
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, error = %e, delay_ms = %delay.as_millis(), "retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Optimistic-concurrency loop: retry only on conflicts.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, op: F) -> FedResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FedResult<T>>,
{
    retry(policy, FedError::is_conflict, op).await
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
}

/// Rate-limited work queue keyed by string.
///
/// A key is held at most once while queued; a key re-added while a worker is
/// processing it is parked and re-queued when that worker calls [`done`](Self::done),
/// so one key is never processed by two workers at once.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(name: &str, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Shared { name: name.to_string(), state: Mutex::new(QueueState::default()), notify: Notify::new(), backoff }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> { self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            return;
        }
        trace!(queue = %self.inner.name, key = %key, "enqueue");
        st.order.push_back(key);
        let depth = st.order.len();
        drop(st);
        counter!("workqueue_adds_total", 1u64, "queue" => self.inner.name.clone());
        gauge!("workqueue_depth", depth as f64, "queue" => self.inner.name.clone());
        self.inner.notify.notify_one();
    }

    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Re-add after the key's current exponential backoff and bump its failure count.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        self.add_after(key, self.inner.backoff.delay(attempt));
    }

    /// Reset the key's backoff.
    pub fn forget(&self, key: &str) { self.lock().failures.remove(key); }

    pub fn num_requeues(&self, key: &str) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Next key to process; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key from [`get`](Self::get) as finished.
    pub fn done(&self, key: &str) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.order.push_back(key.to_string());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out work; waiting workers wake up with `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// What to do with a key after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Done,
    /// Retry with the key's exponential backoff.
    Backoff,
    After(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> Requeue;
}

/// Spawn `workers` loops draining `queue` into `reconciler`. Loops exit when
/// the queue is shut down; the in-flight pass of each loop always completes.
pub fn spawn_workers<R: Reconciler + ?Sized>(queue: &WorkQueue, reconciler: Arc<R>, workers: usize) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|id| {
            let queue = queue.clone();
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    let outcome = reconciler.reconcile(&key).await;
                    match outcome {
                        Requeue::Done => queue.forget(&key),
                        Requeue::Backoff => queue.add_rate_limited(key.clone()),
                        Requeue::After(d) => {
                            queue.forget(&key);
                            queue.add_after(key.clone(), d);
                        }
                    }
                    queue.done(&key);
                }
                debug!(queue = %queue.name(), worker = id, "worker stopped");
            })
        })
        .collect()
}
