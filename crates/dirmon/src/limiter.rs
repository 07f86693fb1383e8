//! Bounded-concurrency task queue
//!
//! Tasks are admitted in submission order and at most `max_count` of them
//! run at once. Completing a task (by success, error, or panic) releases its
//! slot and admits the next queued one, so the queue drains itself without
//! any caller polling it.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::trace;

/// Default concurrency cap for bulk operations
pub const DEFAULT_MAX_COUNT: usize = 5;

/// Limiter configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of tasks running at once (values below 1 are raised to 1)
    pub max_count: usize,
    /// Delay before each admitted task starts running. Debugging aid for
    /// watching a bulk scan in slow motion.
    #[serde(default, with = "millis_opt")]
    pub dispatch_delay: Option<Duration>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            dispatch_delay: None,
        }
    }
}

impl LimiterConfig {
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            ..Self::default()
        }
    }
}

/// Observability signals from the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Admission was attempted while every slot was taken.
    Throttling { queued: usize, in_flight: usize },
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("task panicked or was dropped before completing")]
    Aborted,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedJob {
    seq: u64,
    job: Job,
}

struct State {
    in_flight: usize,
    queue: VecDeque<QueuedJob>,
    next_seq: u64,
    /// Sequence numbers submitted but not yet completed
    outstanding: BTreeSet<u64>,
}

struct Shared {
    max_count: usize,
    dispatch_delay: Option<Duration>,
    state: Mutex<State>,
    events: broadcast::Sender<LimiterEvent>,
    /// Every task with a sequence number below this value has completed.
    low_water: watch::Sender<u64>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit the head of the queue if a slot is free.
    fn dispatch(shared: &Arc<Shared>) {
        let next = {
            let mut state = shared.lock_state();
            if state.in_flight >= shared.max_count {
                let event = LimiterEvent::Throttling {
                    queued: state.queue.len(),
                    in_flight: state.in_flight,
                };
                drop(state);
                trace!(?event, "throttling");
                let _ = shared.events.send(event);
                return;
            }
            match state.queue.pop_front() {
                Some(next) => {
                    state.in_flight += 1;
                    next
                }
                None => return,
            }
        };

        let guard = CompletionGuard {
            shared: Arc::clone(shared),
            seq: next.seq,
        };
        let delay = shared.dispatch_delay;
        tokio::spawn(async move {
            let _guard = guard;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            (next.job)().await;
        });
    }
}

/// Releases a slot when the task future finishes or is dropped.
struct CompletionGuard {
    shared: Arc<Shared>,
    seq: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.outstanding.remove(&self.seq);
            let low = state
                .outstanding
                .iter()
                .next()
                .copied()
                .unwrap_or(state.next_seq);
            self.shared.low_water.send_replace(low);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            Shared::dispatch(&self.shared);
        }
    }
}

/// Future for the outcome of one submitted task.
#[must_use = "dropping the handle does not cancel the task, but its result is lost"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| LimiterError::Aborted))
    }
}

/// Bounded-concurrency FIFO task queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct TaskLimiter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("TaskLimiter")
            .field("max_count", &self.shared.max_count)
            .field("in_flight", &state.in_flight)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Default for TaskLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

impl TaskLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        let (low_water, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                max_count: config.max_count.max(1),
                dispatch_delay: config.dispatch_delay,
                state: Mutex::new(State {
                    in_flight: 0,
                    queue: VecDeque::new(),
                    next_seq: 0,
                    outstanding: BTreeSet::new(),
                }),
                events,
                low_water,
            }),
        }
    }

    pub fn with_max_count(max_count: usize) -> Self {
        Self::new(LimiterConfig::with_max_count(max_count))
    }

    /// Queue `task` and return a handle resolving to its output.
    ///
    /// Must be called from within a tokio runtime. The task starts as soon
    /// as a slot is free; errors it returns are delivered only to its own
    /// handle.
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let output = task().await;
                let _ = tx.send(output);
            })
        });

        {
            let mut state = self.shared.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.outstanding.insert(seq);
            state.queue.push_back(QueuedJob { seq, job });
        }
        Shared::dispatch(&self.shared);

        TaskHandle { rx }
    }

    /// Resolve once every task queued or running right now has completed.
    ///
    /// Tasks submitted after the call are not waited for.
    pub fn drain(&self) -> impl Future<Output = ()> + Send + 'static {
        let target = self.shared.lock_state().next_seq;
        let mut low_water = self.shared.low_water.subscribe();
        async move {
            let _ = low_water.wait_for(|low| *low >= target).await;
        }
    }

    /// Subscribe to throttling signals.
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.shared.events.subscribe()
    }

    pub fn max_count(&self) -> usize {
        self.shared.max_count
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock_state().in_flight
    }

    pub fn queued(&self) -> usize {
        self.shared.lock_state().queue.len()
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_peak_concurrency_bounded() {
        let limiter = TaskLimiter::with_max_count(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                let completed = completed.clone();
                limiter.submit(move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(values, (0..20).collect::<Vec<_>>());
        assert_eq!(completed.load(Ordering::SeqCst), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let limiter = TaskLimiter::with_max_count(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let order = order.clone();
                limiter.submit(move || async move {
                    order.lock().unwrap().push(i);
                    tokio::task::yield_now().await;
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_task_error_goes_to_its_own_handle() {
        let limiter = TaskLimiter::with_max_count(2);

        let failing = limiter.submit(|| async { Err::<u32, String>("boom".to_string()) });
        let passing = limiter.submit(|| async { Ok::<u32, String>(7) });

        assert_eq!(failing.await.unwrap(), Err("boom".to_string()));
        assert_eq!(passing.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let limiter = TaskLimiter::with_max_count(1);

        let panicked = limiter.submit(|| async {
            if true {
                panic!("task blew up");
            }
            0u32
        });
        let after = limiter.submit(|| async { 42 });

        assert_eq!(panicked.await, Err(LimiterError::Aborted));
        assert_eq!(after.await.unwrap(), 42);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_queued_tasks() {
        let limiter = TaskLimiter::with_max_count(2);
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let completed = completed.clone();
            let _ = limiter.submit(move || async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        limiter.drain().await;
        assert_eq!(completed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_drain_on_idle_limiter_resolves() {
        let limiter = TaskLimiter::default();
        limiter.drain().await;
        assert_eq!(limiter.max_count(), DEFAULT_MAX_COUNT);
    }

    #[tokio::test]
    async fn test_throttling_signal() {
        let limiter = TaskLimiter::with_max_count(1);
        let mut events = limiter.subscribe();

        let first = limiter.submit(|| async { tokio::task::yield_now().await });
        let second = limiter.submit(|| async {});

        match events.try_recv() {
            Ok(LimiterEvent::Throttling { queued, in_flight }) => {
                assert_eq!(queued, 1);
                assert_eq!(in_flight, 1);
            }
            other => panic!("expected throttling signal, got {:?}", other),
        }

        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_cap_is_raised_to_one() {
        let limiter = TaskLimiter::with_max_count(0);
        assert_eq!(limiter.max_count(), 1);
        assert_eq!(limiter.submit(|| async { "ran" }).await.unwrap(), "ran");
    }

    #[tokio::test]
    async fn test_dispatch_delay() {
        let limiter = TaskLimiter::new(LimiterConfig {
            max_count: 2,
            dispatch_delay: Some(Duration::from_millis(20)),
        });
        let start = std::time::Instant::now();
        limiter.submit(|| async {}).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
