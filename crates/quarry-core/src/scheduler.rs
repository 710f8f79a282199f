//! Priority scheduler: bounds live concurrency, admits tasks in priority
//! order, and shuts itself down once all submitted work has drained.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::SchedulerConfig;
use crate::error::{ConvertError, FetchError};
use crate::heap::BinaryHeap;
use crate::request::{Event, FetchResponse, FetchResult, Outcome, Request};
use crate::stats::{Statistics, StatsSink};
use crate::traits::{KvStore, Notice, Transport, TracingNotice};
use crate::urls::normalize_url;

/// One unit of schedulable work. Immutable once enqueued; owned by the
/// priority queue until popped, then by the running set. The action has
/// already accounted for its own outcome by the time it resolves.
struct Task {
    priority: String,
    action: BoxFuture<'static, ()>,
}

fn task_priority(task: &Task) -> String {
    task.priority.clone()
}

type TaskHeap = BinaryHeap<Task, String, fn(&Task) -> String>;

/// One-way scheduler lifecycle.
///
/// `Active` accepts and admits work. `Draining` (after [`Scheduler::abort`])
/// lets in-flight tasks finish but admits nothing. `Closed` is terminal;
/// submissions fail with [`FetchError::SchedulerClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Draining,
    Closed,
}

struct QueueState {
    heap: TaskHeap,
    running: usize,
    completed: u64,
    errors: u64,
    lifecycle: Lifecycle,
}

struct Inner<S: KvStore, X: Transport> {
    config: SchedulerConfig,
    cache: Cache<S>,
    transport: X,
    overlay: Option<Arc<HashMap<String, String>>>,
    notice: Arc<dyn Notice>,
    queue: Mutex<QueueState>,
    signin_warned: AtomicBool,
    shutdown: CancellationToken,
}

/// Priority fetch scheduler for one scraping session.
///
/// Cheap to clone (all clones share one session). Generic over the cache
/// backend and the transport so tests can inject both.
pub struct Scheduler<S: KvStore, X: Transport> {
    inner: Arc<Inner<S, X>>,
}

impl<S: KvStore, X: Transport> Clone for Scheduler<S, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for the optional collaborators of a [`Scheduler`].
pub struct SchedulerBuilder<S: KvStore, X: Transport> {
    cache: Cache<S>,
    transport: X,
    config: SchedulerConfig,
    overlay: Option<Arc<HashMap<String, String>>>,
    notice: Arc<dyn Notice>,
}

impl<S, X> SchedulerBuilder<S, X>
where
    S: KvStore + 'static,
    X: Transport + 'static,
{
    /// Substitute a static URL -> body map for live network I/O.
    ///
    /// Requests whose normalized URL appears in the map take the OVERLAID
    /// path: a synthetic 200 response that still flows through response
    /// classification and conversion.
    pub fn with_overlay(mut self, overlay: HashMap<String, String>) -> Self {
        self.overlay = Some(Arc::new(overlay));
        self
    }

    pub fn with_notice(mut self, notice: impl Notice + 'static) -> Self {
        self.notice = Arc::new(notice);
        self
    }

    pub fn build(self) -> Scheduler<S, X> {
        tracing::info!(
            site = %self.config.site,
            concurrency = self.config.concurrency,
            "constructing scheduler"
        );
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                cache: self.cache,
                transport: self.transport,
                overlay: self.overlay,
                notice: self.notice,
                queue: Mutex::new(QueueState {
                    heap: BinaryHeap::new(task_priority as fn(&Task) -> String),
                    running: 0,
                    completed: 0,
                    errors: 0,
                    lifecycle: Lifecycle::Active,
                }),
                signin_warned: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl<S, X> Scheduler<S, X>
where
    S: KvStore + 'static,
    X: Transport + 'static,
{
    pub fn new(cache: Cache<S>, transport: X, config: SchedulerConfig) -> Self {
        Self::builder(cache, transport, config).build()
    }

    pub fn builder(cache: Cache<S>, transport: X, config: SchedulerConfig) -> SchedulerBuilder<S, X> {
        SchedulerBuilder {
            cache,
            transport,
            config,
            overlay: None,
            notice: Arc::new(TracingNotice),
        }
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.queue.lock().unwrap().lifecycle
    }

    /// Snapshot of the progress counters.
    pub fn statistics(&self) -> Statistics {
        let queue = self.inner.queue.lock().unwrap();
        Statistics {
            queued: queue.heap.size(),
            running: queue.running,
            completed: queue.completed,
            errors: queue.errors,
            cache_hits: self.inner.cache.hit_count(),
        }
    }

    /// Submit a raw task at the given priority (lower sorts first,
    /// compared lexicographically).
    pub fn schedule<F>(&self, priority: &str, action: F) -> Result<(), FetchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_live() {
            return Err(FetchError::SchedulerClosed);
        }
        let recorder = self.clone();
        self.enqueue(Task {
            priority: priority.to_string(),
            action: Box::pin(async move {
                action.await;
                recorder.record(Outcome::Success);
            }),
        });
        Ok(())
    }

    /// Submit a fetch and await its converted result.
    ///
    /// The single entry point for all scraping logic: normalizes the URL,
    /// wraps it in a request state machine, enqueues it at `priority`, and
    /// settles with the converted value (via cache or network) or the
    /// error that terminated the request.
    pub async fn schedule_fetch<T, C>(
        &self,
        url: &str,
        convert: C,
        priority: &str,
        nocache: bool,
        label: &str,
    ) -> Result<FetchResult<T>, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        C: FnOnce(&FetchResponse) -> Result<T, ConvertError> + Send + 'static,
    {
        if !self.is_live() {
            return Err(FetchError::SchedulerClosed);
        }
        let normalized = normalize_url(url, &self.inner.config.site);
        let (mut request, receiver) = Request::new(normalized, convert, nocache, label);
        request.transition(Event::Enqueue);

        let recorder = self.clone();
        let action = Box::pin(request.drive(
            self.inner.cache.clone(),
            self.inner.transport.clone(),
            self.inner.overlay.clone(),
            self.inner.config.request_timeout,
            move |outcome| recorder.record(outcome),
        ));
        // Queued before control returns to the caller: a settled waiter
        // that chains the next fetch gets it on the heap ahead of the
        // deferred idle check, so chained work is never abandoned.
        self.enqueue(Task {
            priority: priority.to_string(),
            action,
        });

        receiver.await.map_err(|_| FetchError::SchedulerClosed)?
    }

    /// Irreversibly stop admitting work. In-flight tasks finish; queued
    /// tasks are dropped when the scheduler closes, and their waiters
    /// observe [`FetchError::SchedulerClosed`].
    pub fn abort(&self) {
        let mut queue = self.inner.queue.lock().unwrap();
        match queue.lifecycle {
            Lifecycle::Closed => return,
            _ if queue.running > 0 => {
                tracing::info!("scheduler aborted, draining in-flight tasks");
                queue.lifecycle = Lifecycle::Draining;
            }
            _ => {
                tracing::info!("scheduler aborted");
                Self::close(&mut queue);
                drop(queue);
                self.inner.shutdown.cancel();
            }
        }
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
    }

    /// Spawn a task that publishes statistics to `sink` every
    /// `stats_interval` until the scheduler closes, then publishes one
    /// final snapshot.
    pub fn publish_statistics<K>(&self, sink: K)
    where
        K: StatsSink + 'static,
    {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.inner.config.stats_interval);
            loop {
                tokio::select! {
                    () = scheduler.inner.shutdown.cancelled() => {
                        sink.publish(&scheduler.statistics());
                        break;
                    }
                    _ = interval.tick() => {
                        sink.publish(&scheduler.statistics());
                    }
                }
            }
        });
    }

    fn enqueue(&self, task: Task) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.lifecycle != Lifecycle::Active {
                tracing::warn!("task enqueued after shutdown, dropping");
                return;
            }
            queue.heap.push(task);
        }
        self.pump();
    }

    /// Admit tasks while a concurrency slot is free and work is queued.
    fn pump(&self) {
        loop {
            let task = {
                let mut queue = self.inner.queue.lock().unwrap();
                if queue.lifecycle != Lifecycle::Active
                    || queue.running >= self.inner.config.concurrency
                {
                    break;
                }
                match queue.heap.pop() {
                    Some(task) => {
                        queue.running += 1;
                        task
                    }
                    None => break,
                }
            };
            let scheduler = self.clone();
            tokio::spawn(async move {
                task.action.await;
                // Release the slot one tick late: the waiter this task just
                // settled may be about to enqueue a follow-up, and must not
                // be mistaken for terminal idleness.
                tokio::task::yield_now().await;
                scheduler.release();
            });
        }
    }

    /// Account for a finished task. Runs before the task's waiter can
    /// observe the settlement, so counters and the reauthentication
    /// notice are never behind the result the waiter sees.
    fn record(&self, outcome: Outcome) {
        let needs_reauth = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.completed += 1;
            match outcome {
                Outcome::Error { needs_reauth } => {
                    queue.errors += 1;
                    needs_reauth
                }
                Outcome::Success | Outcome::CacheHit => false,
            }
        };
        if needs_reauth && !self.inner.signin_warned.swap(true, Ordering::SeqCst) {
            self.inner.notice.reauthentication_required();
        }
    }

    /// Give a concurrency slot back and re-judge admission and idleness.
    fn release(&self) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.running -= 1;
        }
        self.pump();
        self.check_done();
    }

    /// Idle shutdown: nothing queued, nothing running, and at least one
    /// completion. The `completed > 0` guard keeps a freshly built,
    /// momentarily empty scheduler from being mistaken for done.
    fn check_done(&self) {
        let closed = {
            let mut queue = self.inner.queue.lock().unwrap();
            let drained = match queue.lifecycle {
                Lifecycle::Active => {
                    queue.heap.is_empty() && queue.running == 0 && queue.completed > 0
                }
                Lifecycle::Draining => queue.running == 0,
                Lifecycle::Closed => false,
            };
            if drained {
                Self::close(&mut queue);
            }
            drained
        };
        if closed {
            self.inner.shutdown.cancel();
            tracing::info!("scheduler drained, shutting down");
        }
    }

    fn close(queue: &mut QueueState) {
        queue.lifecycle = Lifecycle::Closed;
        // Drop any still-queued tasks so their waiters settle.
        while queue.heap.pop().is_some() {}
    }
}
