//! Handwritten test doubles shared across the crate's unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::FetchError;
use crate::request::FetchResponse;
use crate::stats::{Statistics, StatsSink};
use crate::traits::{Notice, Transport};

/// One scripted transport reply. `final_url: None` echoes the requested
/// URL (no redirect evidence).
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub final_url: Option<String>,
    pub body: String,
}

/// Transport double that replays a script of responses, then falls back
/// to a plain 200 with a default body.
///
/// Counts fetches and tracks the high-water mark of simultaneous calls,
/// which is how concurrency-ceiling tests observe admission.
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<Result<MockResponse, FetchError>>>>,
    default_body: String,
    delay: Duration,
    fetch_count: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Transport that answers every fetch with a 200 carrying `body`.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_body: body.into(),
            delay: Duration::ZERO,
            fetch_count: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Transport that consumes `script` in order, then falls back to an
    /// empty 200.
    pub fn with_script(script: Vec<Result<MockResponse, FetchError>>) -> Self {
        let transport = Self::ok("");
        *transport.script.lock().unwrap() = script.into();
        transport
    }

    /// Hold each fetch open for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            Some(Ok(response)) => Ok(FetchResponse {
                status: response.status,
                final_url: response.final_url.unwrap_or_else(|| url.to_string()),
                body: response.body,
            }),
            Some(Err(err)) => Err(err),
            None => Ok(FetchResponse {
                status: 200,
                final_url: url.to_string(),
                body: self.default_body.clone(),
            }),
        }
    }
}

/// Notice double that counts invocations.
#[derive(Debug, Default, Clone)]
pub struct CollectingNotice {
    count: Arc<AtomicUsize>,
}

impl CollectingNotice {
    pub fn count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }
}

impl Notice for CollectingNotice {
    fn reauthentication_required(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink double that records every published snapshot.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    snapshots: Arc<Mutex<Vec<Statistics>>>,
}

impl CollectingSink {
    pub fn snapshots(&self) -> Arc<Mutex<Vec<Statistics>>> {
        Arc::clone(&self.snapshots)
    }
}

impl StatsSink for CollectingSink {
    fn publish(&self, stats: &Statistics) {
        self.snapshots.lock().unwrap().push(*stats);
    }
}
