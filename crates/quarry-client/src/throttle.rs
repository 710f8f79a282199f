//! Per-origin spacing for polite fetching.
//!
//! The scheduler bounds how many fetches are live at once, but six
//! simultaneous requests against one authenticated site is still a good
//! way to get rate-limited or signed out mid-scrape. Wrapping the
//! transport spaces consecutive requests to the same origin by a
//! configurable minimum, with optional jitter so the cadence does not
//! look mechanical.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry_core::error::FetchError;
use quarry_core::request::FetchResponse;
use quarry_core::traits::Transport;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum spacing between consecutive requests to one origin.
    pub delay: Duration,

    /// Upper bound of the random extra spacing (uniform in `[0, jitter]`).
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn is_disabled(&self) -> bool {
        self.delay.is_zero() && self.jitter.is_zero()
    }

    fn spacing(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        self.delay + Duration::from_millis(jitter_ms(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    /// 1 second spacing, 500ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

/// [`Transport`] wrapper that reserves a send slot per origin.
///
/// Each origin maps to the earliest instant the next request may go out.
/// A fetch holds the lock only long enough to claim or read that slot,
/// sleeps outside it, and re-checks, so tasks contending for one origin
/// line up one spacing apart instead of stampeding when the slot opens.
#[derive(Clone)]
pub struct ThrottledTransport<X> {
    inner: X,
    config: ThrottleConfig,
    next_send: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<X: Transport> ThrottledTransport<X> {
    pub fn new(inner: X, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            next_send: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The bucket the spacing applies to. Unparseable and opaque URLs
    /// share the `"null"` bucket rather than bypassing the throttle.
    fn origin_of(url: &str) -> String {
        Url::parse(url)
            .map(|parsed| parsed.origin().ascii_serialization())
            .unwrap_or_else(|_| "null".to_string())
    }

    async fn reserve(&self, origin: &str) {
        loop {
            let wait = {
                let mut slots = self.next_send.lock().await;
                let now = Instant::now();
                match slots.get(origin) {
                    Some(&next) if next > now => next - now,
                    _ => {
                        slots.insert(origin.to_string(), now + self.config.spacing());
                        return;
                    }
                }
            };
            tracing::debug!(origin = %origin, wait_ms = %wait.as_millis(), "spacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

impl<X: Transport> Transport for ThrottledTransport<X> {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        if !self.config.is_disabled() {
            self.reserve(&Self::origin_of(url)).await;
        }
        self.inner.fetch(url).await
    }
}

// Cadence noise, not randomness anything relies on; a clock-seeded
// xorshift keeps the `rand` crate out of the dependency tree.
fn jitter_ms(bound_ms: u64) -> u64 {
    if bound_ms == 0 {
        return 0;
    }
    let seed = std::time::UNIX_EPOCH
        .elapsed()
        .map(|since| since.subsec_nanos() as u64 ^ since.as_secs())
        .unwrap_or(0x9E37_79B9);
    let mut x = seed | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % bound_ms
}
