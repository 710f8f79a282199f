//! Lifecycle of one fetch request.
//!
//! ```text
//! NEW -> ENQUEUED -> DEQUEUED -> { SENT | CACHE_HIT | OVERLAID }
//! SENT -> { RESPONDED | TIMED_OUT | FAILED }
//! OVERLAID -> { RESPONDED | FAILED }
//! RESPONDED -> CONVERTED -> { CACHED -> SUCCESS | SUCCESS }
//! CACHE_HIT -> SUCCESS
//! RESPONDED | CONVERTED -> FAILED
//! ```
//!
//! Transitions only move forward; exactly one of RESPONDED / CACHE_HIT /
//! FAILED / TIMED_OUT is reached before a request terminates. The
//! transition table is a pure function so it can be tested without a
//! runtime or network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::{ConvertError, FetchError};
use crate::traits::{KvStore, Transport};

/// Raw response handed to converters; produced by a [`Transport`] or
/// synthesized from an overlay map.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

/// Successful settlement envelope: the converted value plus the
/// normalized URL it was fetched for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<T> {
    pub query: String,
    pub result: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Enqueued,
    Dequeued,
    Sent,
    CacheHit,
    Overlaid,
    Responded,
    TimedOut,
    Failed,
    Converted,
    Cached,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Enqueue,
    Dequeue,
    Send,
    HitCache,
    Overlay,
    Respond,
    Timeout,
    Fail,
    Convert,
    WriteBack,
    Succeed,
}

/// The legal transition graph. Returns `None` for transitions the
/// lifecycle does not allow.
pub fn next_state(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;
    match (state, event) {
        (New, Enqueue) => Some(Enqueued),
        (Enqueued, Dequeue) => Some(Dequeued),
        (Dequeued, Send) => Some(Sent),
        (Dequeued, HitCache) => Some(CacheHit),
        (Dequeued, Overlay) => Some(Overlaid),
        (Sent, Respond) | (Overlaid, Respond) => Some(Responded),
        (Sent, Timeout) => Some(TimedOut),
        (Sent, Fail) | (Overlaid, Fail) | (Responded, Fail) | (Converted, Fail) => Some(Failed),
        (Responded, Convert) => Some(Converted),
        (Converted, WriteBack) => Some(Cached),
        (Cached, Succeed) | (Converted, Succeed) | (CacheHit, Succeed) => Some(Success),
        _ => None,
    }
}

/// How a driven request ended, as the scheduler's counters see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    CacheHit,
    Error { needs_reauth: bool },
}

type Converter<T> = Box<dyn FnOnce(&FetchResponse) -> Result<T, ConvertError> + Send>;
type ResultSender<T> = oneshot::Sender<Result<FetchResult<T>, FetchError>>;

/// One fetch attempt, from construction through settlement.
pub struct Request<T> {
    id: Uuid,
    url: String,
    nocache: bool,
    label: String,
    state: State,
    convert: Option<Converter<T>>,
    sender: Option<ResultSender<T>>,
}

impl<T> Request<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a NEW request around an already-normalized URL.
    pub(crate) fn new<C>(
        url: String,
        convert: C,
        nocache: bool,
        label: &str,
    ) -> (Self, oneshot::Receiver<Result<FetchResult<T>, FetchError>>)
    where
        C: FnOnce(&FetchResponse) -> Result<T, ConvertError> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            url,
            nocache,
            label: label.to_string(),
            state: State::New,
            convert: Some(Box::new(convert)),
            sender: Some(sender),
        };
        tracing::debug!(id = %request.id, url = %request.url, label = %request.label, "request NEW");
        (request, receiver)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn transition(&mut self, event: Event) {
        match next_state(self.state, event) {
            Some(next) => {
                tracing::debug!(
                    id = %self.id,
                    url = %self.url,
                    from = ?self.state,
                    to = ?next,
                    "request transition"
                );
                self.state = next;
            }
            None => {
                debug_assert!(false, "illegal transition {:?} on {:?}", event, self.state);
                tracing::error!(
                    id = %self.id,
                    url = %self.url,
                    state = ?self.state,
                    event = ?event,
                    "illegal request transition ignored"
                );
            }
        }
    }

    /// Settle the result channel. Taking the sender makes a second
    /// settlement unrepresentable; a dropped receiver is logged, never an
    /// error.
    fn settle(&mut self, outcome: Result<FetchResult<T>, FetchError>) {
        match self.sender.take() {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    tracing::debug!(id = %self.id, url = %self.url, "result receiver dropped before settlement");
                }
            }
            None => {
                tracing::error!(id = %self.id, url = %self.url, "request settled twice");
            }
        }
    }

    /// Drive this request from DEQUEUED to a terminal state.
    ///
    /// `record` receives the outcome before the result channel settles,
    /// so a waiter that observes the settlement never reads counters that
    /// have not yet been updated for it.
    pub(crate) async fn drive<S, X, R>(
        mut self,
        cache: Cache<S>,
        transport: X,
        overlay: Option<Arc<HashMap<String, String>>>,
        deadline: Duration,
        record: R,
    ) where
        S: KvStore,
        X: Transport,
        R: FnOnce(Outcome) + Send,
    {
        self.transition(Event::Dequeue);

        if !self.nocache {
            if let Some(value) = cache.get::<T>(&self.url).await {
                self.transition(Event::HitCache);
                let query = self.url.clone();
                record(Outcome::CacheHit);
                self.settle(Ok(FetchResult {
                    query,
                    result: value,
                }));
                self.transition(Event::Succeed);
                return;
            }
        }

        let response = match overlay.as_ref().and_then(|map| map.get(&self.url)) {
            Some(body) => {
                self.transition(Event::Overlay);
                FetchResponse {
                    status: 200,
                    final_url: self.url.clone(),
                    body: body.clone(),
                }
            }
            None => {
                self.transition(Event::Send);
                match tokio::time::timeout(deadline, transport.fetch(&self.url)).await {
                    Err(_elapsed) => {
                        self.transition(Event::Timeout);
                        tracing::warn!(url = %self.url, label = %self.label, "timed out while fetching");
                        record(Outcome::Error {
                            needs_reauth: false,
                        });
                        self.settle(Err(FetchError::Timeout(deadline.as_secs())));
                        return;
                    }
                    Ok(Err(err)) => {
                        self.transition(Event::Fail);
                        tracing::warn!(url = %self.url, label = %self.label, error = %err, "fetch failed");
                        record(Outcome::Error {
                            needs_reauth: err.needs_reauthentication(),
                        });
                        self.settle(Err(err));
                        return;
                    }
                    Ok(Ok(response)) => response,
                }
            }
        };

        if let Err(err) = classify_response(&response, &self.url) {
            self.transition(Event::Fail);
            tracing::warn!(url = %self.url, label = %self.label, error = %err, "unusable response");
            record(Outcome::Error {
                needs_reauth: err.needs_reauthentication(),
            });
            self.settle(Err(err));
            return;
        }
        self.transition(Event::Respond);

        // Converter errors must never propagate past the request.
        let convert = self
            .convert
            .take()
            .unwrap_or_else(|| unreachable!("converter consumed before RESPONDED"));
        let value = match convert(&response) {
            Ok(value) => value,
            Err(err) => {
                self.transition(Event::Fail);
                tracing::warn!(url = %self.url, label = %self.label, error = %err, "response conversion failed");
                let conversion = FetchError::Conversion {
                    url: self.url.clone(),
                    message: err.to_string(),
                };
                record(Outcome::Error {
                    needs_reauth: false,
                });
                self.settle(Err(conversion));
                return;
            }
        };
        self.transition(Event::Convert);

        if !self.nocache {
            cache.set(&self.url, &value).await;
            self.transition(Event::WriteBack);
        }

        let query = self.url.clone();
        record(Outcome::Success);
        self.settle(Ok(FetchResult {
            query,
            result: value,
        }));
        self.transition(Event::Succeed);
    }
}

/// Judge a transport response before conversion.
///
/// Order matters: a followed redirect chain lands on a 200 sign-in page,
/// so redirect evidence is checked before the status code.
fn classify_response(response: &FetchResponse, url: &str) -> Result<(), FetchError> {
    let redirected = response.final_url != url;
    if response.status == 310 || (response.status == 0 && redirected) {
        return Err(FetchError::TooManyRedirects(url.to_string()));
    }
    if response.final_url.contains("/ap/signin") || (redirected && response.final_url.contains("signin"))
    {
        return Err(FetchError::SigninRedirect(url.to_string()));
    }
    if response.status != 200 {
        return Err(FetchError::Http {
            status: response.status,
            url: url.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_network_path_is_legal() {
        let path = [
            (State::New, Event::Enqueue, State::Enqueued),
            (State::Enqueued, Event::Dequeue, State::Dequeued),
            (State::Dequeued, Event::Send, State::Sent),
            (State::Sent, Event::Respond, State::Responded),
            (State::Responded, Event::Convert, State::Converted),
            (State::Converted, Event::WriteBack, State::Cached),
            (State::Cached, Event::Succeed, State::Success),
        ];
        for (from, event, to) in path {
            assert_eq!(next_state(from, event), Some(to));
        }
    }

    #[test]
    fn cache_hit_short_circuits() {
        assert_eq!(
            next_state(State::Dequeued, Event::HitCache),
            Some(State::CacheHit)
        );
        assert_eq!(
            next_state(State::CacheHit, Event::Succeed),
            Some(State::Success)
        );
    }

    #[test]
    fn nocache_path_skips_writeback() {
        assert_eq!(
            next_state(State::Converted, Event::Succeed),
            Some(State::Success)
        );
    }

    #[test]
    fn overlay_behaves_like_sent() {
        assert_eq!(
            next_state(State::Dequeued, Event::Overlay),
            Some(State::Overlaid)
        );
        assert_eq!(
            next_state(State::Overlaid, Event::Respond),
            Some(State::Responded)
        );
        assert_eq!(next_state(State::Overlaid, Event::Fail), Some(State::Failed));
        // Overlays never time out: there is no pending network wait.
        assert_eq!(next_state(State::Overlaid, Event::Timeout), None);
    }

    #[test]
    fn no_transition_re_enters_an_earlier_state() {
        assert_eq!(next_state(State::Success, Event::Enqueue), None);
        assert_eq!(next_state(State::Failed, Event::Send), None);
        assert_eq!(next_state(State::TimedOut, Event::Respond), None);
        assert_eq!(next_state(State::Sent, Event::Dequeue), None);
        assert_eq!(next_state(State::Cached, Event::Convert), None);
    }

    #[test]
    fn conversion_failure_is_legal_from_responded_and_converted() {
        assert_eq!(next_state(State::Responded, Event::Fail), Some(State::Failed));
        assert_eq!(next_state(State::Converted, Event::Fail), Some(State::Failed));
    }

    fn response(status: u16, final_url: &str) -> FetchResponse {
        FetchResponse {
            status,
            final_url: final_url.to_string(),
            body: String::new(),
        }
    }

    const URL: &str = "https://www.example.com/orders";

    #[test]
    fn classify_accepts_plain_200() {
        assert!(classify_response(&response(200, URL), URL).is_ok());
    }

    #[test]
    fn classify_rejects_non_200() {
        let err = classify_response(&response(404, URL), URL).unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 404, .. }));
        let err = classify_response(&response(500, URL), URL).unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 500, .. }));
    }

    #[test]
    fn classify_detects_signin_redirect_even_with_status_200() {
        let err = classify_response(
            &response(200, "https://www.example.com/ap/signin?openid=1"),
            URL,
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::SigninRedirect(_)));
    }

    #[test]
    fn classify_detects_redirect_storms() {
        let err = classify_response(&response(310, URL), URL).unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects(_)));

        // Status 0 alone is not enough; redirect evidence is required.
        let err = classify_response(&response(0, "https://elsewhere.example.com/"), URL).unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects(_)));
        let err = classify_response(&response(0, URL), URL).unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 0, .. }));
    }
}
