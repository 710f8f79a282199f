use thiserror::Error;

/// Boxed error returned by caller-supplied response converters.
pub type ConvertError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that settle an individual fetch request, plus the one error
/// (`SchedulerClosed`) returned directly from submission.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Network-level failure: unreachable host, aborted connection.
    #[error("network error: {0}")]
    Network(String),

    /// Unusable HTTP response (non-200, 404 included).
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },

    /// The response's final URL indicates a sign-in redirect, so the
    /// authenticated session has probably lapsed.
    #[error("sign-in redirect while fetching {0}")]
    SigninRedirect(String),

    /// HTTP 310, or status 0 with redirect evidence.
    #[error("too many redirects while fetching {0}")]
    TooManyRedirects(String),

    /// Fixed per-request deadline exceeded.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// The caller-supplied response converter failed.
    #[error("conversion failed for {url}: {message}")]
    Conversion { url: String, message: String },

    /// Submission attempted after shutdown or abort.
    #[error("scheduler has shut down and cannot accept more requests")]
    SchedulerClosed,
}

impl FetchError {
    /// Returns true if this error signals a broken/expired authenticated
    /// session and the user should be prompted to sign in again.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(
            self,
            FetchError::SigninRedirect(_) | FetchError::TooManyRedirects(_)
        )
    }
}

/// Errors raised by a [`KvStore`](crate::traits::KvStore) backend.
///
/// Never surfaced to request callers: the cache recovers from write
/// failures internally with a single trim-and-retry.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend's storage quota is exhausted.
    #[error("store quota exceeded")]
    QuotaExceeded,

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reauthentication_errors() {
        assert!(FetchError::SigninRedirect("https://x".into()).needs_reauthentication());
        assert!(FetchError::TooManyRedirects("https://x".into()).needs_reauthentication());
        assert!(!FetchError::Timeout(20).needs_reauthentication());
        assert!(
            !FetchError::Http {
                status: 404,
                url: "https://x".into()
            }
            .needs_reauthentication()
        );
    }
}
