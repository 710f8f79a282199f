use std::time::Duration;

use quarry_core::error::FetchError;
use quarry_core::request::FetchResponse;
use quarry_core::traits::Transport;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// HTTP transport using reqwest.
///
/// Follows redirects and reports the landing URL in
/// [`FetchResponse::final_url`], so the request state machine can judge
/// sign-in redirects for itself. Never fails on a non-200 status; that
/// classification also belongs to the state machine.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout_secs: u64,
}

/// Builder for [`ReqwestTransport`].
///
/// Scraping an authenticated site means replaying the session the user
/// already holds: add their `Cookie` header (and any CSRF headers) with
/// [`header`](Self::header).
#[derive(Debug)]
pub struct ReqwestTransportBuilder {
    user_agent: String,
    timeout: Duration,
    headers: HeaderMap,
}

impl ReqwestTransportBuilder {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a default header sent with every request.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, FetchError> {
        let name = HeaderName::try_from(name)
            .map_err(|e| FetchError::Network(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| FetchError::Network(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn build(self) -> Result<ReqwestTransport, FetchError> {
        let client = Client::builder()
            .user_agent(self.user_agent)
            .timeout(self.timeout)
            .default_headers(self.headers)
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(ReqwestTransport {
            client,
            timeout_secs: self.timeout.as_secs(),
        })
    }
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchError> {
        Self::builder().build()
    }

    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder {
            user_agent: "Quarry/0.1".to_string(),
            timeout: Duration::from_secs(30),
            headers: HeaderMap::new(),
        }
    }
}

impl Transport for ReqwestTransport {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_redirect() {
                FetchError::TooManyRedirects(url.to_string())
            } else if e.is_timeout() {
                FetchError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                FetchError::Network(format!("connection failed: {e}"))
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("failed to read response body: {e}")))?;

        tracing::debug!(url = %url, status = status, bytes = body.len(), "fetched");
        Ok(FetchResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accepts_session_headers() {
        let transport = ReqwestTransport::builder()
            .user_agent("QuarryTest/0.1")
            .timeout(Duration::from_secs(5))
            .header("cookie", "session-id=abc123; session-token=xyz")
            .unwrap()
            .header("x-requested-with", "XMLHttpRequest")
            .unwrap()
            .build();
        assert!(transport.is_ok());
    }

    #[test]
    fn builder_rejects_malformed_headers() {
        let result = ReqwestTransport::builder().header("bad header name", "v");
        assert!(matches!(result.unwrap_err(), FetchError::Network(_)));

        let result = ReqwestTransport::builder().header("cookie", "bad\nvalue");
        assert!(matches!(result.unwrap_err(), FetchError::Network(_)));
    }
}
