//! HTTP transports for the quarry scheduler.
//!
//! [`ReqwestTransport`] performs real network fetches with an
//! authenticated session's cookies and headers. [`ThrottledTransport`]
//! wraps any transport with per-domain politeness delays.

pub mod throttle;
pub mod transport;

pub use throttle::{ThrottleConfig, ThrottledTransport};
pub use transport::{ReqwestTransport, ReqwestTransportBuilder};
