use std::future::Future;

use crate::error::{FetchError, StoreError};
use crate::request::FetchResponse;

/// Performs the real network call for a request in the SENT state.
///
/// Implementations return the response without judging the status code;
/// classification (sign-in redirects, redirect storms, non-200) belongs to
/// the request state machine.
pub trait Transport: Send + Sync + Clone {
    fn fetch(&self, url: &str)
    -> impl Future<Output = Result<FetchResponse, FetchError>> + Send;
}

/// Key/value collaborator backing a [`Cache`](crate::cache::Cache).
///
/// Any durable or in-memory backend works; the cache only needs eventual
/// consistency and key enumeration. A backend with a hard quota should
/// surface exhaustion as [`StoreError::QuotaExceeded`] so the cache can
/// trim and retry.
pub trait KvStore: Send + Sync + Clone {
    fn get(&self, key: &str)
    -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    fn set(&self, key: &str, value: Vec<u8>)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn keys(&self) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// Receives the one-time notification that the authenticated session has
/// lapsed (repeated sign-in redirects or redirect storms).
pub trait Notice: Send + Sync {
    fn reauthentication_required(&self);
}

/// Notice that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotice;

impl Notice for TracingNotice {
    fn reauthentication_required(&self) {
        tracing::warn!(
            "It looks like you have been signed out of the target site. \
             Sometimes this is partial: some pages stay signed in and some do not. \
             Sign out, sign back in, and retry."
        );
    }
}
