//! Calling contract of the listener/policy engine
//!
//! Blocking hooks return a [`Decision`]: either a verdict available right now,
//! or a future the proxy parks the request on until the policy engine answers.
//! Notification hooks return nothing and never block.

use futures_util::future::{BoxFuture, FutureExt};
use http::{HeaderMap, HeaderName};
use std::future::Future;
use url::Url;

use crate::proxy::http_types::{CompletionStatus, NetError, ResourceRequest, ResponseHeaders};
use crate::proxy::request_info::RequestInfo;

/// Final answer of a blocking hook
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict<T> {
    Proceed(T),
    Cancel,
}

/// Answer of a blocking hook, possibly deferred
pub enum Decision<T> {
    Ready(Verdict<T>),
    Pending(BoxFuture<'static, Verdict<T>>),
}

impl<T> Decision<T> {
    pub fn cancel() -> Self {
        Self::Ready(Verdict::Cancel)
    }

    pub fn proceed_with(outcome: T) -> Self {
        Self::Ready(Verdict::Proceed(outcome))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Verdict<T>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

impl<T: Default> Decision<T> {
    pub fn proceed() -> Self {
        Self::Ready(Verdict::Proceed(T::default()))
    }
}

impl Decision<BeforeRequestOutcome> {
    /// Proceed, but send the issuer to `url` instead of contacting the transport
    pub fn redirect(url: Url) -> Self {
        Self::proceed_with(BeforeRequestOutcome {
            redirect_url: Some(url),
        })
    }
}

/// Result of `on_before_request`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BeforeRequestOutcome {
    pub redirect_url: Option<Url>,
}

/// Header edits produced by `on_before_send_headers`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderChanges {
    pub removed: Vec<HeaderName>,
    pub set: HeaderMap,
}

impl HeaderChanges {
    pub fn remove(mut self, name: HeaderName) -> Self {
        self.removed.push(name);
        self
    }

    pub fn set(mut self, name: HeaderName, value: http::HeaderValue) -> Self {
        self.set.insert(name, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.set.is_empty()
    }

    /// Names of headers this edit sets
    pub fn set_names(&self) -> impl Iterator<Item = &HeaderName> {
        self.set.keys()
    }
}

/// Result of `on_headers_received`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadersReceivedOutcome {
    /// Full replacement for the response headers
    pub override_headers: Option<ResponseHeaders>,
    /// Redirect requested by the listener
    pub redirect_url: Option<Url>,
}

/// Listener/policy engine consulted at every phase of a proxied request
pub trait RequestListener: Send + Sync {
    /// Cheap check used for the pass-through fast path
    fn has_listener(&self) -> bool;

    /// Whether some listener wants raw (trusted channel) headers for this leg
    fn needs_raw_headers(&self, _info: &RequestInfo) -> bool {
        false
    }

    /// Whether any registered listener asked for extra headers at all
    fn has_extra_headers_listener(&self) -> bool {
        false
    }

    fn on_before_request(
        &self,
        _info: &RequestInfo,
        _request: &ResourceRequest,
    ) -> Decision<BeforeRequestOutcome> {
        Decision::proceed()
    }

    fn on_before_send_headers(
        &self,
        _info: &RequestInfo,
        _request: &ResourceRequest,
    ) -> Decision<HeaderChanges> {
        Decision::proceed()
    }

    fn on_send_headers(&self, _info: &RequestInfo, _request: &ResourceRequest, _headers: &HeaderMap) {
    }

    fn on_headers_received(
        &self,
        _info: &RequestInfo,
        _request: &ResourceRequest,
        _headers: Option<&ResponseHeaders>,
    ) -> Decision<HeadersReceivedOutcome> {
        Decision::proceed()
    }

    fn on_response_started(&self, _info: &RequestInfo, _request: &ResourceRequest) {}

    fn on_before_redirect(&self, _info: &RequestInfo, _request: &ResourceRequest, _new_url: &Url) {}

    fn on_completed(&self, _info: &RequestInfo, _request: &ResourceRequest, _status: &CompletionStatus) {
    }

    fn on_error_occurred(&self, _info: &RequestInfo, _request: &ResourceRequest, _error: &NetError) {}
}
