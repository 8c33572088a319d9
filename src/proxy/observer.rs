//! Observe-only listener that logs every phase of every intercepted request

use http::HeaderMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::http_types::{CompletionStatus, NetError, ResourceRequest, ResponseHeaders};
use crate::proxy::listener::{
    BeforeRequestOutcome, Decision, HeaderChanges, HeadersReceivedOutcome, RequestListener,
};
use crate::proxy::request_info::RequestInfo;

/// Listener that never changes a request, only records what happens to it.
///
/// With `active` off the factory takes the pass-through fast path.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingListener {
    active: bool,
    raw_headers: bool,
    extra_headers: bool,
}

impl TracingListener {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            ..Self::default()
        }
    }

    /// Ask for raw headers over the trusted header channel where available
    pub fn with_raw_headers(mut self, enabled: bool) -> Self {
        self.raw_headers = enabled;
        self
    }

    pub fn with_extra_headers(mut self, enabled: bool) -> Self {
        self.extra_headers = enabled;
        self
    }
}

impl RequestListener for TracingListener {
    fn has_listener(&self) -> bool {
        self.active
    }

    fn needs_raw_headers(&self, _info: &RequestInfo) -> bool {
        self.raw_headers
    }

    fn has_extra_headers_listener(&self) -> bool {
        self.extra_headers
    }

    fn on_before_request(
        &self,
        info: &RequestInfo,
        _request: &ResourceRequest,
    ) -> Decision<BeforeRequestOutcome> {
        debug!(request_id = %info.id, method = %info.method, url = %info.url, "before request");
        Decision::proceed()
    }

    fn on_before_send_headers(
        &self,
        info: &RequestInfo,
        request: &ResourceRequest,
    ) -> Decision<HeaderChanges> {
        debug!(request_id = %info.id, headers = request.headers.len(), "before send headers");
        Decision::proceed()
    }

    fn on_send_headers(&self, info: &RequestInfo, _request: &ResourceRequest, headers: &HeaderMap) {
        debug!(request_id = %info.id, headers = headers.len(), "headers sent");
    }

    fn on_headers_received(
        &self,
        info: &RequestInfo,
        _request: &ResourceRequest,
        headers: Option<&ResponseHeaders>,
    ) -> Decision<HeadersReceivedOutcome> {
        debug!(
            request_id = %info.id,
            status = headers.map(|h| h.status().as_u16()),
            "headers received"
        );
        Decision::proceed()
    }

    fn on_response_started(&self, info: &RequestInfo, _request: &ResourceRequest) {
        debug!(request_id = %info.id, status = info.response_code.map(|s| s.as_u16()), "response started");
    }

    fn on_before_redirect(&self, info: &RequestInfo, _request: &ResourceRequest, new_url: &Url) {
        info!(request_id = %info.id, from = %info.url, to = %new_url, "redirect");
    }

    fn on_completed(&self, info: &RequestInfo, _request: &ResourceRequest, status: &CompletionStatus) {
        info!(
            request_id = %info.id,
            url = %info.url,
            bytes = status.decoded_body_length,
            elapsed_ms = (chrono::Utc::now() - info.started_at).num_milliseconds(),
            "completed"
        );
    }

    fn on_error_occurred(&self, info: &RequestInfo, _request: &ResourceRequest, error: &NetError) {
        warn!(request_id = %info.id, url = %info.url, error = %error, "failed");
    }
}
