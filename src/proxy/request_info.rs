//! Listener-visible description of a proxied request

use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use url::{Origin, Url};

use crate::proxy::http_types::{ResourceRequest, ResponseHead, ResponseHeaders};
use crate::proxy::types::{FrameId, LoadOptions, RequestId, RoutingId};

/// Derived request details handed to every listener hook.
///
/// Rebuilt each time a request (re)starts, because redirects rewrite the
/// underlying snapshot. The initiator is always the one the request was
/// created with, even after the live request's initiator was blanked.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub initiator: Option<Origin>,
    pub routing_id: RoutingId,
    pub frame_id: Option<FrameId>,
    pub is_async: bool,
    pub started_at: DateTime<Utc>,
    pub request_version: u64,
    pub response_code: Option<StatusCode>,
    pub response_headers: Option<ResponseHeaders>,
}

impl RequestInfo {
    pub fn new(
        id: RequestId,
        request: &ResourceRequest,
        original_initiator: Option<&Origin>,
        routing_id: RoutingId,
        options: LoadOptions,
    ) -> Self {
        Self {
            id,
            url: request.url.clone(),
            method: request.method.clone(),
            initiator: original_initiator.cloned(),
            routing_id,
            frame_id: request.frame_id,
            is_async: !options.synchronous,
            started_at: Utc::now(),
            request_version: request.version(),
            response_code: None,
            response_headers: None,
        }
    }

    /// Record the latest response (or redirect) metadata
    pub fn add_response_info(&mut self, head: &ResponseHead) {
        self.response_code = head.status();
        self.response_headers = head.headers.clone();
    }
}
