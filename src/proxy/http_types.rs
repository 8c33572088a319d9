//! Request and response snapshots exchanged between issuer, proxy and transport
//!
//! These types are owned values. The proxy keeps its own copy of a request and
//! rewrites it only at defined transition points (redirects, header edits), so
//! nothing here is ever shared with the issuer's or the transport's copy.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use url::{Origin, Url};

use crate::proxy::listener::HeaderChanges;
use crate::proxy::headers::NON_AUTHORITATIVE_REASON;
use crate::proxy::types::{
    FrameId, INTERNAL_REDIRECT_REASON, INTERNAL_REDIRECT_STATUS, NON_AUTHORITATIVE_REASON_VALUE,
};

/// Streamed response body handed from the transport to the issuer
pub type ResponseBody = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Terminal error codes delivered to the issuer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("request blocked by policy")]
    BlockedByClient,

    #[error("request aborted")]
    Aborted,

    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("transport error {code}: {message}")]
    Transport { code: i32, message: String },
}

/// Completion status of one request leg
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionStatus {
    pub error: Option<NetError>,
    pub encoded_data_length: u64,
    pub decoded_body_length: u64,
}

impl CompletionStatus {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_error(error: NetError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Referrer policy carried by a request and rewritten on redirects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReferrerPolicy {
    #[default]
    NoReferrerWhenDowngrade,
    NoReferrer,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    StrictOriginWhenCrossOrigin,
    UnsafeUrl,
}

/// Mutable snapshot of an outgoing request
#[derive(Clone, Debug)]
pub struct ResourceRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub request_initiator: Option<Origin>,
    pub site_for_cookies: Option<Url>,
    pub referrer: Option<Url>,
    pub referrer_policy: ReferrerPolicy,
    pub frame_id: Option<FrameId>,
    version: u64,
}

impl ResourceRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            site_for_cookies: Some(url.clone()),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            request_initiator: None,
            referrer: None,
            referrer_policy: ReferrerPolicy::default(),
            frame_id: None,
            version: 0,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_initiator(mut self, initiator: Origin) -> Self {
        self.request_initiator = Some(initiator);
        self
    }

    pub fn with_frame(mut self, frame_id: FrameId) -> Self {
        self.frame_id = Some(frame_id);
        self
    }

    /// Number of in-place rewrites applied to this snapshot
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rewrite the request for the next leg of a redirect chain
    pub fn apply_redirect(&mut self, redirect: &RedirectInfo) {
        self.url = redirect.new_url.clone();
        self.method = redirect.new_method.clone();
        self.site_for_cookies = redirect.new_site_for_cookies.clone();
        self.referrer = redirect.new_referrer.clone();
        self.referrer_policy = redirect.new_referrer_policy;

        if self.method == Method::GET {
            self.body = None;
        }
        self.version += 1;
    }

    /// Apply the issuer's follow-redirect instructions
    pub fn apply_follow_redirect(&mut self, params: &FollowRedirectParams) {
        if let Some(new_url) = &params.new_url {
            self.url = new_url.clone();
        }
        for name in &params.removed_headers {
            self.headers.remove(name);
        }
        for (name, value) in params.modified_headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self.version += 1;
    }

    /// Apply header edits requested by a before-send-headers listener
    pub fn apply_header_changes(&mut self, changes: &HeaderChanges) {
        if changes.is_empty() {
            return;
        }
        for name in &changes.removed {
            self.headers.remove(name);
        }
        for (name, value) in changes.set.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self.version += 1;
    }

    /// Replace the whole header block (trusted header channel legs)
    pub fn replace_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
        self.version += 1;
    }

    /// Replace the initiator with an opaque origin
    pub fn blank_initiator(&mut self) {
        self.request_initiator = Some(Origin::new_opaque());
        self.version += 1;
    }
}

/// Status line plus header block of a response or redirect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHeaders {
    version: Version,
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
}

impl ResponseHeaders {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn from_parts(status: StatusCode, version: Version, headers: HeaderMap) -> Self {
        Self {
            version,
            status,
            reason: None,
            headers,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Head of a redirect the proxy fabricates without asking the network
    pub fn internal_redirect(location: &Url) -> Result<Self, NetError> {
        let value = HeaderValue::from_str(location.as_str()).map_err(|_| {
            NetError::InvalidRedirect(format!("unusable redirect target {location}"))
        })?;
        let status = StatusCode::from_u16(INTERNAL_REDIRECT_STATUS)
            .unwrap_or(StatusCode::TEMPORARY_REDIRECT);

        Ok(Self::new(status)
            .with_reason(INTERNAL_REDIRECT_REASON)
            .with_header(header::LOCATION, value)
            .with_header(
                NON_AUTHORITATIVE_REASON,
                HeaderValue::from_static(NON_AUTHORITATIVE_REASON_VALUE),
            ))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn get(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn is_redirect_status(&self) -> bool {
        matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }

    /// `Location` of a redirect response, if this is one
    pub fn redirect_location(&self) -> Option<&str> {
        if !self.is_redirect_status() {
            return None;
        }
        self.get(header::LOCATION)
    }

    pub fn has_set_cookie(&self) -> bool {
        self.headers.contains_key(header::SET_COOKIE)
    }

    /// Copy without cookie-setting headers, as delivered over a channel that strips them
    pub fn without_set_cookie(&self) -> Self {
        let mut stripped = self.clone();
        stripped.headers.remove(header::SET_COOKIE);
        stripped.headers.remove(HeaderName::from_static("set-cookie2"));
        stripped
    }
}

impl fmt::Display for ResponseHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.reason())
    }
}

/// Response metadata forwarded to the issuer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub headers: Option<ResponseHeaders>,
    pub encoded_data_length: u64,
    pub remote_endpoint: Option<SocketAddr>,
}

impl ResponseHead {
    pub fn new(headers: ResponseHeaders) -> Self {
        Self {
            headers: Some(headers),
            ..Self::default()
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.headers.as_ref().map(ResponseHeaders::status)
    }
}

/// Instructions for turning the current request into the next redirect leg
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectInfo {
    pub status_code: StatusCode,
    pub new_method: Method,
    pub new_url: Url,
    pub new_site_for_cookies: Option<Url>,
    pub new_referrer: Option<Url>,
    pub new_referrer_policy: ReferrerPolicy,
}

impl RedirectInfo {
    /// Redirect that keeps the current method, as used for fabricated redirects
    pub fn preserving_method(status_code: StatusCode, request: &ResourceRequest, new_url: Url) -> Self {
        Self {
            status_code,
            new_method: request.method.clone(),
            new_site_for_cookies: Some(new_url.clone()),
            new_url,
            new_referrer: None,
            new_referrer_policy: request.referrer_policy,
        }
    }

    /// Redirect computed from a transport response using fetch method-rewrite rules
    pub fn for_response(status_code: StatusCode, request: &ResourceRequest, new_url: Url) -> Self {
        let new_method = match status_code.as_u16() {
            303 if request.method != Method::HEAD => Method::GET,
            301 | 302 if request.method == Method::POST => Method::GET,
            _ => request.method.clone(),
        };
        Self {
            status_code,
            new_method,
            new_site_for_cookies: Some(new_url.clone()),
            new_url,
            new_referrer: request.referrer.clone(),
            new_referrer_policy: request.referrer_policy,
        }
    }
}

/// Issuer-supplied continuation of a redirect
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FollowRedirectParams {
    pub removed_headers: Vec<HeaderName>,
    pub modified_headers: HeaderMap,
    pub new_url: Option<Url>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn internal_redirect_head_names_its_target() {
        let headers = ResponseHeaders::internal_redirect(&url("http://c/next")).unwrap();

        assert_eq!(headers.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(headers.reason(), "Internal Redirect");
        assert_eq!(headers.redirect_location(), Some("http://c/next"));
        assert_eq!(headers.get(NON_AUTHORITATIVE_REASON), Some("WebRequest API"));
    }

    #[test]
    fn redirect_without_location_has_no_redirect_location() {
        let headers = ResponseHeaders::new(StatusCode::FOUND);
        assert!(headers.is_redirect_status());
        assert_eq!(headers.redirect_location(), None);
    }

    #[test]
    fn stripping_set_cookie_keeps_other_headers() {
        let headers = ResponseHeaders::new(StatusCode::OK)
            .with_header(header::SET_COOKIE, HeaderValue::from_static("a=1"))
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let stripped = headers.without_set_cookie();
        assert!(!stripped.has_set_cookie());
        assert_eq!(stripped.get(header::CONTENT_TYPE), Some("text/plain"));
    }

    #[test]
    fn redirect_to_get_drops_body_and_bumps_version() {
        let mut request = ResourceRequest::new(Method::POST, url("http://a/form")).with_body("x=1");
        let redirect = RedirectInfo::for_response(StatusCode::SEE_OTHER, &request, url("http://a/done"));

        request.apply_redirect(&redirect);

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url, url("http://a/done"));
        assert!(request.body.is_none());
        assert_eq!(request.version(), 1);
    }

    #[test]
    fn temporary_redirect_preserves_method_and_body() {
        let mut request = ResourceRequest::new(Method::PUT, url("http://a/x")).with_body("payload");
        let redirect =
            RedirectInfo::for_response(StatusCode::TEMPORARY_REDIRECT, &request, url("http://a/y"));

        request.apply_redirect(&redirect);

        assert_eq!(request.method, Method::PUT);
        assert!(request.body.is_some());
    }

    #[test]
    fn follow_redirect_applies_removals_then_modifications() {
        let mut request = ResourceRequest::get(url("http://a/x"))
            .with_header(header::AUTHORIZATION, HeaderValue::from_static("secret"))
            .with_header(header::ACCEPT, HeaderValue::from_static("*/*"));
        let mut modified = HeaderMap::new();
        modified.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        request.apply_follow_redirect(&FollowRedirectParams {
            removed_headers: vec![header::AUTHORIZATION],
            modified_headers: modified,
            new_url: Some(url("http://b/z")),
        });

        assert!(!request.headers.contains_key(header::AUTHORIZATION));
        assert_eq!(request.headers.get(header::ACCEPT).unwrap(), "text/html");
        assert_eq!(request.url, url("http://b/z"));
    }
}
