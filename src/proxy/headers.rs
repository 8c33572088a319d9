//! HTTP header constants used by the interception core and the gateway
//!
//! Header names are kept in one place so the state machine, the transport
//! adapter and the gateway agree on spelling.

use ::http::header::HeaderName;

/// Custom header naming the URL the gateway should load
pub const X_TARGET_URL: &str = "x-target-url";

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Marker carried by redirects the proxy fabricates itself
pub const NON_AUTHORITATIVE_REASON: HeaderName =
    HeaderName::from_static("non-authoritative-reason");

/// Standard header re-exports for convenience
pub use ::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, HOST, LOCATION,
    ORIGIN, SET_COOKIE, TRANSFER_ENCODING,
};

/// Request headers that describe a hop rather than the request itself
pub const HOP_BY_HOP: [HeaderName; 2] = [HOST, TRANSFER_ENCODING];

/// Well-known paths
pub mod paths {
    /// Default path when none is specified
    pub const DEFAULT: &str = "/";

    /// Health check endpoint path
    pub const HEALTH: &str = "/health";
}
