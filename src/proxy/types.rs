//! Type definitions for the proxy module

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::http_types::NetError;

// ========== Identifier Types ==========

/// Stable, proxy-assigned request identity, unique for the lifetime of a factory
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    From,
    AsRef
))]
pub struct RequestId(u64);

/// Per-leg identifier assigned by the transport; zero means "not assigned"
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    From,
    AsRef
))]
pub struct TransportRequestId(i32);

impl TransportRequestId {
    /// The transport did not assign an identifier to this leg
    pub fn unassigned() -> Self {
        Self::new(0)
    }

    pub fn is_assigned(&self) -> bool {
        self.into_inner() != 0
    }
}

/// Routing context of the issuer (frame host / process routing slot)
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    From,
    AsRef
))]
pub struct RoutingId(i32);

/// Frame the request was issued for
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    From,
    AsRef
))]
pub struct FrameId(i32);

/// Maximum number of redirects the gateway follows for one inbound request
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(less_or_equal = 64),
)]
pub struct RedirectLimit(u8);

/// Maximum size of a request or response body in bytes
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0),
)]
pub struct BodySizeLimit(usize);

// ========== Loader Options ==========

/// Options attached to a loader when it is created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// The issuer blocks on this request
    pub synchronous: bool,
    /// Ask the transport to negotiate headers over the trusted header channel
    pub use_header_channel: bool,
}

impl LoadOptions {
    pub fn with_header_channel(mut self, enabled: bool) -> Self {
        self.use_header_channel |= enabled;
        self
    }
}

/// Network priority of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestPriority {
    Throttled,
    Idle,
    #[default]
    Lowest,
    Low,
    Medium,
    Highest,
}

/// How a synthetic redirect is made safe for cross-origin issuers.
///
/// Exactly one policy is active for a factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticRedirectCors {
    /// Blank the request initiator when the redirect crosses origins, so the
    /// transport emits `Origin: null` on the next leg
    #[default]
    BlankInitiator,
    /// Echo the request's `Origin` header back as permissive CORS response headers
    PermissiveHeaders,
}

/// Factory-wide settings fixed at construction
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// A trusted header channel exists between the transport and this factory
    pub trusted_header_channel: bool,
    /// Cross-origin handling for synthetic redirects
    pub synthetic_redirect_cors: SyntheticRedirectCors,
}

// ========== Constants ==========

/// Status code used for redirects fabricated by listeners
pub const INTERNAL_REDIRECT_STATUS: u16 = 307;

/// Reason phrase of a fabricated redirect
pub const INTERNAL_REDIRECT_REASON: &str = "Internal Redirect";

/// Value of the `Non-Authoritative-Reason` marker on fabricated redirects
pub const NON_AUTHORITATIVE_REASON_VALUE: &str = "WebRequest API";

/// Errors that can occur in the proxy and its adapters
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Request body too large (max: {max_size} bytes)")]
    RequestTooLarge { max_size: BodySizeLimit },

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("Invalid response headers: {0}")]
    InvalidResponseHeaders(String),

    #[error("Too many redirects (limit: {0})")]
    TooManyRedirects(RedirectLimit),

    #[error("Request failed: {0}")]
    Net(#[from] NetError),

    #[error("Proxy factory is closed")]
    FactoryClosed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
