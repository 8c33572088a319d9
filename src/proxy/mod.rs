//! Interception proxy
//!
//! - [`factory`]: entry point for new loaders and the single control flow
//!   that owns every live request
//! - [`record`]: per-request state machine
//! - [`transport`] / [`listener`]: the contracts of the two collaborators
//!   the proxy sits between
//! - [`gateway`]: HTTP front-end acting as an issuer

pub mod correlation;
pub mod error_response;
pub mod factory;
pub mod gateway;
pub mod header_mode;
pub mod headers;
pub mod http_types;
pub mod hyper_transport;
pub mod listener;
pub mod observer;
pub mod record;
pub mod request_info;
pub mod scheme;
pub mod transport;
pub mod types;
pub mod url_resolver;

#[cfg(test)]
mod test_utils;


pub use factory::{CreateLoaderParams, Liveness, ProxyFactory, ProxyFactoryHandle};
pub use gateway::{Gateway, GatewayLimits};
pub use http_types::{
    CompletionStatus, FollowRedirectParams, NetError, RedirectInfo, ResourceRequest,
    ResponseHead, ResponseHeaders,
};
pub use hyper_transport::HyperTransport;
pub use listener::{Decision, RequestListener, Verdict};
pub use observer::TracingListener;
pub use scheme::{SchemeHandler, SchemeHandlers};
pub use transport::{ClientEvent, LoaderCommand, Transport};
pub use types::{
    BodySizeLimit, FactoryConfig, ProxyError, ProxyResult, RedirectLimit, SyntheticRedirectCors,
};
