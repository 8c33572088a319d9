//! Request interceptor - a proxy that puts listener policy in the path of
//! streamed network requests
//!
//! Every request an issuer starts is run through a per-request state machine
//! that consults listeners before it is sent, while its headers are
//! negotiated, and when its response or redirect arrives. Listeners may
//! cancel, redirect or rewrite it; redirects restart the pipeline for the
//! next leg.

pub mod application;
pub mod config;
pub mod error;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
