//! Target URL resolution and path handling for gateway requests

use crate::proxy::headers::{paths, X_TARGET_URL};
use crate::proxy::types::{ProxyError, ProxyResult};
use hyper::{Request, Uri};
use url::Url;

/// Schemes the gateway is willing to load
pub const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Strategy for resolving target URLs and handling path composition
pub struct UrlResolver;

impl UrlResolver {
    /// Extract target URL from request headers
    pub fn extract_target_url<B>(request: &Request<B>) -> ProxyResult<Url> {
        let target_url_str = request
            .headers()
            .get(X_TARGET_URL)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| {
                ProxyError::InvalidTargetUrl("Missing X-Target-Url header".to_string())
            })?;

        let target = Url::parse(target_url_str).map_err(|e| {
            ProxyError::InvalidTargetUrl(format!("Invalid target URL '{target_url_str}': {e}"))
        })?;

        if !ALLOWED_SCHEMES.contains(&target.scheme()) {
            return Err(ProxyError::InvalidTargetUrl(format!(
                "Unsupported scheme '{}'",
                target.scheme()
            )));
        }
        Ok(target)
    }

    /// Resolve the URL the request should be loaded from
    ///
    /// - If target URL has a path, use it as-is
    /// - If target URL is just the base, append the original request path
    pub fn resolve_target_url(target_url: &Url, original_uri: &Uri) -> ProxyResult<Url> {
        if target_url.path() != paths::DEFAULT && !target_url.path().is_empty() {
            return Ok(target_url.clone());
        }

        let path_and_query = original_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(paths::DEFAULT);

        target_url
            .join(path_and_query)
            .map_err(|e| ProxyError::InvalidTargetUrl(format!("{path_and_query}: {e}")))
    }
}
