//! Scheme-keyed handlers that take a request away from the interception pipeline

use std::collections::HashMap;
use std::sync::Arc;

use crate::proxy::http_types::ResourceRequest;
use crate::proxy::transport::{ClientSender, LoaderReceiver};

/// Loader for one URL scheme; once chosen it fully owns the request
pub trait SchemeHandler: Send + Sync {
    fn start_loading(&self, request: ResourceRequest, loader: LoaderReceiver, client: ClientSender);
}

/// Intercepted-scheme table consulted before any listener logic, followed by
/// the built-in scheme short-circuits
#[derive(Clone, Default)]
pub struct SchemeHandlers {
    intercepted: HashMap<String, Arc<dyn SchemeHandler>>,
    builtin: HashMap<String, Arc<dyn SchemeHandler>>,
}

impl SchemeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integrator-supplied handler; it takes priority over built-ins
    pub fn intercept(mut self, scheme: impl Into<String>, handler: Arc<dyn SchemeHandler>) -> Self {
        self.intercepted
            .insert(scheme.into().to_ascii_lowercase(), handler);
        self
    }

    /// Register a built-in handler (e.g. archive-aware `file` reads)
    pub fn builtin(mut self, scheme: impl Into<String>, handler: Arc<dyn SchemeHandler>) -> Self {
        self.builtin.insert(scheme.into().to_ascii_lowercase(), handler);
        self
    }

    /// Handler that owns requests for `scheme`, if any
    pub fn resolve(&self, scheme: &str) -> Option<&Arc<dyn SchemeHandler>> {
        self.intercepted
            .get(scheme)
            .or_else(|| self.builtin.get(scheme))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler(AtomicUsize);

    impl SchemeHandler for CountingHandler {
        fn start_loading(&self, _: ResourceRequest, _: LoaderReceiver, _: ClientSender) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn intercepted_handler_wins_over_builtin() {
        let intercepted = Arc::new(CountingHandler::default());
        let builtin = Arc::new(CountingHandler::default());
        let handlers = SchemeHandlers::new()
            .builtin("file", builtin.clone())
            .intercept("FILE", intercepted.clone());

        let (_, loader) = crate::proxy::transport::loader_channel();
        let (client, _) = crate::proxy::transport::client_channel();
        let request = ResourceRequest::get(url::Url::parse("file:///tmp/x").unwrap());
        handlers
            .resolve(request.url.scheme())
            .unwrap()
            .start_loading(request, loader, client);

        assert_eq!(intercepted.0.load(Ordering::SeqCst), 1);
        assert_eq!(builtin.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_scheme_resolves_to_nothing() {
        assert!(SchemeHandlers::new().resolve("https").is_none());
    }
}
