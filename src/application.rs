use std::sync::Arc;

use crate::config::Settings;
use crate::proxy::{
    BodySizeLimit, Gateway, GatewayLimits, HyperTransport, ProxyFactory, RedirectLimit,
    SchemeHandlers, TracingListener,
};
use crate::{Error, Result};
use tracing::{info, instrument};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
}

impl Application {
    #[instrument(skip(settings))]
    pub fn new(settings: Settings) -> Result<Self> {
        // Validate limits up front so a bad config fails before binding.
        Self::limits(&settings)?;
        Self::response_limit(&settings)?;
        Ok(Self { settings })
    }

    fn limits(settings: &Settings) -> Result<GatewayLimits> {
        Ok(GatewayLimits {
            max_redirects: RedirectLimit::try_new(settings.gateway.max_redirects)
                .map_err(|e| Error::invalid_setting("gateway.max_redirects", e))?,
            max_request_size: BodySizeLimit::try_new(settings.gateway.max_request_size)
                .map_err(|e| Error::invalid_setting("gateway.max_request_size", e))?,
        })
    }

    fn response_limit(settings: &Settings) -> Result<BodySizeLimit> {
        BodySizeLimit::try_new(settings.transport.max_response_size)
            .map_err(|e| Error::invalid_setting("transport.max_response_size", e))
    }

    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let interception = &self.settings.interception;
        let listener = TracingListener::new(interception.observe_requests)
            .with_raw_headers(interception.trusted_header_channel)
            .with_extra_headers(interception.extra_headers_listeners);
        let transport = HyperTransport::new(
            self.settings.request_timeout(),
            Self::response_limit(&self.settings)?,
        );

        let (factory, handle) = ProxyFactory::new(
            self.settings.factory_config(),
            Arc::new(listener),
            Arc::new(transport),
            SchemeHandlers::new(),
        );
        let factory_task = tokio::spawn(factory.run());

        let router = Gateway::new(handle, Self::limits(&self.settings)?).into_router();
        let address = self.settings.bind_address();
        let tcp = tokio::net::TcpListener::bind(&address).await?;
        info!(
            address = %address,
            environment = %self.settings.gateway.environment,
            observe = interception.observe_requests,
            "request interceptor listening"
        );

        axum::serve(tcp, router).await?;

        // The router held the last issuer binding; let in-flight requests finish.
        let _ = factory_task.await;
        info!("request interceptor stopped");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
