use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::proxy::types::{FactoryConfig, SyntheticRedirectCors};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub interception: InterceptionSettings,
    pub transport: TransportSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub max_redirects: u8,
    pub max_request_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InterceptionSettings {
    /// Run every request through the interception pipeline; off means pass-through
    pub observe_requests: bool,
    pub trusted_header_channel: bool,
    pub extra_headers_listeners: bool,
    pub synthetic_redirect_cors: SyntheticRedirectCors,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    pub request_timeout_ms: u64,
    pub max_response_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Self::builder(&environment)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("REQUEST_INTERCEPTOR").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load from one explicit file on top of the defaults
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::builder("development")?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    fn builder(
        environment: &str,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("gateway.host", "0.0.0.0")?
            .set_default("gateway.port", 8080)?
            .set_default("gateway.environment", environment)?
            .set_default("gateway.max_redirects", 20)?
            .set_default("gateway.max_request_size", 10 * 1024 * 1024)?
            .set_default("interception.observe_requests", true)?
            .set_default("interception.trusted_header_channel", true)?
            .set_default("interception.extra_headers_listeners", false)?
            .set_default("interception.synthetic_redirect_cors", "blank_initiator")?
            .set_default("transport.request_timeout_ms", 30_000)?
            .set_default("transport.max_response_size", 50 * 1024 * 1024)?
            .set_default("logging.level", "info")
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            trusted_header_channel: self.interception.trusted_header_channel,
            synthetic_redirect_cors: self.interception.synthetic_redirect_cors,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.request_timeout_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}
