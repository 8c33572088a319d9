use anyhow::Result;
use request_interceptor::config::Settings;
use request_interceptor::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting request interceptor");

    let app = Application::new(settings)?;
    app.run().await?;

    Ok(())
}
