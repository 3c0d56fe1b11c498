use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_chain::api;
use audit_chain::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_chain=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit chain service");

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded (storage backend: {:?})",
        config.storage.backend
    );

    let chain = Arc::new(config.build_chain().await?);
    chain.initialize().await?;

    let verification = chain.verify().await?;
    if verification.valid {
        info!("{}", verification.summary());
    } else {
        error!("{}", verification.summary());
    }

    // Retention task
    let policy = config.retention.policy();
    if !policy.is_noop() {
        let retention_chain = chain.clone();
        let interval = Duration::from_secs(config.retention.interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                if let Err(e) = retention_chain.enforce_retention(policy).await {
                    error!("Failed to enforce audit retention: {}", e);
                }
            }
        });
        info!("Audit retention task started");
    }

    let app = api::router(chain);

    let addr = config.bind_address();
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
