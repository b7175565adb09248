//! Entry point: load configuration from the environment, install the
//! tracing subscriber, and hand off to the engine's runtime loop.

use forgeworker_engine::RuntimeConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error, refusing to start");
            std::process::exit(1);
        }
    };

    if let Err(err) = forgeworker_engine::run(config).await {
        tracing::error!(error = %err, "worker exited with an error");
        std::process::exit(1);
    }
}
