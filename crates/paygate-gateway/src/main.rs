use actix_web::{web, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate_gateway::{build_app, config::GatewayConfig, metrics::register_metrics, AppState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {e}");
        std::io::Error::other(e)
    })?;
    let port = config.port;

    tracing::info!("Starting paygate-gateway on port {}", port);
    tracing::info!("Verifier URL: {}", config.verifier_url);
    tracing::info!("Upstream model: {}", config.openrouter_model);
    tracing::info!(
        "Price: {} {} on chain {} to {}",
        config.payment_amount,
        config.payment_token,
        config.chain_id,
        config.recipient
    );
    tracing::info!(
        "Verifier HMAC auth: {}",
        if config.verifier_secret.is_some() {
            "enabled"
        } else {
            "disabled (dev mode)"
        }
    );
    tracing::info!(
        "Rate limiting: {}, cache: {}, single-use nonces: {}",
        config.rate_limit.enabled,
        if config.cache.enabled {
            format!("{:?}", config.cache.backend)
        } else {
            "disabled".to_string()
        },
        config.nonce_single_use
    );

    // Register Prometheus metrics
    register_metrics();

    // Create shared state
    let state = AppState::new(config)?;
    let tasks = state.start_background_tasks();
    let state_data = web::Data::new(state);

    // Start HTTP server
    let result = HttpServer::new(move || build_app(state_data.clone()))
        .bind(("0.0.0.0", port))?
        .run()
        .await;

    tasks.shutdown();
    tracing::info!("paygate-gateway stopped");
    result
}
