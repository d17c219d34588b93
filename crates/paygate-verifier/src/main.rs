use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paygate_verifier::{routes, AppState, VerifierConfig};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VerifierConfig::from_env().map_err(|e| {
        tracing::error!("Failed to load configuration: {e}");
        std::io::Error::other(e)
    })?;
    let port = config.port;

    tracing::info!("Starting paygate-verifier on port {}", port);
    tracing::info!("EIP-712 domain: {}", config.domain_name);
    tracing::info!(
        "HMAC auth: {}",
        if config.shared_secret.is_some() {
            "enabled"
        } else {
            "disabled (dev mode)"
        }
    );

    let state = web::Data::new(AppState::from(config));

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(64 * 1024))
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
