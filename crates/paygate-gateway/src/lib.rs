pub mod app;
pub mod cache;
pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod probe;
pub mod rate_limit;
pub mod receipts;
pub mod routes;
pub mod state;
pub mod timeout;
pub mod upstream;
pub mod verification;

pub use app::build_app;
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use state::AppState;
