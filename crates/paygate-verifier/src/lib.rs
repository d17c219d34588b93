//! Payment signature verifier.
//!
//! Recovers the signer of an EIP-712 `Payment` over the context the gateway
//! sends, and reports it. It holds no state beyond configuration: whether the
//! recovered address is acceptable is the gateway's call.
//!
//! # Modules
//!
//! - [`routes`]: `POST /verify`, `GET /health`, `GET /metrics`
//! - [`config`]: environment configuration
//! - [`metrics`]: Prometheus counters for verification outcomes

pub mod config;
pub mod metrics;
pub mod routes;
pub mod state;

pub use config::VerifierConfig;
pub use state::AppState;
