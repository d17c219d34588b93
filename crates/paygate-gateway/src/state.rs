use std::sync::Arc;
use std::time::{Duration, Instant};

use paygate::nonce_store::{InMemoryNonceLedger, NonceLedger};
use tokio::task::JoinHandle;

use crate::cache::{CacheStore, InMemoryCacheStore, ResponseCache, SqliteCacheStore};
use crate::config::{CacheBackend, GatewayConfig};
use crate::rate_limit::TieredRateLimiter;
use crate::receipts::{ReceiptSigner, ReceiptStore};
use crate::upstream::{OpenRouterClient, Summarizer};
use crate::verification::{HttpVerifier, PaymentVerifier, SignatureVerifier};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub limiter: Arc<TieredRateLimiter>,
    pub verifier: Arc<PaymentVerifier>,
    pub summarizer: Arc<dyn Summarizer>,
    /// None when `CACHE_ENABLED` is off
    pub cache: Option<ResponseCache>,
    pub receipts: Arc<ReceiptStore>,
    /// Spent nonces, only when `NONCE_SINGLE_USE` is on
    pub nonces: Option<Arc<dyn NonceLedger>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the production collaborators: HTTP verifier, OpenRouter client
    /// and the configured cache backend.
    pub fn new(config: GatewayConfig) -> std::io::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeouts.request)
            .redirect(reqwest::redirect::Policy::none()) // Prevent SSRF via redirects
            .build()
            .map_err(std::io::Error::other)?;

        let verifier: Arc<dyn SignatureVerifier> = Arc::new(HttpVerifier::new(
            http_client.clone(),
            &config.verifier_url,
            config.verifier_secret.clone(),
            config.timeouts.health_check,
        ));
        let summarizer: Arc<dyn Summarizer> = Arc::new(OpenRouterClient::new(
            http_client,
            &config.openrouter_url,
            &config.openrouter_api_key,
            &config.openrouter_model,
            config.timeouts.health_check,
        ));

        let cache_store: Option<Arc<dyn CacheStore>> = if !config.cache.enabled {
            None
        } else {
            match config.cache.backend {
                CacheBackend::Memory => Some(Arc::new(InMemoryCacheStore::new())),
                CacheBackend::Sqlite => {
                    let store = SqliteCacheStore::open(&config.cache.db_path)
                        .map_err(std::io::Error::other)?;
                    tracing::info!("Response cache at: {}", config.cache.db_path);
                    Some(Arc::new(store))
                }
            }
        };

        Ok(Self::with_parts(config, verifier, summarizer, cache_store))
    }

    /// Assemble state around caller-supplied collaborators.
    pub fn with_parts(
        config: GatewayConfig,
        verifier: Arc<dyn SignatureVerifier>,
        summarizer: Arc<dyn Summarizer>,
        cache_store: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let cache = cache_store.map(|store| ResponseCache::new(store, config.cache.ttl));
        let receipts = Arc::new(ReceiptStore::new(
            ReceiptSigner::new(config.server_private_key.clone()),
            config.receipts.ttl,
        ));
        let nonces: Option<Arc<dyn NonceLedger>> = config
            .nonce_single_use
            .then(|| Arc::new(InMemoryNonceLedger::new()) as Arc<dyn NonceLedger>);

        Self {
            limiter: Arc::new(TieredRateLimiter::new(&config.rate_limit)),
            verifier: Arc::new(PaymentVerifier::new(verifier, &config)),
            summarizer,
            cache,
            receipts,
            nonces,
            started_at: Instant::now(),
            config: Arc::new(config),
        }
    }

    /// Start every periodic maintenance task. Must run inside a tokio runtime.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let mut handles = Vec::new();

        if self.config.rate_limit.enabled {
            handles.extend(
                self.limiter
                    .start_sweepers(self.config.rate_limit.cleanup_interval),
            );
        }
        if let Some(ref cache) = self.cache {
            handles.push(cache.start_purger(self.config.cache.cleanup_interval));
        }
        if let Some(ref ledger) = self.nonces {
            handles.push(start_nonce_purger(
                Arc::clone(ledger),
                self.config.receipts.cleanup_interval,
                self.config.receipts.ttl,
            ));
        }
        let receipt_sweeper = self
            .receipts
            .start_sweeper(self.config.receipts.cleanup_interval);

        BackgroundTasks {
            receipts: Arc::clone(&self.receipts),
            receipt_sweeper,
            handles,
        }
    }
}

/// Forget spent nonces once any receipt they bought has expired.
fn start_nonce_purger(
    ledger: Arc<dyn NonceLedger>,
    interval: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = ledger.purge_expired(max_age);
            if purged > 0 {
                tracing::debug!(purged, "purged spent nonces");
            }
        }
    })
}

/// Handles to the maintenance tasks started by
/// [`AppState::start_background_tasks`].
pub struct BackgroundTasks {
    receipts: Arc<ReceiptStore>,
    receipt_sweeper: JoinHandle<()>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Stop all tasks, then run one last receipt sweep.
    pub fn shutdown(self) {
        self.receipt_sweeper.abort();
        for handle in self.handles {
            handle.abort();
        }
        let removed = self.receipts.sweep();
        tracing::info!(
            removed,
            remaining = self.receipts.len(),
            "receipt store swept at shutdown"
        );
    }
}
