use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Ledger of payment nonces that have already bought a response.
///
/// Only consulted when single-use nonces are enforced. Implementations must
/// be thread-safe (`Send + Sync`).
pub trait NonceLedger: Send + Sync {
    /// Atomically claim a nonce. Returns `false` if it was already claimed
    /// (a replay).
    fn try_claim(&self, nonce: &str) -> bool;

    /// Release a claim so the payer can retry after a failure that happened
    /// after the claim (upstream error, timeout).
    fn release(&self, nonce: &str);

    /// Forget claims older than `max_age`. Returns the number purged.
    fn purge_expired(&self, max_age: Duration) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process ledger backed by DashMap. Lost on restart.
#[derive(Default)]
pub struct InMemoryNonceLedger {
    claims: DashMap<String, Instant>,
}

impl InMemoryNonceLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceLedger for InMemoryNonceLedger {
    fn try_claim(&self, nonce: &str) -> bool {
        match self.claims.entry(nonce.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(nonce_len = nonce.len(), "nonce already claimed");
                false
            }
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    fn release(&self, nonce: &str) {
        self.claims.remove(nonce);
    }

    fn purge_expired(&self, max_age: Duration) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, claimed| claimed.elapsed() < max_age);
        before.saturating_sub(self.claims.len())
    }

    fn len(&self) -> usize {
        self.claims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_once() {
        let ledger = InMemoryNonceLedger::new();
        assert!(ledger.try_claim("n-1"));
        assert!(!ledger.try_claim("n-1"));
        assert!(ledger.try_claim("n-2"));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_release_allows_retry() {
        let ledger = InMemoryNonceLedger::new();
        assert!(ledger.try_claim("n"));
        ledger.release("n");
        assert!(ledger.try_claim("n"));
    }

    #[test]
    fn test_purge() {
        let ledger = InMemoryNonceLedger::new();
        ledger.try_claim("old");
        std::thread::sleep(Duration::from_millis(20));
        ledger.try_claim("new");
        assert_eq!(ledger.purge_expired(Duration::from_millis(10)), 1);
        assert!(!ledger.try_claim("new"));
        assert!(ledger.try_claim("old"));
    }

    #[test]
    fn test_concurrent_claims_admit_exactly_one() {
        let ledger = Arc::new(InMemoryNonceLedger::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.try_claim("contended"))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
