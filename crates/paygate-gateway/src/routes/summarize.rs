//! `POST /api/ai/summarize`: the paid endpoint.
//!
//! Order of checks: payment headers (402), body size (413), JSON and text
//! (400), cache lookup, signature verification (403/500/504), optional
//! single-use nonce claim (409), then the cached or freshly generated
//! summary with a signed receipt. A fresh summary is cached only once the
//! receipt for it has been issued.

use std::sync::Arc;

use actix_web::http::header::CONTENT_LENGTH;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use paygate::nonce_store::NonceLedger;
use paygate::{NONCE_HEADER, RECEIPT_HEADER, SIGNATURE_HEADER};
use serde::Deserialize;

use crate::cache::cache_key;
use crate::error::GatewayError;
use crate::metrics::NONCE_REPLAYS;
use crate::middleware::CorrelationId;
use crate::state::AppState;
use crate::timeout::{bounded, RequestDeadline};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct SummarizeRequest {
    pub text: String,
}

/// Read the whole body, refusing anything over `limit` bytes. A declared
/// `Content-Length` is checked before a single byte is read.
pub async fn read_body_limited(
    req: &HttpRequest,
    mut payload: web::Payload,
    limit: usize,
) -> Result<Bytes, GatewayError> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(GatewayError::PayloadTooLarge);
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| GatewayError::BodyRead(e.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// A nonce claimed in the spent-nonce ledger. Dropping it without
/// [`NonceClaim::commit`] releases the nonce so the payer can retry.
struct NonceClaim {
    ledger: Arc<dyn NonceLedger>,
    nonce: String,
    committed: bool,
}

impl NonceClaim {
    fn acquire(ledger: Option<&Arc<dyn NonceLedger>>, nonce: &str) -> Result<Option<Self>, GatewayError> {
        let Some(ledger) = ledger else {
            return Ok(None);
        };
        if !ledger.try_claim(nonce) {
            NONCE_REPLAYS.inc();
            return Err(GatewayError::NonceReused);
        }
        Ok(Some(Self {
            ledger: Arc::clone(ledger),
            nonce: nonce.to_string(),
            committed: false,
        }))
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for NonceClaim {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.release(&self.nonce);
        }
    }
}

pub async fn summarize(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let correlation_id = CorrelationId::of(&req);
    let cid = correlation_id.as_deref();
    let deadline = RequestDeadline::of(&req);

    let (Some(signature), Some(nonce)) = (header(&req, SIGNATURE_HEADER), header(&req, NONCE_HEADER))
    else {
        let challenge = state.verifier.challenge();
        tracing::debug!(correlation_id = cid, nonce = %challenge.nonce, "issuing payment challenge");
        return Err(GatewayError::PaymentRequired(Box::new(challenge)));
    };

    let request_body = read_body_limited(&req, payload, MAX_BODY_BYTES).await?;
    let parsed: SummarizeRequest =
        serde_json::from_slice(&request_body).map_err(|_| GatewayError::InvalidBody)?;
    if parsed.text.is_empty() {
        return Err(GatewayError::EmptyText);
    }

    let key = cache_key(&parsed.text, state.summarizer.model());
    let cached = match state.cache {
        Some(ref cache) => cache.lookup(deadline, &key).await,
        None => None,
    };

    // A cache hit is served only to a caller whose payment checks out.
    let (verdict, ctx) = state
        .verifier
        .verify(deadline, signature, nonce, cid)
        .await?;
    if !verdict.is_valid {
        tracing::info!(correlation_id = cid, "rejected invalid payment signature");
        return Err(GatewayError::InvalidSignature(verdict.error));
    }
    let payer = verdict.recovered_address.unwrap_or_default();

    let claim = NonceClaim::acquire(state.nonces.as_ref(), nonce)?;

    let (result, fresh) = match cached {
        Some(hit) => {
            tracing::info!(correlation_id = cid, key = %key, "cache HIT");
            (hit.result, false)
        }
        None => {
            let summary = bounded(
                deadline,
                state.config.timeouts.ai,
                state.summarizer.summarize(&parsed.text, cid),
            )
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)??;
            (summary, true)
        }
    };

    // Past the deadline the guard has already answered 504, so nothing is
    // recorded for this request.
    if deadline.is_some_and(|d| d.is_expired()) {
        tracing::warn!(correlation_id = cid, "deadline passed before receipt, abandoning request");
        return Err(GatewayError::UpstreamTimeout);
    }

    // The receipt hashes exactly these bytes, so they are what gets sent.
    let response_body = serde_json::to_vec(&serde_json::json!({ "result": result }))
        .map_err(|e| GatewayError::Internal(format!("failed to encode response: {e}")))?;
    let receipt = state
        .receipts
        .issue(&ctx, &payer, req.path(), &request_body, &response_body)?;
    let receipt_header = receipt.to_header_value()?;

    if let Some(claim) = claim {
        claim.commit();
    }
    if fresh {
        if let Some(ref cache) = state.cache {
            cache.store_detached(key, result);
        }
    }
    tracing::info!(
        correlation_id = cid,
        receipt_id = %receipt.receipt.id,
        payer = %payer,
        "served paid request"
    );

    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .insert_header((RECEIPT_HEADER, receipt_header))
        .body(response_body))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/summarize", web::post().to(summarize));
}
