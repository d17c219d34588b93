use actix_web::{web, HttpResponse};

use crate::error::GatewayError;
use crate::state::AppState;

/// GET /api/receipts/{id}
pub async fn get_receipt(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let id = path.into_inner();
    let signed = state.receipts.get(&id).ok_or(GatewayError::ReceiptNotFound)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "receipt": signed.receipt,
        "signature": signed.signature,
        "server_public_key": signed.server_public_key,
        "status": "valid",
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/receipts/{id}", web::get().to(get_receipt));
}
