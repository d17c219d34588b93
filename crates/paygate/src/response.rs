use serde::{Deserialize, Serialize};

/// Verifier answer for one signature check.
///
/// `is_valid = false` is a normal negative result, not a transport failure;
/// `error` then carries the verifier's explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub is_valid: bool,
    pub recovered_address: Option<String>,
    pub error: Option<String>,
}

impl VerifyResponse {
    pub fn valid(recovered_address: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            recovered_address: Some(recovered_address.into()),
            error: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            recovered_address: None,
            error: Some(reason.into()),
        }
    }
}
