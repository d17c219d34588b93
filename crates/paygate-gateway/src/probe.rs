use serde::Serialize;

/// Reachability of a downstream dependency, as reported by `/readyz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Answered 200.
    Ok,
    /// Reachable but answered something other than 200.
    Degraded,
    /// Could not be contacted in time.
    Unreachable,
    /// Missing credentials; never contacted.
    Unconfigured,
}

impl ProbeStatus {
    pub fn is_ok(self) -> bool {
        self == ProbeStatus::Ok
    }

    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::OK {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Degraded
        }
    }
}
