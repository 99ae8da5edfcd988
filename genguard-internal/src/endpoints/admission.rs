use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::admission::AdmissionDecision;
use crate::error::Error;
use crate::gateway_util::{get_client_ip_from_headers, AppState, StructuredJson};
use crate::identity::Identity;

pub const STATUS_HEADER: &str = "x-genguard-status";
pub const TIER_HEADER: &str = "x-genguard-tier";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionCheckParams {
    #[serde(default)]
    pub user_id: Option<String>,
    /// Falls back to the proxy headers when absent
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Resolve the caller's identity from body fields, falling back to proxy headers for the IP.
pub(crate) fn identity_from_request(
    user_id: Option<String>,
    ip_address: Option<String>,
    session_id: Option<String>,
    headers: &HeaderMap,
) -> Identity {
    let ip_address = ip_address
        .filter(|ip| !ip.trim().is_empty())
        .unwrap_or_else(|| get_client_ip_from_headers(headers));
    Identity::new(user_id, ip_address, session_id)
}

fn decision_headers(decision: &AdmissionDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();

    // Status names and numbers always produce valid header values
    if let Ok(value) = HeaderValue::from_str(&decision.status.to_string()) {
        headers.insert(STATUS_HEADER, value);
    }

    if let Some(tier) = decision.tier {
        if let Ok(value) = HeaderValue::from_str(&tier.to_string()) {
            headers.insert(TIER_HEADER, value);
        }
    }

    if !decision.can_generate {
        if let Some(seconds) = decision.cooldown_seconds {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                headers.insert(axum::http::header::RETRY_AFTER, value);
            }
        }
    }

    headers
}

/// Answers 200 when the caller may generate and 429 with the blocking status otherwise.
pub async fn check_admission_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    StructuredJson(params): StructuredJson<AdmissionCheckParams>,
) -> Result<Response, Error> {
    let identity =
        identity_from_request(params.user_id, params.ip_address, params.session_id, &headers);
    let decision = app_state.controller.check_admission(&identity).await?;

    let status = if decision.can_generate {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, decision_headers(&decision), Json(decision)).into_response())
}
