use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::authorize_admin;
use crate::boost::{BoostGrant, BoostStatus, RedeemOutcome};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, StructuredJson};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddBoostParams {
    pub amount: i64,
    #[serde(default)]
    pub reason: String,
    /// Overrides the admin id header for the audit trail
    #[serde(default)]
    pub admin_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddBoostResponse {
    pub new_balance: u64,
}

pub async fn boost_status_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<BoostStatus>, Error> {
    Ok(Json(app_state.controller.boost_status(&user_id)?))
}

/// A zero balance is reported in the body (`success: false`), never as an error status.
pub async fn redeem_boost_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<RedeemOutcome>, Error> {
    Ok(Json(app_state.controller.redeem_boost(&user_id).await?))
}

pub async fn add_boost_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    StructuredJson(params): StructuredJson<AddBoostParams>,
) -> Result<Json<AddBoostResponse>, Error> {
    let header_admin_id = authorize_admin(&app_state, &headers)?;
    let admin_id = params
        .admin_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or(header_admin_id)
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "An admin id is required to grant boost credits".to_string(),
            })
        })?;
    let new_balance = app_state
        .controller
        .add_boost(&user_id, params.amount, &params.reason, &admin_id)
        .await?;
    Ok(Json(AddBoostResponse { new_balance }))
}

pub async fn list_grants_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<BoostGrant>>, Error> {
    authorize_admin(&app_state, &headers)?;
    Ok(Json(app_state.controller.boost_grants(&user_id)?))
}
