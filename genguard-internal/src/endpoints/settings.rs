use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{Map, Value};

use crate::endpoints::authorize_admin;
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::settings::SettingsSnapshot;

pub async fn get_settings_handler(State(app_state): AppState) -> Json<Arc<SettingsSnapshot>> {
    Json(app_state.controller.settings().get())
}

/// Admin-only partial update. Keys outside the allow-list are ignored.
pub async fn update_settings_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    StructuredJson(partial): StructuredJson<Map<String, Value>>,
) -> Result<Json<Arc<SettingsSnapshot>>, Error> {
    let admin_id = authorize_admin(&app_state, &headers)?;
    let snapshot = app_state.update_settings(&partial).await?;
    tracing::info!(
        admin_id = admin_id.as_deref().unwrap_or("unknown"),
        version = snapshot.version,
        "Settings updated through the API"
    );
    Ok(Json(snapshot))
}
