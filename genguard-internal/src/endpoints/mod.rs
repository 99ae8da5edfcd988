use axum::http::HeaderMap;

use crate::admin::{ADMIN_ID_HEADER, ADMIN_KEY_HEADER};
use crate::error::Error;
use crate::gateway_util::AppStateData;

pub mod admission;
pub mod boost;
pub mod fallback;
pub mod settings;
pub mod status;
pub mod usage;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Check the admin credential headers. Returns the caller's admin id, if it sent one.
pub(crate) fn authorize_admin(
    app_state: &AppStateData,
    headers: &HeaderMap,
) -> Result<Option<String>, Error> {
    let admin_id = header_str(headers, ADMIN_ID_HEADER);
    app_state
        .admin
        .authorize(header_str(headers, ADMIN_KEY_HEADER), admin_id)?;
    Ok(admin_id.map(str::to_string))
}
