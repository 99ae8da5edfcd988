use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Deserialize;

use super::admission::identity_from_request;
use super::header_str;
use crate::admission::{UsageReceipt, UsageRecord};
use crate::error::Error;
use crate::gateway_util::{AppState, StructuredJson};
use crate::tier::Tier;
use crate::usage::UsageStats;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordUsageParams {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub batch_weight: f64,
    pub tier: Tier,
    #[serde(default)]
    pub ideas_count: u32,
    /// Falls back to the `User-Agent` request header
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub boost_applied: bool,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub is_campaign: bool,
}

pub async fn record_usage_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    StructuredJson(params): StructuredJson<RecordUsageParams>,
) -> Result<Json<UsageReceipt>, Error> {
    let user_agent = params
        .user_agent
        .or_else(|| header_str(&headers, header::USER_AGENT.as_str()).map(str::to_string));
    let identity =
        identity_from_request(params.user_id, params.ip_address, params.session_id, &headers);
    let receipt = app_state
        .controller
        .record_usage(UsageRecord {
            identity,
            weight: params.batch_weight,
            tier: params.tier,
            ideas_count: params.ideas_count,
            user_agent,
            boost_applied: params.boost_applied,
            direction: params.direction,
            is_campaign: params.is_campaign,
        })
        .await?;
    Ok(Json(receipt))
}

pub async fn hourly_stats_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<UsageStats>, Error> {
    Ok(Json(app_state.controller.hourly_stats(&user_id)?))
}

pub async fn daily_stats_handler(
    State(app_state): AppState,
    Path(user_id): Path<String>,
) -> Result<Json<UsageStats>, Error> {
    Ok(Json(app_state.controller.daily_stats(&user_id)?))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Duration;
    use serde_json::json;

    use crate::endpoints::test_helpers::{get_request, json_request, send};
    use crate::gateway_util::build_router;
    use crate::identity::Identity;
    use crate::settings::Settings;
    use crate::testing::get_unit_test_app_state_data;

    #[tokio::test]
    async fn test_record_usage_and_read_stats() {
        let (state, clock) = get_unit_test_app_state_data(Settings::default(), None);
        let router = build_router(state);

        for weight in [1.0, 1.0, 0.25] {
            let request = json_request(
                "POST",
                "/v1/usage",
                json!({
                    "user_id": "u-stats",
                    "ip_address": "10.1.1.1",
                    "batch_weight": weight,
                    "tier": "A",
                    "ideas_count": 5,
                }),
            );
            let (status, body, _) = send(&router, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["tier"], "A");
            assert!(body["event_id"].is_string());
        }

        let (status, body, _) = send(&router, get_request("/v1/usage/u-stats/hourly")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2.25);
        assert_eq!(body["limit"], 20.0);
        assert_eq!(body["remaining"], 17.75);
        assert_eq!(body["window_seconds"], 3600);
        assert_eq!(body["resets_in_seconds"], serde_json::Value::Null);

        // An hour later the hourly window is empty but the day still counts
        clock.advance(Duration::minutes(61));
        let (_, body, _) = send(&router, get_request("/v1/usage/u-stats/hourly")).await;
        assert_eq!(body["count"], 0.0);
        let (status, body, _) = send(&router, get_request("/v1/usage/u-stats/daily")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2.25);
        assert_eq!(body["limit"], 100.0);
        assert_eq!(body["window_seconds"], 86400);
    }

    #[tokio::test]
    async fn test_user_agent_header_is_recorded() {
        let (state, _) = get_unit_test_app_state_data(Settings::default(), None);
        let controller = state.controller.clone();
        let router = build_router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/v1/usage")
            .header("user-agent", "ideas-web/2.1")
            .header("x-real-ip", "198.51.100.20")
            .body(Body::from(
                json!({"batch_weight": 1.0, "tier": "B", "is_campaign": true}).to_string(),
            ))
            .unwrap();
        let (status, body, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tier"], "B");

        let events = controller
            .usage_events(&Identity::anonymous("198.51.100.20", None))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].metadata.user_agent.as_deref(),
            Some("ideas-web/2.1")
        );
        assert!(events[0].metadata.is_campaign);
        assert_eq!(events[0].ideas_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_usage_is_rejected() {
        let (state, _) = get_unit_test_app_state_data(Settings::default(), None);
        let router = build_router(state);

        let request = json_request(
            "POST",
            "/v1/usage",
            json!({"user_id": "u-bad", "batch_weight": -1.0, "tier": "A"}),
        );
        let (status, _, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = json_request(
            "POST",
            "/v1/usage",
            json!({"user_id": "u-bad", "batch_weight": 1.0, "tier": "D"}),
        );
        let (status, body, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("tier"));

        let request = json_request("POST", "/v1/usage", json!({"user_id": "u-bad", "tier": "A"}));
        let (status, body, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("batch_weight"));

        // Nothing was recorded
        let (_, body, _) = send(&router, get_request("/v1/usage/u-bad/hourly")).await;
        assert_eq!(body["count"], 0.0);
    }

    #[tokio::test]
    async fn test_unknown_user_stats_are_empty() {
        let (state, _) = get_unit_test_app_state_data(Settings::default(), None);
        let router = build_router(state);
        let (status, body, _) = send(&router, get_request("/v1/usage/nobody/daily")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0.0);
        assert_eq!(body["remaining"], 100.0);
    }
}
