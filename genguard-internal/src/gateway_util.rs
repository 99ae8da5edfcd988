use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::admin::AdminAuthenticator;
use crate::admission::AdmissionController;
use crate::clock::SystemClock;
use crate::config_parser::Config;
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::identity::UNKNOWN_IP;
use crate::random::StdRandomSource;
use crate::redis_client::SettingsSync;
use crate::settings::{SettingsSnapshot, SettingsStore};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub controller: Arc<AdmissionController>,
    pub admin: AdminAuthenticator,
    pub settings_sync: Option<SettingsSync>,
    pub metrics_handle: Option<PrometheusHandle>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        let clock = Arc::new(SystemClock);
        let store = SettingsStore::new(config.governance.clone(), clock.clone())?;
        let controller = AdmissionController::new(
            Arc::new(store),
            clock,
            Arc::new(StdRandomSource::from_entropy()),
        );
        let admin = AdminAuthenticator::from_env(&config.gateway.admin.api_key_env);
        Ok(Self {
            config,
            controller: Arc::new(controller),
            admin,
            settings_sync: None,
            metrics_handle: None,
        })
    }

    #[cfg(test)]
    pub fn new_for_tests(
        config: Arc<Config>,
        controller: Arc<AdmissionController>,
        admin_key: Option<secrecy::SecretString>,
    ) -> Self {
        Self {
            config,
            controller,
            admin: AdminAuthenticator::new(admin_key, "GENGUARD_ADMIN_KEY"),
            settings_sync: None,
            metrics_handle: None,
        }
    }

    pub fn with_metrics_handle(mut self, metrics_handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(metrics_handle);
        self
    }

    /// Connects to Redis when `gateway.redis.enabled` is set: loads the persisted settings
    /// and starts following updates from other replicas.
    pub async fn with_settings_sync(mut self) -> Result<Self, Error> {
        let Some(url) = self.config.gateway.redis.resolve_url()? else {
            tracing::info!("Redis settings sync disabled");
            return Ok(self);
        };
        let sync = SettingsSync::connect(&url).await?;
        let store = Arc::clone(self.controller.settings());
        if sync.load_into(&store).await? {
            tracing::info!(version = store.version(), "Loaded governance settings from Redis");
        }
        sync.spawn_listener(store);
        self.settings_sync = Some(sync);
        Ok(self)
    }

    /// Apply a partial settings update locally, then replicate it if Redis sync is on.
    pub async fn update_settings(
        &self,
        partial: &Map<String, Value>,
    ) -> Result<Arc<SettingsSnapshot>, Error> {
        let store = self.controller.settings();
        let Some(sync) = &self.settings_sync else {
            return store.update(partial);
        };
        let version = sync.allocate_version(store.version() + 1).await?;
        let snapshot = store.update_at(partial, Some(version))?;
        sync.publish(&snapshot).await?;
        Ok(snapshot)
    }
}

/// Best-effort client address from proxy headers.
pub fn get_client_ip_from_headers(headers: &HeaderMap) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // X-Forwarded-For can contain multiple IPs, take the first one
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            if !ip_str.trim().is_empty() {
                return ip_str.trim().to_string();
            }
        }
    }

    UNKNOWN_IP.to_string()
}

/// Periodically drops expired bans, cooldowns, lapsed holds, aged-out usage and idle identity locks.
pub fn spawn_housekeeping(controller: Arc<AdmissionController>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = controller.prune(controller.now());
            tracing::debug!(?report, "Housekeeping pass complete");
        }
    })
}

pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route("/health", get(endpoints::status::health_handler))
        .route("/metrics", get(endpoints::status::metrics_handler))
        .route(
            "/v1/settings",
            get(endpoints::settings::get_settings_handler)
                .patch(endpoints::settings::update_settings_handler),
        )
        .route(
            "/v1/admission/check",
            post(endpoints::admission::check_admission_handler),
        )
        .route("/v1/usage", post(endpoints::usage::record_usage_handler))
        .route(
            "/v1/usage/{user_id}/hourly",
            get(endpoints::usage::hourly_stats_handler),
        )
        .route(
            "/v1/usage/{user_id}/daily",
            get(endpoints::usage::daily_stats_handler),
        )
        .route("/v1/boost/{user_id}", get(endpoints::boost::boost_status_handler))
        .route(
            "/v1/boost/{user_id}/redeem",
            post(endpoints::boost::redeem_boost_handler),
        )
        .route(
            "/v1/boost/{user_id}/grants",
            post(endpoints::boost::add_boost_handler).get(endpoints::boost::list_grants_handler),
        )
        .method_not_allowed_fallback(endpoints::fallback::handle_405)
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state)
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        let value = Json::<Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}
