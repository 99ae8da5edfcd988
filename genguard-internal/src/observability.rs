//! Logs and metrics setup for the gateway process.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "genguard_internal=info,gateway=info,warn";
const DEBUG_LOG_FILTER: &str = "genguard_internal=debug,gateway=debug,warn";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Lets the gateway raise the log level once the config file has been read.
pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
    /// `RUST_LOG` always wins over the config file
    from_env: bool,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        if self.from_env {
            tracing::info!("`RUST_LOG` is set, ignoring `gateway.debug` for log filtering");
            return Ok(());
        }
        self.handle
            .modify(|filter| *filter = EnvFilter::new(DEBUG_LOG_FILTER))
            .map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

pub fn setup_observability(log_format: LogFormat) -> Result<DelayedDebugLogs, Error> {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LOG_FILTER), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter);
    let result = match log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    result.map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to initialize tracing subscriber: {e}"),
        })
    })?;

    Ok(DelayedDebugLogs { handle, from_env })
}

/// Installs the global Prometheus recorder. The returned handle renders the scrape body.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to install Prometheus metrics recorder: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "genguard_admission_checks_total",
        "Admission checks, by resulting status"
    );
    metrics::describe_counter!(
        "genguard_usage_recorded_total",
        "Usage events recorded, by tier"
    );
    metrics::describe_counter!("genguard_bans_issued_total", "Abuse bans issued");
    metrics::describe_counter!(
        "genguard_cooldowns_issued_total",
        "Cooldowns imposed, by tier"
    );
    metrics::describe_counter!(
        "genguard_boost_redemptions_total",
        "Boost redemption attempts, by outcome"
    );
}
