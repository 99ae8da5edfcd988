use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use genguard_internal::config_parser::Config;
use genguard_internal::endpoints::status::GENGUARD_VERSION;
use genguard_internal::gateway_util;
use genguard_internal::observability::{self, LogFormat};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `genguard.toml` config file at the specified path. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use the built-in default configuration. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

async fn add_version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "x-genguard-gateway-version",
        HeaderValue::from_static(GENGUARD_VERSION),
    );
    response
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    let delayed_debug_logs =
        observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting GenGuard gateway {GENGUARD_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    if args.config_file.is_none() && !args.default_config {
        tracing::error!(
            "No configuration specified. Use `--config-file path/to/genguard.toml` or `--default-config`."
        );
        std::process::exit(1);
    }

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_from_path(Path::new(path))
                .ok() // Don't print the error here, since it was already printed when it was constructed
                .expect_pretty("Failed to load config"),
        )
    } else {
        tracing::info!("Using the default configuration");
        Arc::new(Config::default())
    };

    if config.gateway.debug {
        delayed_debug_logs
            .enable_debug()
            .expect_pretty("Failed to enable debug logs");
    }

    let app_state = gateway_util::AppStateData::new(config.clone())
        .expect_pretty("Failed to initialize AppState")
        .with_settings_sync()
        .await
        .expect_pretty("Failed to set up Redis settings sync")
        .with_metrics_handle(metrics_handle);

    let redis_enabled_pretty = if app_state.settings_sync.is_some() {
        "enabled"
    } else {
        "disabled"
    };
    let admin_enabled_pretty = if app_state.admin.is_configured() {
        "configured"
    } else {
        "not configured"
    };

    gateway_util::spawn_housekeeping(
        app_state.controller.clone(),
        Duration::from_secs(config.gateway.housekeeping_interval_secs),
    );

    let router = gateway_util::build_router(app_state)
        .layer(axum::middleware::from_fn(add_version_header))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        // We log failed requests messages at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)));

    let bind_address = config.gateway.bind_address();
    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "the default config".to_string()
    };

    tracing::info!(
        "GenGuard gateway is listening on {actual_bind_address} with {config_path_pretty}, Redis settings sync {redis_enabled_pretty}, and admin credential {admin_enabled_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = hangup => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// Initialization-only escape hatch: logs `msg` with the error and exits with status 1.
/// Everything after startup propagates errors instead.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
