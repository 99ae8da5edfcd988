use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    /// Wraps a failed call to the external model provider. Governance never retries these;
    /// the provider's status code is passed through to the caller.
    pub fn upstream(
        provider: impl Into<String>,
        status_code: Option<StatusCode>,
        message: impl Into<String>,
    ) -> Self {
        Error::new(ErrorDetails::Upstream {
            provider: provider.into(),
            status_code,
            message: message.into(),
        })
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn to_response_json(&self) -> (StatusCode, Value) {
        match self.get_details() {
            ErrorDetails::Upstream { provider, .. } => (
                self.status_code(),
                json!({"error": self.to_string(), "provider": provider}),
            ),
            // Never echo internal detail back to the caller; it was logged on construction.
            ErrorDetails::InternalError { .. } | ErrorDetails::Serialization { .. } => (
                self.status_code(),
                json!({"error": "Internal server error"}),
            ),
            _ => (self.status_code(), json!({"error": self.to_string()})),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AdminUnauthorized {
        admin_id: Option<String>,
    },
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidBoostAmount {
        amount: i64,
    },
    InvalidRequest {
        message: String,
    },
    InvalidSettings {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    MethodNotAllowed {
        method: String,
        path: String,
    },
    MissingIdentity,
    RouteNotFound {
        path: String,
    },
    Serialization {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
    Upstream {
        provider: String,
        status_code: Option<StatusCode>,
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AdminUnauthorized { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidBoostAmount { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidSettings { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::MethodNotAllowed { .. } => tracing::Level::WARN,
            ErrorDetails::MissingIdentity => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::Upstream { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AdminUnauthorized { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidBoostAmount { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InvalidSettings { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ErrorDetails::MissingIdentity => StatusCode::BAD_REQUEST,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Upstream { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AdminUnauthorized { admin_id } => match admin_id {
                Some(admin_id) => write!(f, "Admin authorization failed for `{admin_id}`"),
                None => write!(f, "Admin authorization failed"),
            },
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidBoostAmount { amount } => {
                write!(f, "Boost amount must be at least 1, got {amount}")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::InvalidSettings { message } => {
                write!(f, "Invalid settings: {message}")
            }
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::MethodNotAllowed { method, path } => {
                write!(f, "Method `{method}` is not allowed for `{path}`")
            }
            ErrorDetails::MissingIdentity => write!(
                f,
                "Request is missing an identity: provide a user id or an IP address"
            ),
            ErrorDetails::RouteNotFound { path } => write!(f, "Route not found: {path}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Backing store unavailable: {message}")
            }
            ErrorDetails::Upstream {
                provider,
                status_code,
                message,
            } => match status_code {
                Some(status_code) => write!(
                    f,
                    "Error from model provider `{provider}` ({status_code}): {message}"
                ),
                None => write!(f, "Error from model provider `{provider}`: {message}"),
            },
        }
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
