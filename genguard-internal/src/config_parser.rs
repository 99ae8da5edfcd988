use std::net::SocketAddr;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::settings::{Settings, SETTINGS_KEYS};

pub const DEFAULT_BIND_ADDRESS: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 3000);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Initial governance settings. Missing keys fall back to built-in defaults.
    #[serde(default)]
    pub governance: Settings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            debug: false,
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            admin: AdminConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

fn default_housekeeping_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Name of the environment variable holding the admin credential
    #[serde(default = "default_admin_key_env")]
    pub api_key_env: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_admin_key_env(),
        }
    }
}

fn default_admin_key_env() -> String {
    "GENGUARD_ADMIN_KEY".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url_env")]
    pub url_env: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url_env: default_redis_url_env(),
        }
    }
}

fn default_redis_url_env() -> String {
    "GENGUARD_REDIS_URL".to_string()
}

impl RedisConfig {
    /// The Redis URL to connect to, or `None` when Redis sync is disabled.
    pub fn resolve_url(&self) -> Result<Option<SecretString>, Error> {
        if !self.enabled {
            return Ok(None);
        }
        match std::env::var(&self.url_env) {
            Ok(url) if !url.is_empty() => Ok(Some(SecretString::from(url))),
            _ => Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "`gateway.redis.enabled` is true but environment variable `{}` is not set",
                    self.url_env
                ),
            })),
        }
    }
}

impl GatewayConfig {
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address.unwrap_or(DEFAULT_BIND_ADDRESS)
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::load_from_toml(&contents)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn load_from_toml(contents: &str) -> Result<Self, Error> {
        let table: toml::Table = contents.parse().map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file as TOML: {e}"),
            })
        })?;

        if let Some(toml::Value::Table(governance)) = table.get("governance") {
            for key in governance.keys() {
                if !SETTINGS_KEYS.contains(&key.as_str()) {
                    tracing::warn!("Ignoring unknown key `governance.{key}` in config file");
                }
            }
        }

        let config: Config =
            serde_path_to_error::deserialize(toml::Value::Table(table)).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid config file: {e}"),
                })
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.gateway.housekeeping_interval_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`gateway.housekeeping_interval_secs` must be greater than zero"
                    .to_string(),
            }));
        }
        self.governance.validate().map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid `[governance]` section: {e}"),
            })
        })
    }
}
