pub mod abuse; // sustained-rate abuse detection and temporary bans
pub mod admin; // admin credential checks
pub mod admission; // admission checks and usage recording
pub mod boost; // boost credits and redemptions
pub mod clock;
pub mod config_parser; // gateway config file
pub mod cooldown; // post-usage cooldowns
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod identity;
pub mod observability; // utilities for observability (logs, metrics, etc.)
pub mod random;
pub mod redis_client; // redis settings replication
pub mod reservation; // holds on admitted, unrecorded generations
pub mod settings; // live governance settings
mod testing;
pub mod tier; // tier classification
pub mod usage; // rolling usage windows
