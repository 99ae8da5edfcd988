//! Live governance configuration.
//!
//! Readers take an immutable [`SettingsSnapshot`] per decision; writers merge a partial
//! update onto the current snapshot, validate the result, and swap it in whole.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::error::{Error, ErrorDetails};
use crate::tier::Tier;

/// The only keys `update` will accept. Anything else is dropped silently.
pub const SETTINGS_KEYS: &[&str] = &[
    "hourly_batch_limit",
    "daily_batch_limit",
    "soft_warning_threshold",
    "tier_a_max",
    "tier_b_max",
    "cooldown_tier_a_min",
    "cooldown_tier_a_max",
    "cooldown_tier_b_min",
    "cooldown_tier_b_max",
    "cooldown_tier_c_min",
    "cooldown_tier_c_max",
    "boost_tier_a_batches",
    "abuse_request_threshold",
    "abuse_window_seconds",
    "abuse_sustained_seconds",
    "abuse_ban_minutes_min",
    "abuse_ban_minutes_max",
    "model_tier_a",
    "model_tier_b",
    "model_tier_c",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Batches per rolling hour before `hourly_limit`
    pub hourly_batch_limit: f64,
    /// Batches per rolling 24h before `daily_limit`
    pub daily_batch_limit: f64,
    /// Distance below the hourly limit at which the soft warning starts
    pub soft_warning_threshold: f64,
    pub tier_a_max: f64,
    pub tier_b_max: f64,
    // Cooldown bounds are in seconds
    pub cooldown_tier_a_min: u64,
    pub cooldown_tier_a_max: u64,
    pub cooldown_tier_b_min: u64,
    pub cooldown_tier_b_max: u64,
    pub cooldown_tier_c_min: u64,
    pub cooldown_tier_c_max: u64,
    /// Forced Tier-A batches granted by one boost redemption
    pub boost_tier_a_batches: u32,
    pub abuse_request_threshold: u32,
    pub abuse_window_seconds: u64,
    pub abuse_sustained_seconds: u64,
    pub abuse_ban_minutes_min: u64,
    pub abuse_ban_minutes_max: u64,
    pub model_tier_a: String,
    pub model_tier_b: String,
    pub model_tier_c: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hourly_batch_limit: 20.0,
            daily_batch_limit: 100.0,
            soft_warning_threshold: 3.0,
            tier_a_max: 6.0,
            tier_b_max: 14.0,
            cooldown_tier_a_min: 10,
            cooldown_tier_a_max: 30,
            cooldown_tier_b_min: 30,
            cooldown_tier_b_max: 90,
            cooldown_tier_c_min: 90,
            cooldown_tier_c_max: 240,
            boost_tier_a_batches: 3,
            abuse_request_threshold: 60,
            abuse_window_seconds: 60,
            abuse_sustained_seconds: 30,
            abuse_ban_minutes_min: 15,
            abuse_ban_minutes_max: 60,
            model_tier_a: "claude-sonnet-4-5".to_string(),
            model_tier_b: "claude-haiku-4-5".to_string(),
            model_tier_c: "claude-3-5-haiku-latest".to_string(),
        }
    }
}

/// Upper bound on every duration setting: one year, in seconds.
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;
const MAX_BAN_MINUTES: u64 = MAX_DURATION_SECONDS / 60;

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::InvalidSettings {
        message: message.into(),
    })
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        let counts = [
            ("hourly_batch_limit", self.hourly_batch_limit),
            ("daily_batch_limit", self.daily_batch_limit),
            ("soft_warning_threshold", self.soft_warning_threshold),
            ("tier_a_max", self.tier_a_max),
            ("tier_b_max", self.tier_b_max),
        ];
        for (key, value) in counts {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "`{key}` must be a finite, non-negative number (got {value})"
                )));
            }
        }

        for tier in [Tier::A, Tier::B, Tier::C] {
            let (min, max) = self.cooldown_range(tier);
            if min > max {
                return Err(invalid(format!(
                    "`cooldown_tier_{tier}_min` ({min}) must not exceed `cooldown_tier_{tier}_max` ({max})",
                    tier = tier.key_suffix()
                )));
            }
        }

        let durations = [
            ("cooldown_tier_a_max", self.cooldown_tier_a_max, MAX_DURATION_SECONDS),
            ("cooldown_tier_b_max", self.cooldown_tier_b_max, MAX_DURATION_SECONDS),
            ("cooldown_tier_c_max", self.cooldown_tier_c_max, MAX_DURATION_SECONDS),
            ("abuse_window_seconds", self.abuse_window_seconds, MAX_DURATION_SECONDS),
            ("abuse_sustained_seconds", self.abuse_sustained_seconds, MAX_DURATION_SECONDS),
            ("abuse_ban_minutes_max", self.abuse_ban_minutes_max, MAX_BAN_MINUTES),
        ];
        for (key, value, max) in durations {
            if value > max {
                return Err(invalid(format!(
                    "`{key}` must not exceed {max} (one year), got {value}"
                )));
            }
        }

        if self.abuse_ban_minutes_min > self.abuse_ban_minutes_max {
            return Err(invalid(format!(
                "`abuse_ban_minutes_min` ({}) must not exceed `abuse_ban_minutes_max` ({})",
                self.abuse_ban_minutes_min, self.abuse_ban_minutes_max
            )));
        }

        if self.tier_a_max > self.tier_b_max || self.tier_b_max > self.hourly_batch_limit {
            return Err(invalid(format!(
                "tier thresholds must satisfy tier_a_max ({}) <= tier_b_max ({}) <= hourly_batch_limit ({})",
                self.tier_a_max, self.tier_b_max, self.hourly_batch_limit
            )));
        }

        for tier in [Tier::A, Tier::B, Tier::C] {
            if self.model_for(tier).trim().is_empty() {
                return Err(invalid(format!(
                    "`model_tier_{}` must not be empty",
                    tier.key_suffix()
                )));
            }
        }

        Ok(())
    }

    /// Cooldown bounds in seconds for an identity newly placed in `tier`.
    pub fn cooldown_range(&self, tier: Tier) -> (u64, u64) {
        match tier {
            Tier::A => (self.cooldown_tier_a_min, self.cooldown_tier_a_max),
            Tier::B => (self.cooldown_tier_b_min, self.cooldown_tier_b_max),
            Tier::C => (self.cooldown_tier_c_min, self.cooldown_tier_c_max),
        }
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::A => &self.model_tier_a,
            Tier::B => &self.model_tier_b,
            Tier::C => &self.model_tier_c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Bumped on every committed write
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub settings: Settings,
}

impl SettingsSnapshot {
    /// Whether `self` should replace `other`. Orders by version, then write time, then
    /// content, so replicas that see the same snapshots settle on the same one.
    pub fn supersedes(&self, other: &SettingsSnapshot) -> bool {
        (self.version, self.updated_at)
            .cmp(&(other.version, other.updated_at))
            .then_with(|| content_key(&self.settings).cmp(&content_key(&other.settings)))
            .is_gt()
    }
}

fn content_key(settings: &Settings) -> String {
    serde_json::to_string(settings).unwrap_or_default()
}

pub struct SettingsStore {
    current: ArcSwap<SettingsSnapshot>,
    /// Serializes writers so a read-merge-swap never loses a concurrent update.
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SettingsStore {
    pub fn new(initial: Settings, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        initial.validate()?;
        let snapshot = SettingsSnapshot {
            version: 1,
            updated_at: clock.now(),
            settings: initial,
        };
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
            clock,
        })
    }

    pub fn get(&self) -> Arc<SettingsSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Merge `partial` onto the current settings. Unknown keys are dropped; an update with
    /// no known keys, a mistyped value, or a result that breaks an invariant is rejected
    /// without touching the stored snapshot.
    pub fn update(&self, partial: &Map<String, Value>) -> Result<Arc<SettingsSnapshot>, Error> {
        self.update_at(partial, None)
    }

    /// [`update`](Self::update) committed at `allocated_version` when one was handed out by
    /// the replication layer. The version never goes backwards.
    pub fn update_at(
        &self,
        partial: &Map<String, Value>,
        allocated_version: Option<u64>,
    ) -> Result<Arc<SettingsSnapshot>, Error> {
        let filtered: Map<String, Value> = partial
            .iter()
            .filter(|(key, _)| SETTINGS_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if filtered.len() < partial.len() {
            let ignored: Vec<&str> = partial
                .keys()
                .filter(|key| !filtered.contains_key(*key))
                .map(String::as_str)
                .collect();
            tracing::debug!(?ignored, "Dropping unknown settings keys");
        }

        if filtered.is_empty() {
            return Err(invalid("update contains no recognized settings keys"));
        }

        // The guarded value is `()`, so a poisoned lock carries no broken state.
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        let mut merged = match serde_json::to_value(&current.settings) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(Error::new(ErrorDetails::Serialization {
                    message: "Failed to serialize current settings".to_string(),
                }))
            }
        };
        for (key, value) in filtered {
            merged.insert(key, value);
        }

        let candidate: Settings = serde_path_to_error::deserialize(Value::Object(merged))
            .map_err(|e| invalid(e.to_string()))?;
        candidate.validate()?;

        let next_version = current.version + 1;
        let snapshot = Arc::new(SettingsSnapshot {
            version: allocated_version.map_or(next_version, |v| v.max(next_version)),
            updated_at: self.clock.now(),
            settings: candidate,
        });
        self.current.store(Arc::clone(&snapshot));
        tracing::info!(version = snapshot.version, "Governance settings updated");
        Ok(snapshot)
    }

    /// Install a snapshot written by another replica. Returns `false` if it does not
    /// supersede what this store already holds.
    pub fn apply_remote(&self, snapshot: SettingsSnapshot) -> Result<bool, Error> {
        snapshot.settings.validate()?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !snapshot.supersedes(&self.current.load()) {
            return Ok(false);
        }
        tracing::info!(version = snapshot.version, "Applied governance settings from remote");
        self.current.store(Arc::new(snapshot));
        Ok(true)
    }
}
