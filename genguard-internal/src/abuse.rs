//! Sliding-window abuse detection over raw admission-check arrivals.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

use crate::error::Error;
use crate::identity::IdentityKey;
use crate::random::RandomSource;
use crate::settings::Settings;
use crate::usage::{duration_seconds, earlier_by, later_by, seconds_until};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BanRecord {
    pub banned_at: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub reason: String,
}

impl BanRecord {
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(now, self.until)
    }
}

#[derive(Debug, Default)]
struct ArrivalWindow {
    arrivals: VecDeque<DateTime<Utc>>,
    /// First arrival at which the window went over the threshold, reset once it drops back
    elevated_since: Option<DateTime<Utc>>,
}

impl ArrivalWindow {
    fn evict(&mut self, horizon: DateTime<Utc>) {
        while self.arrivals.front().is_some_and(|at| *at <= horizon) {
            self.arrivals.pop_front();
        }
    }
}

#[derive(Debug, Default)]
pub struct AbuseDetector {
    windows: DashMap<IdentityKey, ArrivalWindow>,
    bans: DashMap<IdentityKey, BanRecord>,
}

impl AbuseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one arrival for `key` and ban it if the rate has stayed above the threshold
    /// long enough. Returns the ban in force after this arrival, if any.
    pub fn observe(
        &self,
        key: &IdentityKey,
        now: DateTime<Utc>,
        settings: &Settings,
        random: &dyn RandomSource,
    ) -> Result<Option<BanRecord>, Error> {
        let horizon = earlier_by(now, settings.abuse_window_seconds)?;
        let sustain_for = duration_seconds(settings.abuse_sustained_seconds)?;

        let mut window = self.windows.entry(key.clone()).or_default();
        window.arrivals.push_back(now);
        window.evict(horizon);

        if let Some(ban) = self.active_ban(key, now) {
            window.elevated_since = None;
            return Ok(Some(ban));
        }

        let count = window.arrivals.len();
        if count <= settings.abuse_request_threshold as usize {
            window.elevated_since = None;
            return Ok(None);
        }

        let elevated_since = *window.elevated_since.get_or_insert(now);
        let sustained = now - elevated_since;
        if sustained < sustain_for {
            return Ok(None);
        }

        let minutes =
            random.uniform_inclusive(settings.abuse_ban_minutes_min, settings.abuse_ban_minutes_max);
        let ban = BanRecord {
            banned_at: now,
            until: later_by(now, minutes.saturating_mul(60))?,
            reason: format!(
                "{count} requests within {}s, sustained for {}s",
                settings.abuse_window_seconds,
                sustained.num_seconds()
            ),
        };
        window.elevated_since = None;
        tracing::warn!(identity = %key, minutes, reason = %ban.reason, "Identity banned for abuse");
        counter!("genguard_bans_issued_total").increment(1);
        self.bans.insert(key.clone(), ban.clone());
        Ok(Some(ban))
    }

    /// The ban on `key` at `now`, if one is still running.
    pub fn active_ban(&self, key: &IdentityKey, now: DateTime<Utc>) -> Option<BanRecord> {
        self.bans
            .get(key)
            .map(|ban| ban.clone())
            .filter(|ban| now < ban.until)
    }

    /// Drop expired bans and arrival windows with nothing left in range.
    pub fn prune(&self, now: DateTime<Utc>, settings: &Settings) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, ban| now < ban.until);
        let removed = before - self.bans.len();

        match earlier_by(now, settings.abuse_window_seconds) {
            Ok(horizon) => self.windows.retain(|_, window| {
                window.evict(horizon);
                !window.arrivals.is_empty()
            }),
            Err(e) => tracing::warn!("Skipping arrival window pruning: {e}"),
        }
        removed
    }
}
