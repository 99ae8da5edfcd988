//! Append-only usage ledger with rolling-window aggregates.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::identity::IdentityKey;
use crate::tier::Tier;

pub const HOURLY_WINDOW_SECONDS: i64 = 60 * 60;
pub const DAILY_WINDOW_SECONDS: i64 = 24 * 60 * 60;

const MILLIS_PER_BATCH: u64 = 1_000;
const MAX_BATCHES_PER_EVENT: f64 = 1_000.0;

/// Weight of a usage event, stored in thousandths of a batch so that repeated fractional
/// weights add up exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchWeight(u64);

impl BatchWeight {
    pub const FULL: BatchWeight = BatchWeight(MILLIS_PER_BATCH);
    pub const REGENERATION: BatchWeight = BatchWeight(MILLIS_PER_BATCH / 4);

    pub fn from_batches(batches: f64) -> Result<Self, Error> {
        if !batches.is_finite() || batches <= 0.0 || batches > MAX_BATCHES_PER_EVENT {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!(
                    "Usage weight must be a positive number of batches no greater than {MAX_BATCHES_PER_EVENT} (got {batches})"
                ),
            }));
        }
        let millis = (batches * MILLIS_PER_BATCH as f64).round() as u64;
        if millis == 0 {
            return Err(Error::new(ErrorDetails::InvalidRequest {
                message: format!("Usage weight {batches} is below the smallest countable unit"),
            }));
        }
        Ok(BatchWeight(millis))
    }

    pub fn as_batches(self) -> f64 {
        millis_to_batches(self.0)
    }

    pub(crate) fn repeated(self, times: usize) -> Self {
        BatchWeight(self.0.saturating_mul(times as u64))
    }
}

impl Serialize for BatchWeight {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_batches())
    }
}

fn millis_to_batches(millis: u64) -> f64 {
    millis as f64 / MILLIS_PER_BATCH as f64
}

fn batches_to_millis(batches: f64) -> u64 {
    if batches <= 0.0 {
        0
    } else {
        (batches * MILLIS_PER_BATCH as f64).round() as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub ip_address: Option<String>,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
    pub direction: Option<String>,
    #[serde(default)]
    pub is_campaign: bool,
}

/// One successful generation. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub identity_key: IdentityKey,
    pub recorded_at: DateTime<Utc>,
    pub weight: BatchWeight,
    pub tier: Tier,
    pub ideas_count: u32,
    pub boost_applied: bool,
    pub metadata: UsageMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub window_seconds: i64,
    pub count: f64,
    pub limit: f64,
    pub remaining: f64,
    /// Seconds until enough usage ages out to drop back under the limit. Only set at or over the limit.
    pub resets_in_seconds: Option<u64>,
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    // Per identity, in append order
    events: DashMap<IdentityKey, VecDeque<UsageEvent>>,
}

fn in_window(event: &UsageEvent, now: DateTime<Utc>, window: Duration) -> bool {
    event.recorded_at > now - window && event.recorded_at <= now
}

/// Whole seconds from `now` until `at`, rounded up, never below one.
pub(crate) fn seconds_until(now: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1_000).max(1)
}

fn out_of_range(message: String) -> Error {
    Error::new(ErrorDetails::InternalError { message })
}

pub(crate) fn duration_seconds(seconds: u64) -> Result<Duration, Error> {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| out_of_range(format!("Duration of {seconds}s is out of range")))
}

/// `at` moved forward by `seconds`, or an internal error past the representable range.
pub(crate) fn later_by(at: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>, Error> {
    at.checked_add_signed(duration_seconds(seconds)?)
        .ok_or_else(|| out_of_range(format!("{at} + {seconds}s is out of range")))
}

pub(crate) fn earlier_by(at: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>, Error> {
    at.checked_sub_signed(duration_seconds(seconds)?)
        .ok_or_else(|| out_of_range(format!("{at} - {seconds}s is out of range")))
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: UsageEvent) {
        let horizon = event.recorded_at - Duration::seconds(DAILY_WINDOW_SECONDS);
        let mut log = self.events.entry(event.identity_key.clone()).or_default();
        while log
            .front()
            .is_some_and(|oldest| oldest.recorded_at <= horizon)
        {
            log.pop_front();
        }
        log.push_back(event);
    }

    fn window_total_millis(&self, key: &IdentityKey, now: DateTime<Utc>, window_seconds: i64) -> u64 {
        let window = Duration::seconds(window_seconds);
        self.events
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|event| in_window(event, now, window))
                    .map(|event| event.weight.0)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Sum of weights in `(now - 1h, now]`
    pub fn hourly_count(&self, key: &IdentityKey, now: DateTime<Utc>) -> f64 {
        millis_to_batches(self.window_total_millis(key, now, HOURLY_WINDOW_SECONDS))
    }

    /// Sum of weights in `(now - 24h, now]`
    pub fn daily_count(&self, key: &IdentityKey, now: DateTime<Utc>) -> f64 {
        millis_to_batches(self.window_total_millis(key, now, DAILY_WINDOW_SECONDS))
    }

    /// Hourly and daily totals as they would be with `pending` more weight recorded at `now`.
    pub fn counts_with(
        &self,
        key: &IdentityKey,
        now: DateTime<Utc>,
        pending: BatchWeight,
    ) -> (f64, f64) {
        let hourly = self.window_total_millis(key, now, HOURLY_WINDOW_SECONDS);
        let daily = self.window_total_millis(key, now, DAILY_WINDOW_SECONDS);
        (
            millis_to_batches(hourly.saturating_add(pending.0)),
            millis_to_batches(daily.saturating_add(pending.0)),
        )
    }

    pub fn stats(
        &self,
        key: &IdentityKey,
        now: DateTime<Utc>,
        window_seconds: i64,
        limit: f64,
    ) -> UsageStats {
        let window = Duration::seconds(window_seconds);
        let limit_millis = batches_to_millis(limit);
        let total_millis = self.window_total_millis(key, now, window_seconds);

        let resets_in_seconds = if total_millis >= limit_millis {
            self.events.get(key).and_then(|log| {
                let mut remaining = total_millis;
                log.iter()
                    .filter(|event| in_window(event, now, window))
                    .find(|event| {
                        remaining -= event.weight.0;
                        remaining < limit_millis
                    })
                    .and_then(|event| event.recorded_at.checked_add_signed(window))
                    .map(|ages_out| seconds_until(now, ages_out))
            })
        } else {
            None
        };

        let count = millis_to_batches(total_millis);
        UsageStats {
            window_seconds,
            count,
            limit,
            remaining: (limit - count).max(0.0),
            resets_in_seconds,
        }
    }

    pub fn events(&self, key: &IdentityKey) -> Vec<UsageEvent> {
        self.events
            .get(key)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop events that can no longer fall inside any window. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::seconds(DAILY_WINDOW_SECONDS);
        let mut removed = 0;
        self.events.retain(|_, log| {
            let before = log.len();
            log.retain(|event| event.recorded_at > horizon);
            removed += before - log.len();
            !log.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn key() -> IdentityKey {
        Identity::user("u-ledger", "10.1.1.1").canonical_key().unwrap()
    }

    fn event(at: DateTime<Utc>, weight: BatchWeight) -> UsageEvent {
        UsageEvent {
            id: Uuid::now_v7(),
            identity_key: key(),
            recorded_at: at,
            weight,
            tier: Tier::A,
            ideas_count: 5,
            boost_applied: false,
            metadata: UsageMetadata::default(),
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[test]
    fn test_counts_are_monotonic_within_window() {
        let ledger = UsageLedger::new();
        let mut previous = 0.0;
        for minute in 0..10 {
            let now = t0() + Duration::minutes(minute);
            ledger.record(event(now, BatchWeight::FULL));
            let hourly = ledger.hourly_count(&key(), now);
            assert!(hourly > previous);
            previous = hourly;
        }
        assert_eq!(previous, 10.0);
        assert_eq!(ledger.daily_count(&key(), t0() + Duration::minutes(9)), 10.0);
    }

    #[test]
    fn test_events_age_out_exactly_at_the_boundary() {
        let ledger = UsageLedger::new();
        ledger.record(event(t0(), BatchWeight::FULL));
        ledger.record(event(t0() + Duration::minutes(30), BatchWeight::FULL));

        let just_before = t0() + Duration::hours(1) - Duration::milliseconds(1);
        assert_eq!(ledger.hourly_count(&key(), just_before), 2.0);

        let at_boundary = t0() + Duration::hours(1);
        assert_eq!(ledger.hourly_count(&key(), at_boundary), 1.0);
        assert_eq!(ledger.daily_count(&key(), at_boundary), 2.0);

        let next_day = t0() + Duration::hours(24);
        assert_eq!(ledger.daily_count(&key(), next_day), 1.0);
        assert_eq!(
            ledger.daily_count(&key(), next_day + Duration::minutes(30)),
            0.0
        );
    }

    #[test]
    fn test_four_regenerations_make_one_batch() {
        let ledger = UsageLedger::new();
        for i in 0..4 {
            ledger.record(event(t0() + Duration::seconds(i), BatchWeight::REGENERATION));
        }
        let now = t0() + Duration::seconds(10);
        assert_eq!(ledger.hourly_count(&key(), now), 1.0);
        assert_eq!(ledger.daily_count(&key(), now), 1.0);

        // Arbitrary decimals still sum exactly in fixed point
        let ledger = UsageLedger::new();
        let tenth = BatchWeight::from_batches(0.1).unwrap();
        for i in 0..10 {
            ledger.record(event(t0() + Duration::seconds(i), tenth));
        }
        assert_eq!(ledger.hourly_count(&key(), now), 1.0);
    }

    #[test]
    fn test_weight_validation() {
        assert_eq!(BatchWeight::from_batches(1.0).unwrap(), BatchWeight::FULL);
        assert_eq!(
            BatchWeight::from_batches(0.25).unwrap(),
            BatchWeight::REGENERATION
        );
        assert!(BatchWeight::from_batches(0.0).is_err());
        assert!(BatchWeight::from_batches(-1.0).is_err());
        assert!(BatchWeight::from_batches(f64::NAN).is_err());
        assert!(BatchWeight::from_batches(0.0001).is_err());
        assert!(BatchWeight::from_batches(5_000.0).is_err());
    }

    #[test]
    fn test_stats_report_reset_time_at_limit() {
        let ledger = UsageLedger::new();
        ledger.record(event(t0(), BatchWeight::FULL));
        ledger.record(event(t0() + Duration::minutes(10), BatchWeight::FULL));
        ledger.record(event(t0() + Duration::minutes(20), BatchWeight::FULL));

        let now = t0() + Duration::minutes(25);
        let stats = ledger.stats(&key(), now, HOURLY_WINDOW_SECONDS, 5.0);
        assert_eq!(stats.count, 3.0);
        assert_eq!(stats.remaining, 2.0);
        assert_eq!(stats.resets_in_seconds, None);

        // At a limit of 3, the first event must age out: 60 - 25 = 35 minutes
        let stats = ledger.stats(&key(), now, HOURLY_WINDOW_SECONDS, 3.0);
        assert_eq!(stats.remaining, 0.0);
        assert_eq!(stats.resets_in_seconds, Some(35 * 60));

        // At a limit of 2, the first two must age out: 70 - 25 = 45 minutes
        let stats = ledger.stats(&key(), now, HOURLY_WINDOW_SECONDS, 2.0);
        assert_eq!(stats.resets_in_seconds, Some(45 * 60));
    }

    #[test]
    fn test_counts_with_pending_weight() {
        let ledger = UsageLedger::new();
        ledger.record(event(t0(), BatchWeight::FULL));
        let now = t0() + Duration::minutes(5);
        assert_eq!(
            ledger.counts_with(&key(), now, BatchWeight::REGENERATION),
            (1.25, 1.25)
        );
        assert_eq!(
            ledger.counts_with(&key(), now, BatchWeight::FULL.repeated(2)),
            (3.0, 3.0)
        );
        assert_eq!(ledger.hourly_count(&key(), now), 1.0);
    }

    #[test]
    fn test_offsets_past_the_calendar_are_errors() {
        let end = DateTime::<Utc>::MAX_UTC - Duration::seconds(10);
        assert_eq!(later_by(end, 5).unwrap(), end + Duration::seconds(5));
        let error = later_by(end, 60).unwrap_err();
        assert!(matches!(
            error.get_details(),
            ErrorDetails::InternalError { .. }
        ));
        assert!(later_by(t0(), u64::MAX).is_err());
        assert!(earlier_by(DateTime::<Utc>::MIN_UTC, 1).is_err());
        assert_eq!(earlier_by(t0(), 60).unwrap(), t0() - Duration::minutes(1));
    }

    #[test]
    fn test_prune_drops_only_expired_events() {
        let ledger = UsageLedger::new();
        ledger.record(event(t0(), BatchWeight::FULL));
        ledger.record(event(t0() + Duration::hours(2), BatchWeight::FULL));

        assert_eq!(ledger.prune(t0() + Duration::hours(24)), 1);
        assert_eq!(ledger.events(&key()).len(), 1);

        assert_eq!(ledger.prune(t0() + Duration::hours(27)), 1);
        assert!(ledger.events(&key()).is_empty());
    }

    #[test]
    fn test_other_identities_are_isolated() {
        let ledger = UsageLedger::new();
        ledger.record(event(t0(), BatchWeight::FULL));
        let other = Identity::anonymous("172.16.0.9", None)
            .canonical_key()
            .unwrap();
        assert_eq!(ledger.hourly_count(&other, t0()), 0.0);
    }
}
