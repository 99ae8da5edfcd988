//! Per-identity cooldowns imposed after a tier downgrade or a newly crossed soft warning.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

use crate::error::Error;
use crate::identity::IdentityKey;
use crate::random::RandomSource;
use crate::settings::Settings;
use crate::tier::{Tier, TierDecision};
use crate::usage::{later_by, seconds_until, HOURLY_WINDOW_SECONDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CooldownReason {
    TierDowngrade { from: Tier, to: Tier },
    SoftWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownRecord {
    pub until: DateTime<Utc>,
    /// Tier whose duration range was used
    pub tier: Tier,
    pub reason: CooldownReason,
}

impl CooldownRecord {
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(now, self.until)
    }
}

#[derive(Debug, Default)]
struct CooldownState {
    record: Option<CooldownRecord>,
    /// Whether the last evaluation was already inside the soft-warning band
    soft_warning: bool,
    last_evaluated_at: Option<DateTime<Utc>>,
}

impl CooldownState {
    /// The soft-warning flag only carries over while the usage that set it is still in the
    /// hourly window.
    fn warned_at(&self, now: DateTime<Utc>) -> bool {
        self.soft_warning
            && self
                .last_evaluated_at
                .is_some_and(|at| now - at < Duration::seconds(HOURLY_WINDOW_SECONDS))
    }
}

/// Outcome of [`CooldownManager::plan`], applied with [`CooldownManager::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownPlan {
    key: IdentityKey,
    soft_warning: bool,
    evaluated_at: DateTime<Utc>,
    record: Option<CooldownRecord>,
}

#[derive(Debug, Default)]
pub struct CooldownManager {
    states: DashMap<IdentityKey, CooldownState>,
}

impl CooldownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Work out whether usage just recorded at `recorded_tier` puts the identity into
    /// cooldown before its next request. `next` is the classification that request would get.
    /// Nothing is stored until the plan is committed.
    pub fn plan(
        &self,
        key: &IdentityKey,
        recorded_tier: Tier,
        next: &TierDecision,
        settings: &Settings,
        now: DateTime<Utc>,
        random: &dyn RandomSource,
    ) -> Result<CooldownPlan, Error> {
        let was_warned = self
            .states
            .get(key)
            .is_some_and(|state| state.warned_at(now));
        let newly_warned = next.soft_warning && !was_warned;

        let mut plan = CooldownPlan {
            key: key.clone(),
            soft_warning: next.soft_warning,
            evaluated_at: now,
            record: None,
        };

        // Limit statuses block on their own
        let Some(next_tier) = next.tier() else {
            return Ok(plan);
        };

        let reason = if next_tier.is_downgrade_from(recorded_tier) {
            CooldownReason::TierDowngrade {
                from: recorded_tier,
                to: next_tier,
            }
        } else if newly_warned {
            CooldownReason::SoftWarning
        } else {
            return Ok(plan);
        };

        let (min, max) = settings.cooldown_range(next_tier);
        let seconds = random.uniform_inclusive(min, max);
        if seconds > 0 {
            plan.record = Some(CooldownRecord {
                until: later_by(now, seconds)?,
                tier: next_tier,
                reason,
            });
        }
        Ok(plan)
    }

    /// Store a plan. Returns the cooldown in force afterwards if the plan imposed one.
    pub fn commit(&self, plan: CooldownPlan) -> Option<CooldownRecord> {
        let mut state = self.states.entry(plan.key.clone()).or_default();
        state.soft_warning = plan.soft_warning;
        state.last_evaluated_at = Some(plan.evaluated_at);

        let record = plan.record?;
        // Never shorten a cooldown that is already running
        if let Some(existing) = &state.record {
            if existing.until >= record.until {
                return Some(existing.clone());
            }
        }

        tracing::info!(
            identity = %plan.key,
            tier = %record.tier,
            until = %record.until,
            reason = ?record.reason,
            "Cooldown imposed"
        );
        counter!("genguard_cooldowns_issued_total", "tier" => record.tier.to_string()).increment(1);
        state.record = Some(record.clone());
        Some(record)
    }

    /// The cooldown blocking `key` at `now`, if any. Expired records are treated as absent.
    pub fn active(&self, key: &IdentityKey, now: DateTime<Utc>) -> Option<CooldownRecord> {
        self.states
            .get(key)
            .and_then(|state| state.record.clone())
            .filter(|record| now < record.until)
    }

    /// Drop expired cooldowns, stale soft-warning flags and identities with no remaining state.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.states.retain(|_, state| {
            if state.record.as_ref().is_some_and(|record| now >= record.until) {
                state.record = None;
                removed += 1;
            }
            state.soft_warning = state.warned_at(now);
            state.record.is_some() || state.soft_warning
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::random::StdRandomSource;
    use crate::testing::FixedRandomSource;
    use crate::tier::decide;

    fn key() -> IdentityKey {
        Identity::user("u-cool", "10.0.0.2").canonical_key().unwrap()
    }

    fn settings() -> Settings {
        Settings {
            hourly_batch_limit: 10.0,
            soft_warning_threshold: 2.0,
            tier_a_max: 3.0,
            tier_b_max: 6.0,
            cooldown_tier_a_min: 5,
            cooldown_tier_a_max: 10,
            cooldown_tier_b_min: 30,
            cooldown_tier_b_max: 90,
            cooldown_tier_c_min: 90,
            cooldown_tier_c_max: 240,
            ..Default::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    fn evaluate(
        manager: &CooldownManager,
        recorded_tier: Tier,
        next: &TierDecision,
        settings: &Settings,
        now: DateTime<Utc>,
        random: &dyn RandomSource,
    ) -> Option<CooldownRecord> {
        let plan = manager
            .plan(&key(), recorded_tier, next, settings, now, random)
            .unwrap();
        manager.commit(plan)
    }

    #[test]
    fn test_downgrade_imposes_cooldown_for_new_tier() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 3.0, 3.0, false);
        let record = evaluate(&manager, Tier::A, &next, &settings, t0(), &FixedRandomSource(45))
            .unwrap();
        assert_eq!(record.tier, Tier::B);
        assert_eq!(
            record.reason,
            CooldownReason::TierDowngrade {
                from: Tier::A,
                to: Tier::B
            }
        );
        assert_eq!(record.until, t0() + Duration::seconds(45));
        assert_eq!(manager.active(&key(), t0()), Some(record));
    }

    #[test]
    fn test_no_cooldown_without_transition() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 1.0, 1.0, false);
        assert!(evaluate(&manager, Tier::A, &next, &settings, t0(), &FixedRandomSource(45))
            .is_none());
        assert!(manager.active(&key(), t0()).is_none());
    }

    #[test]
    fn test_soft_warning_triggers_only_when_newly_crossed() {
        let manager = CooldownManager::new();
        let settings = settings();
        let random = FixedRandomSource(100);

        let next = decide(&settings, 8.0, 8.0, false);
        let record = evaluate(&manager, Tier::C, &next, &settings, t0(), &random)
            .unwrap();
        assert_eq!(record.reason, CooldownReason::SoftWarning);

        // Still in the band after the cooldown expired: nothing new
        let later = t0() + Duration::minutes(10);
        let next = decide(&settings, 9.0, 9.0, false);
        assert!(evaluate(&manager, Tier::C, &next, &settings, later, &random)
            .is_none());
    }

    #[test]
    fn test_limits_do_not_impose_cooldowns() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 10.0, 10.0, false);
        assert!(evaluate(&manager, Tier::C, &next, &settings, t0(), &FixedRandomSource(100))
            .is_none());
    }

    #[test]
    fn test_cooldown_expires_automatically() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 6.0, 6.0, false);
        let record = evaluate(&manager, Tier::B, &next, &settings, t0(), &FixedRandomSource(120))
            .unwrap();
        assert_eq!(record.remaining_seconds(t0()), 120);
        assert_eq!(
            record.remaining_seconds(t0() + Duration::milliseconds(119_500)),
            1
        );

        assert!(manager
            .active(&key(), t0() + Duration::seconds(119))
            .is_some());
        assert!(manager
            .active(&key(), t0() + Duration::seconds(120))
            .is_none());
    }

    #[test]
    fn test_zero_length_cooldown_imposes_nothing() {
        let manager = CooldownManager::new();
        let settings = Settings {
            cooldown_tier_b_min: 0,
            cooldown_tier_b_max: 0,
            ..settings()
        };
        let next = decide(&settings, 3.0, 3.0, false);
        assert!(evaluate(&manager, Tier::A, &next, &settings, t0(), &StdRandomSource::seeded(1))
            .is_none());
    }

    #[test]
    fn test_durations_stay_within_configured_range() {
        let settings = settings();
        let random = StdRandomSource::seeded(99);
        for i in 0..500 {
            let manager = CooldownManager::new();
            let next = decide(&settings, 6.5, 6.5, false);
            let now = t0() + Duration::seconds(i);
            let record = evaluate(&manager, Tier::B, &next, &settings, now, &random)
                .unwrap();
            let seconds = (record.until - now).num_seconds() as u64;
            assert!((90..=240).contains(&seconds));
        }
    }

    #[test]
    fn test_running_cooldown_is_never_shortened() {
        let manager = CooldownManager::new();
        let settings = settings();
        let long = decide(&settings, 6.0, 6.0, false);
        evaluate(&manager, Tier::B, &long, &settings, t0(), &FixedRandomSource(200))
            .unwrap();

        let short = decide(&settings, 3.0, 3.0, false);
        let record = evaluate(&manager, Tier::A, &short, &settings, t0(), &FixedRandomSource(30))
            .unwrap();
        assert_eq!(record.until, t0() + Duration::seconds(200));
    }

    #[test]
    fn test_prune_clears_expired_records() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 3.0, 3.0, false);
        evaluate(&manager, Tier::A, &next, &settings, t0(), &FixedRandomSource(60))
            .unwrap();
        assert_eq!(manager.prune(t0() + Duration::seconds(30)), 0);
        assert_eq!(manager.prune(t0() + Duration::seconds(60)), 1);
        assert!(manager.states.is_empty());
    }

    #[test]
    fn test_stale_soft_warning_does_not_suppress_a_new_one() {
        let manager = CooldownManager::new();
        let settings = settings();
        let random = FixedRandomSource(100);
        let next = decide(&settings, 8.0, 8.0, false);
        evaluate(&manager, Tier::C, &next, &settings, t0(), &random).unwrap();

        // An hour of silence: the usage that set the flag has left the window
        let back = t0() + Duration::minutes(61);
        assert_eq!(manager.prune(back), 1);
        assert!(manager.states.is_empty());
        let record = evaluate(&manager, Tier::C, &next, &settings, back, &random).unwrap();
        assert_eq!(record.reason, CooldownReason::SoftWarning);
    }

    #[test]
    fn test_stale_flag_is_ignored_even_without_pruning() {
        let manager = CooldownManager::new();
        let settings = settings();
        let random = FixedRandomSource(100);
        let next = decide(&settings, 8.0, 8.0, false);
        evaluate(&manager, Tier::C, &next, &settings, t0(), &random).unwrap();

        let back = t0() + Duration::hours(2);
        let record = evaluate(&manager, Tier::C, &next, &settings, back, &random).unwrap();
        assert_eq!(record.until, back + Duration::seconds(100));
    }

    #[test]
    fn test_plan_stores_nothing_until_committed() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 3.0, 3.0, false);
        let plan = manager
            .plan(&key(), Tier::A, &next, &settings, t0(), &FixedRandomSource(45))
            .unwrap();
        assert!(manager.states.is_empty());
        assert!(manager.commit(plan).is_some());
        assert!(manager.active(&key(), t0()).is_some());
    }

    #[test]
    fn test_unrepresentable_expiry_is_an_error_not_a_panic() {
        let manager = CooldownManager::new();
        let settings = settings();
        let next = decide(&settings, 3.0, 3.0, false);
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::seconds(10);
        let error = manager
            .plan(&key(), Tier::A, &next, &settings, near_end, &FixedRandomSource(45))
            .unwrap_err();
        assert!(matches!(
            error.get_details(),
            crate::error::ErrorDetails::InternalError { .. }
        ));
        assert!(manager.states.is_empty());
    }
}
