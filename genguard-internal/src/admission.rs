//! Admission facade: the two calls request handlers make around a generation,
//! plus the read-side queries built on the same ledgers.
//!
//! Every operation for one identity key runs under that key's async mutex, so a check,
//! a usage record and a boost redemption for the same identity never interleave.
//! Different identities never contend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use strum::Display;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::abuse::AbuseDetector;
use crate::boost::{BoostGrant, BoostLedger, BoostStatus, RedeemOutcome};
use crate::clock::Clock;
use crate::cooldown::{CooldownManager, CooldownRecord};
use crate::error::Error;
use crate::identity::{Identity, IdentityKey, UNKNOWN_IP};
use crate::random::RandomSource;
use crate::reservation::ReservationBook;
use crate::settings::SettingsStore;
use crate::tier::{decide, Classification, Tier};
use crate::usage::{
    seconds_until, BatchWeight, UsageEvent, UsageLedger, UsageMetadata, UsageStats,
    DAILY_WINDOW_SECONDS, HOURLY_WINDOW_SECONDS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdmissionStatus {
    Ok,
    Banned,
    Cooldown,
    HourlyLimit,
    DailyLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub can_generate: bool,
    pub status: AdmissionStatus,
    pub tier: Option<Tier>,
    pub model: Option<String>,
    /// Whole seconds until the block lifts. Only set when blocked.
    pub cooldown_seconds: Option<u64>,
    pub soft_warning: bool,
    pub boost_active: bool,
    pub hourly_count: f64,
    pub daily_count: f64,
}

/// Input to [`AdmissionController::record_usage`]. Mirrors what a handler knows after a
/// successful generation.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub identity: Identity,
    /// 1.0 for a full batch, 0.25 for a single-idea regeneration
    pub weight: f64,
    pub tier: Tier,
    pub ideas_count: u32,
    pub user_agent: Option<String>,
    pub boost_applied: bool,
    pub direction: Option<String>,
    pub is_campaign: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReceipt {
    pub event_id: Uuid,
    /// Tier the event was recorded at. Forced to `A` while a boost redemption is running.
    pub tier: Tier,
    pub boost_applied: bool,
    pub hourly_count: f64,
    pub daily_count: f64,
    /// Cooldown the identity will face on its next check, if this usage triggered one
    pub cooldown: Option<CooldownRecord>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PruneReport {
    pub usage_events: usize,
    pub cooldowns: usize,
    pub bans: usize,
    pub reservations: usize,
    pub idle_locks: usize,
}

pub struct AdmissionController {
    settings: Arc<SettingsStore>,
    usage: UsageLedger,
    cooldowns: CooldownManager,
    abuse: AbuseDetector,
    boosts: BoostLedger,
    reservations: ReservationBook,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    locks: DashMap<IdentityKey, Arc<Mutex<()>>>,
}

fn user_key(user_id: &str) -> Result<(String, IdentityKey), Error> {
    let identity = Identity::new(Some(user_id.to_string()), UNKNOWN_IP, None);
    let key = identity.canonical_key()?;
    let user_id = identity.user_id.unwrap_or_default();
    Ok((user_id, key))
}

impl AdmissionController {
    pub fn new(
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            settings,
            usage: UsageLedger::new(),
            cooldowns: CooldownManager::new(),
            abuse: AbuseDetector::new(),
            boosts: BoostLedger::new(),
            reservations: ReservationBook::new(),
            clock,
            random,
            locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn identity_lock(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    /// Decide whether `identity` may generate now. Every call counts as an arrival for
    /// abuse detection. Precedence: ban, cooldown, daily limit, hourly limit, tier.
    ///
    /// An admitted check holds one batch for the identity until the matching
    /// [`record_usage`](Self::record_usage) or until the hold lapses, so concurrent checks
    /// cannot all be admitted under the same remaining quota.
    pub async fn check_admission(&self, identity: &Identity) -> Result<AdmissionDecision, Error> {
        let key = identity.canonical_key()?;
        let lock = self.identity_lock(&key);
        let _guard = lock.lock().await;

        let snapshot = self.settings.get();
        let settings = &snapshot.settings;
        let now = self.clock.now();

        let held = self.reservations.held(&key, now);
        let (hourly_count, daily_count) = self.usage.counts_with(&key, now, held);
        let boost_active = identity
            .user_id()
            .is_some_and(|user_id| self.boosts.is_active(user_id));

        let blocked = |status, cooldown_seconds| AdmissionDecision {
            can_generate: false,
            status,
            tier: None,
            model: None,
            cooldown_seconds,
            soft_warning: false,
            boost_active,
            hourly_count,
            daily_count,
        };
        // When only outstanding holds push the identity over a limit, it clears once they lapse
        let resets_in = |window_seconds, limit| {
            self.usage
                .stats(&key, now, window_seconds, limit)
                .resets_in_seconds
                .or_else(|| {
                    self.reservations
                        .next_expiry(&key, now)
                        .map(|at| seconds_until(now, at))
                })
        };

        let decision = if let Some(ban) =
            self.abuse.observe(&key, now, settings, self.random.as_ref())?
        {
            blocked(AdmissionStatus::Banned, Some(ban.remaining_seconds(now)))
        } else if let Some(cooldown) = self.cooldowns.active(&key, now) {
            blocked(
                AdmissionStatus::Cooldown,
                Some(cooldown.remaining_seconds(now)),
            )
        } else {
            let tier_decision = decide(settings, hourly_count, daily_count, boost_active);
            match tier_decision.classification {
                Classification::DailyLimit => blocked(
                    AdmissionStatus::DailyLimit,
                    resets_in(DAILY_WINDOW_SECONDS, settings.daily_batch_limit),
                ),
                Classification::HourlyLimit => blocked(
                    AdmissionStatus::HourlyLimit,
                    resets_in(HOURLY_WINDOW_SECONDS, settings.hourly_batch_limit),
                ),
                Classification::Admitted { tier, model, .. } => {
                    self.reservations.hold(&key, now)?;
                    AdmissionDecision {
                        can_generate: true,
                        status: AdmissionStatus::Ok,
                        tier: Some(tier),
                        model: Some(model),
                        cooldown_seconds: None,
                        soft_warning: tier_decision.soft_warning,
                        boost_active,
                        hourly_count,
                        daily_count,
                    }
                }
            }
        };

        if decision.can_generate {
            tracing::debug!(identity = %key, tier = ?decision.tier, "Admitted");
        } else {
            tracing::debug!(
                identity = %key,
                status = %decision.status,
                cooldown_seconds = ?decision.cooldown_seconds,
                "Admission blocked"
            );
        }
        counter!("genguard_admission_checks_total", "status" => decision.status.to_string())
            .increment(1);
        Ok(decision)
    }

    /// Append a successful generation and work out the cooldown state for the identity's
    /// next request. Everything that can fail runs before any state is touched, so an error
    /// leaves the ledger, boost slots, holds and cooldowns as they were.
    pub async fn record_usage(&self, record: UsageRecord) -> Result<UsageReceipt, Error> {
        let key = record.identity.canonical_key()?;
        let weight = BatchWeight::from_batches(record.weight)?;

        let lock = self.identity_lock(&key);
        let _guard = lock.lock().await;

        let snapshot = self.settings.get();
        let settings = &snapshot.settings;
        let now = self.clock.now();

        let user_id = record.identity.user_id();
        let forced_slots =
            user_id.map_or(0, |user_id| self.boosts.status(user_id).active_batches_remaining);
        let forced = forced_slots > 0;
        let (tier, boost_applied) = if forced {
            (Tier::A, true)
        } else {
            (record.tier, record.boost_applied)
        };

        // Counts and boost state as they will be once this event is in
        let (hourly_count, daily_count) = self.usage.counts_with(&key, now, weight);
        let boost_active = forced_slots > 1;
        let next = decide(settings, hourly_count, daily_count, boost_active);
        let plan = self.cooldowns.plan(
            &key,
            tier,
            &next,
            settings,
            now,
            self.random.as_ref(),
        )?;

        let event = UsageEvent {
            id: Uuid::now_v7(),
            identity_key: key.clone(),
            recorded_at: now,
            weight,
            tier,
            ideas_count: record.ideas_count,
            boost_applied,
            metadata: UsageMetadata {
                ip_address: Some(record.identity.ip_address.clone())
                    .filter(|ip| !ip.is_empty() && ip != UNKNOWN_IP),
                session_id: record.identity.session_id.clone(),
                user_agent: record.user_agent,
                direction: record.direction,
                is_campaign: record.is_campaign,
            },
        };
        let event_id = event.id;

        if let Some(user_id) = user_id.filter(|_| forced) {
            self.boosts.consume_forced_slot(user_id);
        }
        self.usage.record(event);
        self.reservations.release(&key, now);
        let cooldown = self.cooldowns.commit(plan);

        tracing::debug!(
            identity = %key,
            %tier,
            weight = weight.as_batches(),
            hourly_count,
            "Usage recorded"
        );
        counter!("genguard_usage_recorded_total", "tier" => tier.to_string()).increment(1);

        Ok(UsageReceipt {
            event_id,
            tier,
            boost_applied,
            hourly_count,
            daily_count,
            cooldown,
        })
    }

    pub fn hourly_stats(&self, user_id: &str) -> Result<UsageStats, Error> {
        let (_, key) = user_key(user_id)?;
        let limit = self.settings.get().settings.hourly_batch_limit;
        Ok(self
            .usage
            .stats(&key, self.clock.now(), HOURLY_WINDOW_SECONDS, limit))
    }

    pub fn daily_stats(&self, user_id: &str) -> Result<UsageStats, Error> {
        let (_, key) = user_key(user_id)?;
        let limit = self.settings.get().settings.daily_batch_limit;
        Ok(self
            .usage
            .stats(&key, self.clock.now(), DAILY_WINDOW_SECONDS, limit))
    }

    pub fn usage_events(&self, identity: &Identity) -> Result<Vec<UsageEvent>, Error> {
        Ok(self.usage.events(&identity.canonical_key()?))
    }

    pub fn boost_status(&self, user_id: &str) -> Result<BoostStatus, Error> {
        let (user_id, _) = user_key(user_id)?;
        Ok(self.boosts.status(&user_id))
    }

    pub fn boost_grants(&self, user_id: &str) -> Result<Vec<BoostGrant>, Error> {
        let (user_id, _) = user_key(user_id)?;
        Ok(self.boosts.grants(&user_id))
    }

    pub async fn redeem_boost(&self, user_id: &str) -> Result<RedeemOutcome, Error> {
        let (user_id, key) = user_key(user_id)?;
        let lock = self.identity_lock(&key);
        let _guard = lock.lock().await;
        let batches = self.settings.get().settings.boost_tier_a_batches;
        Ok(self.boosts.redeem(&user_id, batches))
    }

    /// Credit boost balance. The caller is responsible for authorizing `admin_id`.
    pub async fn add_boost(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        admin_id: &str,
    ) -> Result<u64, Error> {
        let (user_id, key) = user_key(user_id)?;
        let lock = self.identity_lock(&key);
        let _guard = lock.lock().await;
        self.boosts
            .add(&user_id, amount, reason, admin_id, self.clock.now())
    }

    /// Drop state that can no longer affect a decision made at or after `now`.
    pub fn prune(&self, now: DateTime<Utc>) -> PruneReport {
        let snapshot = self.settings.get();
        let before = self.locks.len();
        // Only the map holds the lock when nobody is using it
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        PruneReport {
            usage_events: self.usage.prune(now),
            cooldowns: self.cooldowns.prune(now),
            bans: self.abuse.prune(now, &snapshot.settings),
            reservations: self.reservations.prune(now),
            idle_locks: before - self.locks.len(),
        }
    }
}
