#![cfg(test)]

use std::sync::Arc;

use crate::admission::{AdmissionController, UsageRecord};
use crate::clock::ManualClock;
use crate::config_parser::Config;
use crate::gateway_util::AppStateData;
use crate::identity::Identity;
use crate::random::RandomSource;
use crate::settings::{Settings, SettingsStore};
use crate::tier::Tier;

/// Always draws the same value, clamped into the requested range.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandomSource(pub u64);

impl RandomSource for FixedRandomSource {
    fn uniform_inclusive(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.0.clamp(min, max)
    }
}

/// A controller on a manual clock, fresh for every test.
pub struct TestController {
    pub controller: Arc<AdmissionController>,
    pub clock: Arc<ManualClock>,
}

impl TestController {
    pub fn new(settings: Settings) -> Self {
        Self::with_random(settings, Arc::new(FixedRandomSource(0)))
    }

    pub fn with_fixed_random(settings: Settings, value: u64) -> Self {
        Self::with_random(settings, Arc::new(FixedRandomSource(value)))
    }

    pub fn with_random(settings: Settings, random: Arc<dyn RandomSource>) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = SettingsStore::new(settings, clock.clone()).unwrap();
        let controller = AdmissionController::new(Arc::new(store), clock.clone(), random);
        Self {
            controller: Arc::new(controller),
            clock,
        }
    }
}

pub fn usage_record(identity: &Identity, weight: f64, tier: Tier) -> UsageRecord {
    UsageRecord {
        identity: identity.clone(),
        weight,
        tier,
        ideas_count: 5,
        user_agent: Some("genguard-tests".to_string()),
        boost_applied: false,
        direction: None,
        is_campaign: false,
    }
}

/// App state over a fresh controller. `admin_key` is the configured admin credential, if any.
pub fn get_unit_test_app_state_data(
    settings: Settings,
    admin_key: Option<&str>,
) -> (AppStateData, Arc<ManualClock>) {
    let harness = TestController::new(settings);
    let config = Arc::new(Config::default());
    let state = AppStateData::new_for_tests(
        config,
        harness.controller,
        admin_key.map(|key| secrecy::SecretString::from(key.to_string())),
    );
    (state, harness.clock)
}
