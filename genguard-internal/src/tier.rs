use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::settings::Settings;

/// Service class. `A` is the best model, `C` the most restricted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Tier {
    A,
    B,
    C,
}

impl Tier {
    fn rank(self) -> u8 {
        match self {
            Tier::A => 0,
            Tier::B => 1,
            Tier::C => 2,
        }
    }

    /// `true` if moving from `previous` to `self` is a step down (A→B, B→C, A→C).
    pub fn is_downgrade_from(self, previous: Tier) -> bool {
        self.rank() > previous.rank()
    }

    /// Lowercase suffix used in settings keys (`cooldown_tier_a_min`, `model_tier_b`, ...)
    pub fn key_suffix(self) -> &'static str {
        match self {
            Tier::A => "a",
            Tier::B => "b",
            Tier::C => "c",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    DailyLimit,
    HourlyLimit,
    Admitted {
        tier: Tier,
        model: String,
        /// Tier A was forced by an active boost redemption
        boosted: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierDecision {
    pub classification: Classification,
    /// Non-blocking signal that the hourly limit is close
    pub soft_warning: bool,
}

impl TierDecision {
    pub fn tier(&self) -> Option<Tier> {
        match &self.classification {
            Classification::Admitted { tier, .. } => Some(*tier),
            Classification::DailyLimit | Classification::HourlyLimit => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self.classification, Classification::Admitted { .. })
    }
}

/// Map usage and boost state onto a tier. First matching rule wins:
/// daily limit, hourly limit, boost override, then the usage thresholds.
pub fn decide(
    settings: &Settings,
    hourly_count: f64,
    daily_count: f64,
    boost_active: bool,
) -> TierDecision {
    let soft_warning =
        hourly_count >= settings.hourly_batch_limit - settings.soft_warning_threshold;

    let classification = if daily_count >= settings.daily_batch_limit {
        Classification::DailyLimit
    } else if hourly_count >= settings.hourly_batch_limit {
        Classification::HourlyLimit
    } else {
        let (tier, boosted) = if boost_active {
            (Tier::A, true)
        } else if hourly_count < settings.tier_a_max {
            (Tier::A, false)
        } else if hourly_count < settings.tier_b_max {
            (Tier::B, false)
        } else {
            (Tier::C, false)
        };
        Classification::Admitted {
            tier,
            model: settings.model_for(tier).to_string(),
            boosted,
        }
    };

    TierDecision {
        classification,
        soft_warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            hourly_batch_limit: 10.0,
            daily_batch_limit: 30.0,
            soft_warning_threshold: 2.0,
            tier_a_max: 3.0,
            tier_b_max: 6.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_usage_thresholds() {
        let settings = settings();
        assert_eq!(decide(&settings, 0.0, 0.0, false).tier(), Some(Tier::A));
        assert_eq!(decide(&settings, 2.75, 2.75, false).tier(), Some(Tier::A));
        assert_eq!(decide(&settings, 3.0, 3.0, false).tier(), Some(Tier::B));
        assert_eq!(decide(&settings, 5.5, 5.5, false).tier(), Some(Tier::B));
        assert_eq!(decide(&settings, 6.0, 6.0, false).tier(), Some(Tier::C));
        assert_eq!(decide(&settings, 9.75, 9.75, false).tier(), Some(Tier::C));
    }

    #[test]
    fn test_model_follows_tier() {
        let settings = settings();
        let decision = decide(&settings, 4.0, 4.0, false);
        assert_eq!(
            decision.classification,
            Classification::Admitted {
                tier: Tier::B,
                model: settings.model_tier_b.clone(),
                boosted: false,
            }
        );
    }

    #[test]
    fn test_limits_take_precedence() {
        let settings = settings();
        assert_eq!(
            decide(&settings, 10.0, 12.0, false).classification,
            Classification::HourlyLimit
        );
        // Daily wins over hourly
        assert_eq!(
            decide(&settings, 10.0, 30.0, true).classification,
            Classification::DailyLimit
        );
        // Boost does not lift limits
        assert_eq!(
            decide(&settings, 11.0, 11.0, true).classification,
            Classification::HourlyLimit
        );
    }

    #[test]
    fn test_boost_forces_tier_a() {
        let settings = settings();
        let decision = decide(&settings, 8.0, 8.0, true);
        assert_eq!(
            decision.classification,
            Classification::Admitted {
                tier: Tier::A,
                model: settings.model_tier_a.clone(),
                boosted: true,
            }
        );
    }

    #[test]
    fn test_soft_warning_is_non_blocking() {
        let settings = settings();
        let decision = decide(&settings, 7.99, 7.99, false);
        assert!(!decision.soft_warning);

        let decision = decide(&settings, 8.0, 8.0, false);
        assert!(decision.soft_warning);
        assert!(decision.is_admitted());
    }

    #[test]
    fn test_downgrade_ordering() {
        assert!(Tier::B.is_downgrade_from(Tier::A));
        assert!(Tier::C.is_downgrade_from(Tier::B));
        assert!(Tier::C.is_downgrade_from(Tier::A));
        assert!(!Tier::A.is_downgrade_from(Tier::B));
        assert!(!Tier::B.is_downgrade_from(Tier::B));
    }

    #[test]
    fn test_tier_string_forms() {
        assert_eq!(Tier::B.to_string(), "B");
        assert_eq!("C".parse::<Tier>().unwrap(), Tier::C);
        assert_eq!(serde_json::to_string(&Tier::A).unwrap(), "\"A\"");
        assert_eq!(Tier::C.key_suffix(), "c");
    }
}
