//! Boost credits: per-user balance, redemptions into forced Tier-A batches, admin top-ups.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;

use crate::error::{Error, ErrorDetails};

/// One admin top-up, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoostGrant {
    pub amount: u64,
    pub reason: String,
    pub admin_id: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedeemOutcome {
    pub success: bool,
    pub new_balance: u64,
    pub batches_granted: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoostStatus {
    pub balance: u64,
    pub active_batches_remaining: u32,
}

#[derive(Debug, Default)]
struct BoostAccount {
    balance: u64,
    /// Forced Tier-A batches left from redemptions
    redemption_remaining: u32,
    grants: Vec<BoostGrant>,
}

#[derive(Debug, Default)]
pub struct BoostLedger {
    accounts: DashMap<String, BoostAccount>,
}

impl BoostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, user_id: &str) -> u64 {
        self.accounts
            .get(user_id)
            .map(|account| account.balance)
            .unwrap_or(0)
    }

    pub fn status(&self, user_id: &str) -> BoostStatus {
        self.accounts
            .get(user_id)
            .map(|account| BoostStatus {
                balance: account.balance,
                active_batches_remaining: account.redemption_remaining,
            })
            .unwrap_or(BoostStatus {
                balance: 0,
                active_batches_remaining: 0,
            })
    }

    /// Spend one credit for `batches` forced Tier-A batches. A zero balance is reported
    /// through `success: false`, not as an error. Redeeming during an active redemption stacks.
    pub fn redeem(&self, user_id: &str, batches: u32) -> RedeemOutcome {
        let Some(mut account) = self.accounts.get_mut(user_id) else {
            counter!("genguard_boost_redemptions_total", "outcome" => "insufficient_balance")
                .increment(1);
            return RedeemOutcome {
                success: false,
                new_balance: 0,
                batches_granted: 0,
            };
        };

        if account.balance == 0 {
            counter!("genguard_boost_redemptions_total", "outcome" => "insufficient_balance")
                .increment(1);
            return RedeemOutcome {
                success: false,
                new_balance: 0,
                batches_granted: 0,
            };
        }

        account.balance -= 1;
        account.redemption_remaining = account.redemption_remaining.saturating_add(batches);
        tracing::info!(
            user_id,
            new_balance = account.balance,
            batches_remaining = account.redemption_remaining,
            "Boost redeemed"
        );
        counter!("genguard_boost_redemptions_total", "outcome" => "redeemed").increment(1);
        RedeemOutcome {
            success: true,
            new_balance: account.balance,
            batches_granted: batches,
        }
    }

    /// Credit `amount` to `user_id`. Callers must have authorized `admin_id` already.
    pub fn add(
        &self,
        user_id: &str,
        amount: i64,
        reason: impl Into<String>,
        admin_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        if amount < 1 {
            return Err(Error::new(ErrorDetails::InvalidBoostAmount { amount }));
        }
        let amount = amount as u64;
        let grant = BoostGrant {
            amount,
            reason: reason.into(),
            admin_id: admin_id.into(),
            granted_at: now,
        };

        let mut account = self.accounts.entry(user_id.to_string()).or_default();
        account.balance = account.balance.saturating_add(amount);
        tracing::info!(
            user_id,
            amount,
            admin_id = %grant.admin_id,
            new_balance = account.balance,
            "Boost credits granted"
        );
        account.grants.push(grant);
        Ok(account.balance)
    }

    /// Whether the next usage for `user_id` would be forced into Tier A.
    pub fn is_active(&self, user_id: &str) -> bool {
        self.accounts
            .get(user_id)
            .is_some_and(|account| account.redemption_remaining > 0)
    }

    /// Take one forced Tier-A batch. Returns `false` if no redemption is active.
    pub fn consume_forced_slot(&self, user_id: &str) -> bool {
        match self.accounts.get_mut(user_id) {
            Some(mut account) if account.redemption_remaining > 0 => {
                account.redemption_remaining -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn grants(&self, user_id: &str) -> Vec<BoostGrant> {
        self.accounts
            .get(user_id)
            .map(|account| account.grants.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[test]
    fn test_redeem_with_empty_balance_is_not_an_error() {
        let ledger = BoostLedger::new();
        let outcome = ledger.redeem("u-empty", 3);
        assert_eq!(
            outcome,
            RedeemOutcome {
                success: false,
                new_balance: 0,
                batches_granted: 0,
            }
        );
        assert!(!ledger.is_active("u-empty"));
    }

    #[test]
    fn test_redeem_consumes_credit_and_grants_batches() {
        let ledger = BoostLedger::new();
        assert_eq!(ledger.add("u-1", 2, "promo", "admin-1", now()).unwrap(), 2);

        let outcome = ledger.redeem("u-1", 3);
        assert!(outcome.success);
        assert_eq!(outcome.new_balance, 1);
        assert_eq!(outcome.batches_granted, 3);

        for _ in 0..3 {
            assert!(ledger.is_active("u-1"));
            assert!(ledger.consume_forced_slot("u-1"));
        }
        assert!(!ledger.is_active("u-1"));
        assert!(!ledger.consume_forced_slot("u-1"));
        assert_eq!(
            ledger.status("u-1"),
            BoostStatus {
                balance: 1,
                active_batches_remaining: 0,
            }
        );
    }

    #[test]
    fn test_redemptions_stack() {
        let ledger = BoostLedger::new();
        ledger.add("u-2", 2, "promo", "admin-1", now()).unwrap();
        ledger.redeem("u-2", 3);
        ledger.consume_forced_slot("u-2");
        ledger.redeem("u-2", 3);
        assert_eq!(ledger.status("u-2").active_batches_remaining, 5);
        assert_eq!(ledger.balance("u-2"), 0);

        let outcome = ledger.redeem("u-2", 3);
        assert!(!outcome.success);
        assert_eq!(outcome.new_balance, 0);
        assert_eq!(ledger.status("u-2").active_batches_remaining, 5);
    }

    #[test]
    fn test_add_rejects_non_positive_amounts() {
        let ledger = BoostLedger::new();
        for amount in [0, -1, i64::MIN] {
            let error = ledger.add("u-3", amount, "oops", "admin-1", now()).unwrap_err();
            assert_eq!(
                *error.get_details(),
                ErrorDetails::InvalidBoostAmount { amount }
            );
        }
        assert_eq!(ledger.balance("u-3"), 0);
        assert!(ledger.grants("u-3").is_empty());
    }

    #[test]
    fn test_grants_are_audited() {
        let ledger = BoostLedger::new();
        ledger.add("u-4", 5, "support ticket", "admin-7", now()).unwrap();
        ledger.add("u-4", 1, "apology", "admin-8", now()).unwrap();
        let grants = ledger.grants("u-4");
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].amount, 5);
        assert_eq!(grants[0].admin_id, "admin-7");
        assert_eq!(grants[1].reason, "apology");
        assert_eq!(ledger.balance("u-4"), 6);
    }

    #[test]
    fn test_concurrent_redeems_of_last_credit() {
        let ledger = Arc::new(BoostLedger::new());
        ledger.add("u-race", 1, "promo", "admin-1", now()).unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.redeem("u-race", 3).success
                })
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|success| *success)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(ledger.balance("u-race"), 0);
        assert_eq!(ledger.status("u-race").active_batches_remaining, 3);
    }
}
