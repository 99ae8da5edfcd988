//! Holds on admitted generations that have not been recorded yet.
//!
//! An admitted check takes one hold for its identity. Holds count as a full batch against
//! the rolling windows until `record_usage` releases one or it lapses after
//! [`RESERVATION_TTL_SECONDS`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::Error;
use crate::identity::IdentityKey;
use crate::usage::{later_by, BatchWeight};

pub const RESERVATION_TTL_SECONDS: u64 = 5 * 60;

#[derive(Debug, Default)]
pub struct ReservationBook {
    // Expiry times per identity, oldest first
    holds: DashMap<IdentityKey, VecDeque<DateTime<Utc>>>,
}

fn drop_lapsed(holds: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    while holds.front().is_some_and(|expires_at| *expires_at <= now) {
        holds.pop_front();
    }
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight held for `key` at `now`.
    pub fn held(&self, key: &IdentityKey, now: DateTime<Utc>) -> BatchWeight {
        let live = self.holds.get(key).map_or(0, |holds| {
            holds.iter().filter(|expires_at| **expires_at > now).count()
        });
        BatchWeight::FULL.repeated(live)
    }

    /// Take a hold for `key`. Returns when it lapses.
    pub fn hold(&self, key: &IdentityKey, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        let expires_at = later_by(now, RESERVATION_TTL_SECONDS)?;
        let mut holds = self.holds.entry(key.clone()).or_default();
        drop_lapsed(&mut holds, now);
        holds.push_back(expires_at);
        Ok(expires_at)
    }

    /// Release the oldest live hold for `key`. Returns `false` if there was none.
    pub fn release(&self, key: &IdentityKey, now: DateTime<Utc>) -> bool {
        let Some(mut holds) = self.holds.get_mut(key) else {
            return false;
        };
        drop_lapsed(&mut holds, now);
        holds.pop_front().is_some()
    }

    /// When the next live hold for `key` lapses.
    pub fn next_expiry(&self, key: &IdentityKey, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.holds.get(key).and_then(|holds| {
            holds
                .iter()
                .find(|expires_at| **expires_at > now)
                .copied()
        })
    }

    /// Drop lapsed holds. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.holds.retain(|_, holds| {
            let before = holds.len();
            drop_lapsed(holds, now);
            removed += before - holds.len();
            !holds.is_empty()
        });
        removed
    }
}
