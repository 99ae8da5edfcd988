//! Random draws for cooldown and ban durations.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait RandomSource: Send + Sync {
    /// Uniform draw from the closed range `[min, max]`. Returns `min` when the range is empty.
    fn uniform_inclusive(&self, min: u64, max: u64) -> u64;
}

#[derive(Debug)]
pub struct StdRandomSource {
    rng: Mutex<StdRng>,
}

impl StdRandomSource {
    /// Seeded from operating system entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Same seed, same sequence of durations.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for StdRandomSource {
    fn uniform_inclusive(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        // A panic while drawing cannot leave the generator in a bad state, so a poisoned lock is still usable.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.random_range(min..=max)
    }
}
