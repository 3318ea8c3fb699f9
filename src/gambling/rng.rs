//! Seedable randomness for the games.
//!
//! A single master generator hands out independent per-game generators, so
//! a configured seed reproduces every reel spin, shuffle and race.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Source of per-game RNGs.
#[derive(Debug)]
pub struct RngSource {
    master: Mutex<StdRng>,
}

impl RngSource {
    /// Seeded when `seed` is set, from OS entropy otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        let master = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            master: Mutex::new(master),
        }
    }

    /// A fresh generator for one game or session.
    pub fn fork(&self) -> StdRng {
        let seed = match self.master.lock() {
            Ok(mut rng) => rng.gen::<u64>(),
            // A poisoned master only means another thread panicked mid-draw.
            Err(poisoned) => poisoned.into_inner().gen::<u64>(),
        };
        StdRng::seed_from_u64(seed)
    }
}

impl Default for RngSource {
    fn default() -> Self {
        Self::new(None)
    }
}
