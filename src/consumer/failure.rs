use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides which deliveries fail on purpose.
///
/// Each draw is a uniform integer in `[0, 100)`; the delivery fails when
/// the draw is below `percent`, so 0 never fails and 100 always does.
#[derive(Debug)]
pub struct FailureSimulator {
    percent: u8,
    rng: Mutex<StdRng>,
}

impl FailureSimulator {
    /// `percent` above 100 is treated as 100.
    pub fn new(percent: u8, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            percent: percent.min(100),
            rng: Mutex::new(rng),
        }
    }

    pub fn never() -> Self {
        Self::new(0, Some(0))
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn should_fail(&self) -> bool {
        let draw: u8 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..100);
        draw < self.percent
    }
}
