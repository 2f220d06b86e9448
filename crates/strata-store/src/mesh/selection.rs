//! Which accepting slabs receive replicas.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::SlabHandle;

/// Picks up to `count` slabs from candidates given in registration order.
pub trait SelectionStrategy: Send + fmt::Debug {
    fn select(
        &mut self,
        candidates: Vec<Arc<dyn SlabHandle>>,
        count: usize,
    ) -> Vec<Arc<dyn SlabHandle>>;
}

/// First `count` candidates, always in registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistrationOrder;

impl SelectionStrategy for RegistrationOrder {
    fn select(
        &mut self,
        mut candidates: Vec<Arc<dyn SlabHandle>>,
        count: usize,
    ) -> Vec<Arc<dyn SlabHandle>> {
        candidates.truncate(count);
        candidates
    }
}

/// Rotates the starting point through the candidate list so load spreads
/// across slabs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin {
    cursor: usize,
}

impl SelectionStrategy for RoundRobin {
    fn select(
        &mut self,
        mut candidates: Vec<Arc<dyn SlabHandle>>,
        count: usize,
    ) -> Vec<Arc<dyn SlabHandle>> {
        if candidates.is_empty() || count == 0 {
            return Vec::new();
        }
        let start = self.cursor % candidates.len();
        candidates.rotate_left(start);
        candidates.truncate(count);
        self.cursor = start + candidates.len();
        candidates
    }
}

/// Uniformly shuffled, from a seeded generator.
pub struct Shuffled {
    rng: StdRng,
}

impl Shuffled {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl fmt::Debug for Shuffled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shuffled").finish_non_exhaustive()
    }
}

impl SelectionStrategy for Shuffled {
    fn select(
        &mut self,
        mut candidates: Vec<Arc<dyn SlabHandle>>,
        count: usize,
    ) -> Vec<Arc<dyn SlabHandle>> {
        candidates.shuffle(&mut self.rng);
        candidates.truncate(count);
        candidates
    }
}
