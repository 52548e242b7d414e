//! Deterministic RNG for simulation runs.
//!
//! Same seed, same sequence of fault decisions. Backed by ChaCha8 so the
//! stream is stable across platforms.

use super::Rng;
use rand::SeedableRng;

/// Seeded RNG used by the simulated transport and the DST harness.
pub struct SimulatedRng {
    inner: rand_chacha::ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        SimulatedRng {
            inner: rand_chacha::ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl std::fmt::Debug for SimulatedRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedRng").finish_non_exhaustive()
    }
}

impl Rng for SimulatedRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng as _;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng as _;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = SimulatedRng::new(42);
        let mut b = SimulatedRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_gen_range_bounds() {
        let mut rng = SimulatedRng::new(7);
        for _ in 0..1000 {
            let v = rng.gen_range(10, 20);
            assert!((10..20).contains(&v));
        }
        assert_eq!(rng.gen_range(5, 5), 5);
    }

    #[test]
    fn test_gen_bool_extremes() {
        let mut rng = SimulatedRng::new(1);
        assert!(!rng.gen_bool(0.0));
        assert!(rng.gen_bool(1.0));
        assert!(rng.gen_bool(7.5), "probability is clamped");
    }
}
