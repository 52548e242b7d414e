//! I/O abstractions shared by production code and deterministic simulation.
//!
//! Only randomness lives here today: simulated backends draw every fault
//! decision from an injected [`Rng`] so a run can be replayed from its seed.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness for fault injection and workload generation.
pub trait Rng: Send {
    fn next_u64(&mut self) -> u64;

    /// Returns true with the given probability (clamped to `0.0..=1.0`).
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `min..max`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}
