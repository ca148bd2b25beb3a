//! Internal random number generator based on PCG32.
//!
//! PCG (Permuted Congruential Generator) is a family of simple, fast,
//! statistically good algorithms for random number generation. PCG32 has 64
//! bits of state, 32-bit output and a period of 2^64, which is plenty for
//! handshake nonces and simulated packet loss — and it is NOT
//! cryptographically secure.
//!
//! Reference: <https://www.pcg-random.org/>

use std::cell::RefCell;

/// Default increment for single-stream PCG32, from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Multiplier constant for the LCG step with 64-bit state.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG32 random number generator (the PCG-XSH-RR variant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a new generator with the given state and stream.
    ///
    /// The stream (increment) allows for multiple independent sequences;
    /// it is forced odd as the algorithm requires.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        // standard PCG seeding: step once, add the seed, step again
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a new generator from a 64-bit seed on the default stream.
    /// The same seed always produces the same sequence.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Creates a new generator seeded from system timing and thread identity.
    #[must_use]
    pub fn from_entropy() -> Self {
        use std::hash::{BuildHasher, Hasher};
        use std::time::{SystemTime, UNIX_EPOCH};

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        // RandomState is randomly keyed per process; hashing the timestamp
        // through it mixes in per-process entropy
        let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
        hasher.write_u64(nanos);
        Self::seed_from_u64(hasher.finish())
    }

    /// Generates the next 32-bit random value.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output function: xor-shift high bits, then random rotate
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates a value in `0..bound` without modulo bias (rejection sampling).
    #[inline]
    pub fn next_below(&mut self, bound: u32) -> u32 {
        debug_assert!(bound > 0);
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return value % bound;
            }
        }
    }
}

thread_local! {
    static THREAD_RNG: RefCell<Pcg32> = RefCell::new(Pcg32::from_entropy());
}

/// Returns a random `u32` from the thread-local generator.
#[must_use]
pub fn random() -> u32 {
    THREAD_RNG.with(|rng| rng.borrow_mut().next_u32())
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod rng_tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..100).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 5);
    }

    #[test]
    fn next_below_respects_bound() {
        let mut rng = Pcg32::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(rng.next_below(10) < 10);
        }
    }

    #[test]
    fn output_is_not_constant() {
        let mut rng = Pcg32::seed_from_u64(3);
        let first = rng.next_u32();
        assert!((0..32).any(|_| rng.next_u32() != first));
    }

    #[test]
    fn thread_local_random_produces_values() {
        // two draws colliding is astronomically unlikely
        let draws: Vec<u32> = (0..4).map(|_| random()).collect();
        assert!(draws.windows(2).any(|w| w[0] != w[1]));
    }
}
