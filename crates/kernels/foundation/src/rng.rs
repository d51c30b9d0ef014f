//! Deterministic Random Number Generation
//!
//! Stochastic dividers (binomial splitting of molecule counts, for example)
//! draw from streams derived from the engine seed and a stable label, so two
//! runs with the same seed divide identically.
//!
//! # PRNG Algorithm
//!
//! Uses SplitMix64: deterministic, portable and fast, with statistical quality
//! that is ample for simulation sampling.
//!
//! ```text
//! engine seed
//!   └─> derive("agents/1/counts/A") per divided leaf
//!         └─> advances with each draw, never resets
//! ```

use crate::stable_hash::fnv1a64_str;

/// Trial count above which [`RngStream::binomial`] switches to a normal
/// approximation instead of summing Bernoulli draws.
const BINOMIAL_EXACT_LIMIT: u64 = 1024;

/// A deterministic pseudo-random number stream.
///
/// Each call to a generation method advances the stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngStream {
    state: u64,
}

impl RngStream {
    /// Create a new RNG stream from a seed.
    #[inline]
    pub const fn new(seed: u64) -> Self {
        // SplitMix64 needs a non-zero state
        let state = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state }
    }

    /// Create a new RNG stream by combining a parent seed with a label.
    ///
    /// ```
    /// use terrarium_foundation::RngStream;
    ///
    /// let a = RngStream::derive(7, "agents/1/counts");
    /// let b = RngStream::derive(7, "agents/1/counts");
    /// assert_eq!(a, b);
    /// ```
    #[inline]
    pub fn derive(parent_seed: u64, label: &str) -> Self {
        let mixed = splitmix64_mix(parent_seed ^ fnv1a64_str(label));
        Self::new(mixed)
    }

    /// Get the current internal state.
    #[inline]
    pub const fn state(&self) -> u64 {
        self.state
    }

    /// Generate the next random u64 value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        self.state = splitmix64_next(self.state);
        splitmix64_mix(self.state)
    }

    /// Generate a uniform random f64 in [0, 1).
    #[inline]
    pub fn uniform(&mut self) -> f64 {
        u64_to_f64_01(self.next_u64())
    }

    /// Generate a standard normal value using Box-Muller.
    pub fn normal(&mut self) -> f64 {
        let u1 = self.uniform();
        let u2 = self.uniform();
        // log(0) guard
        let u1 = if u1 == 0.0 { f64::MIN_POSITIVE } else { u1 };
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Generate a random boolean with given probability of being true.
    #[inline]
    pub fn bool_with_prob(&mut self, probability: f64) -> bool {
        self.uniform() < probability
    }

    /// Sample the number of successes in `trials` Bernoulli trials.
    ///
    /// Small trial counts are sampled exactly. Large counts use the normal
    /// approximation, rounded and clamped into `[0, trials]`.
    pub fn binomial(&mut self, trials: u64, probability: f64) -> u64 {
        if trials == 0 || probability <= 0.0 {
            return 0;
        }
        if probability >= 1.0 {
            return trials;
        }
        if trials <= BINOMIAL_EXACT_LIMIT {
            return (0..trials)
                .filter(|_| self.bool_with_prob(probability))
                .count() as u64;
        }
        let n = trials as f64;
        let mean = n * probability;
        let stddev = (n * probability * (1.0 - probability)).sqrt();
        let sample = (mean + self.normal() * stddev).round();
        sample.clamp(0.0, n) as u64
    }
}

#[inline]
const fn splitmix64_next(state: u64) -> u64 {
    state.wrapping_add(0x9E3779B97F4A7C15)
}

#[inline]
const fn splitmix64_mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Convert a u64 to a uniform f64 in [0, 1) using the upper 53 bits.
#[inline]
const fn u64_to_f64_01(x: u64) -> f64 {
    (x >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}
