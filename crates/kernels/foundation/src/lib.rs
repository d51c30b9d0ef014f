//! Terrarium Foundation
//!
//! Core foundational utilities for the Terrarium simulation engine.
//! Provides hierarchical path addressing, stable hashing and deterministic
//! random streams required across crates.

pub mod path;
pub mod rng;
pub mod stable_hash;

// Re-export path types at crate root
pub use path::{Path, Segment};

pub use rng::RngStream;

// Re-export stable hash items at crate root
pub use stable_hash::{
    FNV1A_OFFSET_BASIS_64, FNV1A_PRIME_64, fnv1a64, fnv1a64_mix, fnv1a64_str,
};

/// Simulated time, in the simulation's own units.
pub type Time = f64;

/// Round a simulated time to a fixed number of decimal places.
///
/// Clock comparisons go through this so that accumulated floating point
/// drift (0.1 + 0.2) never makes two equal times compare as distinct.
/// `None` leaves the value untouched.
pub fn round_time(time: Time, precision: Option<u32>) -> Time {
    match precision {
        Some(digits) => {
            let scale = 10f64.powi(digits as i32);
            (time * scale).round() / scale
        }
        None => time,
    }
}
