//! Stable hashing utilities for deterministic derivations.
//!
//! Randomised dividers must be a deterministic consequence of explicit inputs
//! (the engine seed and the path being divided). These helpers provide a stable
//! FNV-1a 64-bit implementation for use across crates.
//!
//! NOTE: FNV-1a is **not** cryptographically secure.

/// 64-bit FNV-1a offset basis.
pub const FNV1A_OFFSET_BASIS_64: u64 = 0xcbf29ce484222325;
/// 64-bit FNV-1a prime.
pub const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01B3;

/// Mix bytes into an existing FNV-1a 64-bit hash state.
///
/// For each byte, XOR it into the hash and multiply by the FNV prime.
/// Use [`FNV1A_OFFSET_BASIS_64`] as the initial state for a fresh hash.
///
/// ```
/// use terrarium_foundation::stable_hash::{fnv1a64, fnv1a64_mix, FNV1A_OFFSET_BASIS_64};
///
/// let hash = fnv1a64_mix(FNV1A_OFFSET_BASIS_64, b"cell");
/// let hash = fnv1a64_mix(hash, b"/mass");
/// assert_eq!(hash, fnv1a64(b"cell/mass"));
/// ```
#[inline]
pub const fn fnv1a64_mix(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0usize;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
        i += 1;
    }
    hash
}

/// Hash an arbitrary byte slice with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_mix(FNV1A_OFFSET_BASIS_64, bytes)
}

/// Hash a UTF-8 string with FNV-1a 64-bit.
#[inline]
pub const fn fnv1a64_str(s: &str) -> u64 {
    fnv1a64(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_reference_values() {
        assert_eq!(fnv1a64(b""), FNV1A_OFFSET_BASIS_64);

        let a_hash = fnv1a64(b"a");
        let expected_a = (FNV1A_OFFSET_BASIS_64 ^ 0x61).wrapping_mul(FNV1A_PRIME_64);
        assert_eq!(a_hash, expected_a);
    }

    /// If these fail, the hash changed and seeded divisions are no longer reproducible.
    #[test]
    fn fnv1a64_regression_values() {
        assert_eq!(fnv1a64(b"hello"), 11831194018420276491);
        assert_eq!(fnv1a64(b"hello world"), 8618312879776256743);
    }
}
