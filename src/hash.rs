//! Small hand-rolled mixing functions. The original leans on bit tricks
//! (`hvfs_hash_*`) rather than pulling in a hashing crate for this; we follow
//! that lead here since ring points, CBHT bucket indices, and the various
//! salts all want a cheap, deterministic 64-bit mix rather than a
//! cryptographic hash.

/// splitmix64 finalizer; used to avalanche a raw key before folding it down
/// to a bucket index or ring point.
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// Combines a uuid with a salt (e.g. virtual node index) the way the ring
/// and CBHT both need: distinct salts must not collide on related uuids.
pub fn combine(key: u64, salt: u64) -> u64 {
    mix64(key ^ mix64(salt.wrapping_add(0x9e3779b97f4a7c15)))
}

/// Folds a 64-bit hash down to the low `bits` bits, as CBHT directory
/// indexing does against the current global depth.
pub fn fold(hash: u64, bits: u32) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        hash
    } else {
        hash & ((1u64 << bits) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_is_deterministic_and_not_identity() {
        assert_eq!(mix64(42), mix64(42));
        assert_ne!(mix64(42), 42);
    }

    #[test]
    fn combine_distinguishes_salts() {
        assert_ne!(combine(100, 0), combine(100, 1));
    }

    #[test]
    fn fold_masks_low_bits() {
        assert_eq!(fold(0b1111_0000, 4), 0);
        assert_eq!(fold(0b1111_0101, 4), 0b0101);
        assert_eq!(fold(0xffff_ffff_ffff_ffff, 0), 0);
    }
}
