//! Salted hashing of outpoints for the in-memory coin map.

use std::hash::BuildHasher;
use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use siphasher::sip::SipHasher24;

fn salt() -> (u64, u64) {
    static SALT: OnceLock<(u64, u64)> = OnceLock::new();
    *SALT.get_or_init(|| {
        let mut rng = OsRng;
        (rng.next_u64(), rng.next_u64())
    })
}

/// Keyed SipHash-2-4 over outpoint bytes. The 128-bit key is drawn once per
/// process from the OS RNG, so an attacker who can choose transaction ids
/// cannot grind them into a single hash bucket.
#[derive(Clone, Copy, Debug)]
pub struct SaltedOutpointHasher {
    k0: u64,
    k1: u64,
}

impl SaltedOutpointHasher {
    pub fn new() -> Self {
        let (k0, k1) = salt();
        Self { k0, k1 }
    }
}

impl Default for SaltedOutpointHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildHasher for SaltedOutpointHasher {
    type Hasher = SipHasher24;

    fn build_hasher(&self) -> SipHasher24 {
        SipHasher24::new_with_keys(self.k0, self.k1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::OutPoint;
    use std::hash::{Hash, Hasher};

    fn hash_outpoint(build: &SaltedOutpointHasher, outpoint: &OutPoint) -> u64 {
        let mut hasher = build.build_hasher();
        outpoint.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn stable_within_process() {
        let outpoint = OutPoint::new([0x42; 32], 7);
        let a = SaltedOutpointHasher::new();
        let b = SaltedOutpointHasher::default();
        assert_eq!(hash_outpoint(&a, &outpoint), hash_outpoint(&b, &outpoint));
    }

    #[test]
    fn index_distinguishes_outpoints() {
        let build = SaltedOutpointHasher::new();
        let a = OutPoint::new([0x42; 32], 0);
        let b = OutPoint::new([0x42; 32], 1);
        assert_ne!(hash_outpoint(&build, &a), hash_outpoint(&build, &b));
    }
}
