//! The view abstraction over the UTXO set.

use std::collections::HashMap;

use emberd_consensus::{Hash256, NULL_HASH};
use emberd_primitives::OutPoint;
use emberd_storage::StoreError;

use crate::coin::Coin;
use crate::hasher::SaltedOutpointHasher;

/// The entry differs from the parent view's version and must be written on
/// flush.
pub const DIRTY: u8 = 1 << 0;
/// The parent view holds no unspent coin for this outpoint. Lets a spend of
/// a just-added entry be erased locally instead of flushing a tombstone.
/// It is always safe to leave FRESH unset.
pub const FRESH: u8 = 1 << 1;

#[derive(Clone, Debug)]
pub struct CoinsCacheEntry {
    pub coin: Coin,
    pub flags: u8,
}

impl CoinsCacheEntry {
    pub fn new(coin: Coin) -> Self {
        Self { coin, flags: 0 }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }
}

impl Default for CoinsCacheEntry {
    fn default() -> Self {
        Self::new(Coin::spent())
    }
}

pub type CoinsMap = HashMap<OutPoint, CoinsCacheEntry, SaltedOutpointHasher>;

/// Read/write contract satisfied by every layer of a coins stack. Methods
/// take `&mut self` because reads on a cache layer pull entries in; a stack
/// is single-writer by construction.
pub trait CoinsView {
    /// The coin for an outpoint, or `None`. A spent coin must not be
    /// reported as present.
    fn coin(&mut self, outpoint: &OutPoint) -> Option<Coin>;

    /// Just check whether a given outpoint is unspent.
    fn have_coin(&mut self, outpoint: &OutPoint) -> bool {
        self.coin(outpoint).is_some()
    }

    /// The hash of the block whose post-state this view represents. The zero
    /// hash before the first write.
    fn best_block(&mut self) -> Hash256 {
        NULL_HASH
    }

    /// The `[new, old]` pair of a partially persisted best-block transition,
    /// empty when the state is consistent. Only the backing store ever
    /// reports anything here.
    fn head_blocks(&mut self) -> Vec<Hash256> {
        Vec::new()
    }

    /// Absorb a batch of coin changes and the new best block. Only DIRTY
    /// entries in `map` are meaningful; the map is consumed.
    fn batch_write(&mut self, map: CoinsMap, best_block: Hash256) -> Result<(), StoreError>;

    /// Estimated byte size of the backing state, zero when unknown.
    fn estimate_size(&self) -> usize {
        0
    }
}

/// A view over nothing: every lookup misses and writes are discarded. Used
/// as the floor of throwaway stacks.
#[derive(Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn coin(&mut self, _outpoint: &OutPoint) -> Option<Coin> {
        None
    }

    fn batch_write(&mut self, _map: CoinsMap, _best_block: Hash256) -> Result<(), StoreError> {
        Ok(())
    }
}
