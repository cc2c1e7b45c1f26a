//! In-memory write-back cache over a coins view.
//!
//! Layers stack: reads fall through to the parent on miss and pull the entry
//! into this layer, writes land here only, and `flush` hands the dirty set to
//! the parent as one batch. Dropping a cache without flushing discards its
//! changes, which is the supported way to abandon a half-applied block.

use std::collections::hash_map::Entry;
use std::mem;

use emberd_consensus::{Amount, Hash256, NULL_HASH};
use emberd_primitives::script::is_unspendable;
use emberd_primitives::{OutPoint, Transaction};
use emberd_storage::StoreError;

use crate::coin::Coin;
use crate::view::{CoinsCacheEntry, CoinsMap, CoinsView, DIRTY, FRESH};

pub struct CoinsCache<'a, V: CoinsView + ?Sized> {
    parent: &'a mut V,
    map: CoinsMap,
    best_block: Hash256,
    /// Sum of the dynamic sizes of all cached coin records.
    cached_coins_usage: usize,
}

impl<'a, V: CoinsView + ?Sized> CoinsCache<'a, V> {
    pub fn new(parent: &'a mut V) -> Self {
        Self {
            parent,
            map: CoinsMap::default(),
            best_block: NULL_HASH,
            cached_coins_usage: 0,
        }
    }

    /// Local entry for `outpoint`, pulling it up from the parent on miss.
    /// An entry pulled up spent is marked FRESH: the parent holds only a
    /// tombstone, so this layer may treat the outpoint as absent.
    fn fetch(&mut self, outpoint: &OutPoint) -> Option<&mut CoinsCacheEntry> {
        match self.map.entry(outpoint.clone()) {
            Entry::Occupied(entry) => Some(entry.into_mut()),
            Entry::Vacant(slot) => {
                let coin = self.parent.coin(outpoint)?;
                let mut entry = CoinsCacheEntry::new(coin);
                if entry.coin.is_spent() {
                    entry.flags = FRESH;
                }
                self.cached_coins_usage += entry.coin.dynamic_memory_usage();
                Some(slot.insert(entry))
            }
        }
    }

    /// Borrowed access to the cached coin, or the shared spent sentinel when
    /// absent. Do not hold the borrow across other operations on this cache.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> &Coin {
        match self.fetch(outpoint) {
            Some(entry) => &entry.coin,
            None => Coin::spent_sentinel(),
        }
    }

    /// Insert or overwrite a coin. `possible_overwrite` exists for the
    /// historic duplicate-coinbase transactions whose outputs legally
    /// replace an earlier unspent copy; without it, adding over an unspent
    /// coin is a logic error and panics with the cache unchanged.
    pub fn add_coin(&mut self, outpoint: &OutPoint, coin: Coin, possible_overwrite: bool) {
        assert!(!coin.is_spent(), "add_coin requires an unspent coin");
        if is_unspendable(&coin.out.script_pubkey) {
            return;
        }
        match self.map.entry(outpoint.clone()) {
            Entry::Vacant(slot) => {
                let fresh = !possible_overwrite;
                self.cached_coins_usage += coin.dynamic_memory_usage();
                slot.insert(CoinsCacheEntry {
                    coin,
                    flags: DIRTY | if fresh { FRESH } else { 0 },
                });
            }
            Entry::Occupied(mut slot) => {
                let mut fresh = false;
                if !possible_overwrite {
                    if !slot.get().coin.is_spent() {
                        panic!("add_coin: replacing unspent coin without overwrite permission");
                    }
                    // The tombstone was never flushed, so the parent still
                    // has no unspent version of this coin.
                    fresh = !slot.get().is_dirty();
                }
                let entry = slot.get_mut();
                self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
                entry.coin = coin;
                entry.flags |= DIRTY | if fresh { FRESH } else { 0 };
                self.cached_coins_usage += entry.coin.dynamic_memory_usage();
            }
        }
    }

    /// Remove a coin, returning the prior record for undo bookkeeping. FRESH
    /// entries are erased outright; anything else leaves a DIRTY tombstone to
    /// carry the delete to the parent. No-op when nothing is known for the
    /// outpoint.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.fetch(outpoint)?;
        let entry = self.map.get_mut(outpoint).expect("entry was just fetched");
        self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
        if entry.is_fresh() {
            let entry = self.map.remove(outpoint).expect("entry was just fetched");
            Some(entry.coin)
        } else {
            entry.flags |= DIRTY;
            Some(mem::replace(&mut entry.coin, Coin::spent()))
        }
    }

    /// Same predicate as `have_coin`, but never touches the parent.
    pub fn have_coin_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.map
            .get(outpoint)
            .is_some_and(|entry| !entry.coin.is_spent())
    }

    /// Drop an unmodified entry to bound memory. Dirty or fresh entries are
    /// left alone.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Entry::Occupied(slot) = self.map.entry(outpoint.clone()) {
            if slot.get().flags == 0 {
                self.cached_coins_usage -= slot.get().coin.dynamic_memory_usage();
                slot.remove();
            }
        }
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    /// Push every modification up to the parent and empty this layer. After
    /// a failed flush the cache and its parent are in an undefined state;
    /// the whole stack should be discarded and rebuilt from the last
    /// committed best block.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let map = mem::take(&mut self.map);
        let result = self.parent.batch_write(map, self.best_block);
        self.cached_coins_usage = 0;
        result
    }

    /// Number of cached entries.
    pub fn cache_size(&self) -> usize {
        self.map.len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        // One control byte plus an (outpoint, entry) slot per bucket of
        // allocated map capacity, plus the tracked record bytes.
        self.map.capacity() * (mem::size_of::<(OutPoint, CoinsCacheEntry)>() + 1)
            + self.cached_coins_usage
    }

    /// Recompute the usage counter from the live entry set and panic if the
    /// maintained value drifted.
    pub fn sanity_check(&self) {
        let recomputed: usize = self
            .map
            .values()
            .map(|entry| entry.coin.dynamic_memory_usage())
            .sum();
        assert_eq!(
            recomputed, self.cached_coins_usage,
            "cached coin usage counter out of sync"
        );
    }

    /// Total input value of `tx` as seen by this view; zero for coinbase.
    pub fn value_in(&mut self, tx: &Transaction) -> Amount {
        if tx.is_coinbase() {
            return 0;
        }
        let mut total: Amount = 0;
        for input in &tx.vin {
            total += self.access_coin(&input.prevout).out.value;
        }
        total
    }

    /// Whether every prevout of `tx` is unspent in this view.
    pub fn have_inputs(&mut self, tx: &Transaction) -> bool {
        if tx.is_coinbase() {
            return true;
        }
        for input in &tx.vin {
            if !self.have_coin(&input.prevout) {
                return false;
            }
        }
        true
    }
}

impl<'a, V: CoinsView + ?Sized> CoinsView for CoinsCache<'a, V> {
    fn coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let entry = self.fetch(outpoint)?;
        if entry.coin.is_spent() {
            None
        } else {
            Some(entry.coin.clone())
        }
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> bool {
        self.fetch(outpoint)
            .map_or(false, |entry| !entry.coin.is_spent())
    }

    /// Lazily adopted from the parent on first read, then sticky until
    /// `set_best_block` or a merge overwrites it.
    fn best_block(&mut self) -> Hash256 {
        if self.best_block == NULL_HASH {
            self.best_block = self.parent.best_block();
        }
        self.best_block
    }

    fn head_blocks(&mut self) -> Vec<Hash256> {
        self.parent.head_blocks()
    }

    /// Merge a child cache's map into this layer. The child asserts parent
    /// state through its FRESH bits; a FRESH child entry colliding with a
    /// local unspent coin means the flag was misapplied upstream and the
    /// stack is corrupt, so this panics.
    fn batch_write(&mut self, map: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        for (outpoint, child_entry) in map {
            // Non-dirty child entries were pure read-through copies.
            if !child_entry.is_dirty() {
                continue;
            }
            match self.map.entry(outpoint) {
                Entry::Vacant(slot) => {
                    // A FRESH tombstone in the child means both layers agree
                    // the coin does not exist; nothing to record.
                    if !(child_entry.is_fresh() && child_entry.coin.is_spent()) {
                        // Keep the child's FRESH claim only if it made one;
                        // an entry this layer flushed on earlier may still
                        // exist in the grandparent.
                        let mut flags = DIRTY;
                        if child_entry.is_fresh() {
                            flags |= FRESH;
                        }
                        self.cached_coins_usage += child_entry.coin.dynamic_memory_usage();
                        slot.insert(CoinsCacheEntry {
                            coin: child_entry.coin,
                            flags,
                        });
                    }
                }
                Entry::Occupied(mut slot) => {
                    if child_entry.is_fresh() && !slot.get().coin.is_spent() {
                        panic!(
                            "batch_write: FRESH child entry collides with unspent parent coin"
                        );
                    }
                    if slot.get().is_fresh() && child_entry.coin.is_spent() {
                        // The grandparent never saw this coin; erasing here
                        // keeps the net view identical.
                        self.cached_coins_usage -= slot.get().coin.dynamic_memory_usage();
                        slot.remove();
                    } else {
                        let entry = slot.get_mut();
                        self.cached_coins_usage -= entry.coin.dynamic_memory_usage();
                        entry.coin = child_entry.coin;
                        self.cached_coins_usage += entry.coin.dynamic_memory_usage();
                        entry.flags |= DIRTY;
                        // The child's FRESH bit must not propagate: a pruned
                        // state here may still need to reach the grandparent.
                    }
                }
            }
        }
        self.best_block = best_block;
        Ok(())
    }

    fn estimate_size(&self) -> usize {
        self.parent.estimate_size()
    }
}
