//! Coins view backed by the key-value store.
//!
//! On-disk layout:
//! - coin records live in the coins column under `'C' || txid ||
//!   varint128(index)`, value = obfuscated serialized coin;
//! - the best block hash sits in the meta column under `"B"`;
//! - an in-flight best-block transition is marked under `"H"` with
//!   `new_hash || old_hash`, erased once the write completes;
//! - the obfuscation key, when present, is stored under `"O"`.

use emberd_consensus::{Hash256, NULL_HASH};
use emberd_primitives::encoding::{Decoder, Encoder};
use emberd_primitives::OutPoint;
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::coin::Coin;
use crate::view::{CoinsMap, CoinsView};

const COIN_KEY_PREFIX: u8 = b'C';
const BEST_BLOCK_KEY: &[u8] = b"B";
const HEAD_BLOCKS_KEY: &[u8] = b"H";
const OBFUSCATE_KEY_KEY: &[u8] = b"O";
const OBFUSCATE_KEY_LEN: usize = 8;

/// Batches are committed in chunks of this many operations so a crash during
/// a large flush is detectable through the head-blocks marker.
const DEFAULT_BATCH_OPS: usize = 16 * 1024;

pub fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u8(COIN_KEY_PREFIX);
    encoder.write_hash_le(&outpoint.hash);
    encoder.write_varint128(u64::from(outpoint.index));
    encoder.into_inner()
}

fn parse_coin_key(key: &[u8]) -> Option<OutPoint> {
    let mut decoder = Decoder::new(key);
    if decoder.read_u8().ok()? != COIN_KEY_PREFIX {
        return None;
    }
    let hash = decoder.read_hash_le().ok()?;
    let index = u32::try_from(decoder.read_varint128().ok()?).ok()?;
    if !decoder.is_empty() {
        return None;
    }
    Some(OutPoint { hash, index })
}

pub struct CoinsDb<S> {
    store: S,
    obfuscate_key: Vec<u8>,
    batch_ops_limit: usize,
}

impl<S: KeyValueStore> CoinsDb<S> {
    pub fn open(store: S) -> Result<Self, StoreError> {
        Self::open_with_batch_limit(store, DEFAULT_BATCH_OPS)
    }

    pub fn open_with_batch_limit(store: S, batch_ops_limit: usize) -> Result<Self, StoreError> {
        let obfuscate_key = match store.get(Column::Meta, OBFUSCATE_KEY_KEY)? {
            Some(key) => key,
            None => {
                if store.get(Column::Meta, BEST_BLOCK_KEY)?.is_none() {
                    // Fresh database: install a value obfuscation key so raw
                    // attacker-chosen scripts never hit disk verbatim.
                    let mut key = vec![0u8; OBFUSCATE_KEY_LEN];
                    OsRng.fill_bytes(&mut key);
                    store.put(Column::Meta, OBFUSCATE_KEY_KEY, &key)?;
                    key
                } else {
                    // Database written before obfuscation existed.
                    Vec::new()
                }
            }
        };
        Ok(Self {
            store,
            obfuscate_key,
            batch_ops_limit: batch_ops_limit.max(2),
        })
    }

    fn obfuscate(&self, data: &mut [u8]) {
        if self.obfuscate_key.is_empty() {
            return;
        }
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.obfuscate_key[i % self.obfuscate_key.len()];
        }
    }

    /// Error-preserving lookup; the `CoinsView` impl degrades failures to
    /// "not found".
    pub fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = coin_key(outpoint);
        match self.store.get(Column::Coins, &key)? {
            Some(mut bytes) => {
                self.obfuscate(&mut bytes);
                let coin = Coin::decode(&bytes)
                    .map_err(|err| StoreError::Backend(format!("corrupt coin record: {err}")))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    pub fn read_best_block(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Backend("corrupt best block record".to_string()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn read_head_blocks(&self) -> Result<Vec<Hash256>, StoreError> {
        match self.store.get(Column::Meta, HEAD_BLOCKS_KEY)? {
            Some(bytes) if bytes.len() == 64 => {
                let mut new_hash = [0u8; 32];
                let mut old_hash = [0u8; 32];
                new_hash.copy_from_slice(&bytes[..32]);
                old_hash.copy_from_slice(&bytes[32..]);
                Ok(vec![new_hash, old_hash])
            }
            Some(_) => Err(StoreError::Backend(
                "corrupt head blocks record".to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }

    /// Ordered iteration over every stored coin. The snapshot is taken at
    /// call time and carries the best block it belongs to.
    pub fn cursor(&self) -> Result<CoinsCursor, StoreError> {
        let best_block = self.read_best_block()?.unwrap_or(NULL_HASH);
        let mut entries = Vec::new();
        for (key, mut value) in self.store.scan_prefix(Column::Coins, &[COIN_KEY_PREFIX])? {
            let Some(outpoint) = parse_coin_key(&key) else {
                return Err(StoreError::Backend("corrupt coin key".to_string()));
            };
            self.obfuscate(&mut value);
            let coin = Coin::decode(&value)
                .map_err(|err| StoreError::Backend(format!("corrupt coin record: {err}")))?;
            entries.push((outpoint, coin));
        }
        Ok(CoinsCursor {
            best_block,
            entries: entries.into_iter(),
        })
    }
}

impl<S: KeyValueStore> CoinsView for CoinsDb<S> {
    fn coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        match self.read_coin(outpoint) {
            Ok(coin) => coin,
            Err(err) => {
                emberd_log::log_warn!("coin lookup failed, treating as missing: {err}");
                None
            }
        }
    }

    fn have_coin(&mut self, outpoint: &OutPoint) -> bool {
        let key = coin_key(outpoint);
        matches!(self.store.get(Column::Coins, &key), Ok(Some(_)))
    }

    fn best_block(&mut self) -> Hash256 {
        match self.read_best_block() {
            Ok(Some(hash)) => hash,
            Ok(None) => NULL_HASH,
            Err(err) => {
                emberd_log::log_warn!("best block lookup failed: {err}");
                NULL_HASH
            }
        }
    }

    fn head_blocks(&mut self) -> Vec<Hash256> {
        self.read_head_blocks().unwrap_or_default()
    }

    fn batch_write(&mut self, map: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        let mut old_tip = self.read_best_block()?.unwrap_or(NULL_HASH);
        if old_tip == NULL_HASH {
            // A partially written state may be on disk; resume against the
            // hash the interrupted write was replacing.
            let old_heads = self.read_head_blocks()?;
            if old_heads.len() == 2 {
                old_tip = old_heads[1];
            }
        }

        let mut head_marker = Vec::with_capacity(64);
        head_marker.extend_from_slice(&best_block);
        head_marker.extend_from_slice(&old_tip);

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, HEAD_BLOCKS_KEY, head_marker);

        let total = map.len();
        let mut changed = 0usize;
        let mut batches = 1usize;
        for (outpoint, entry) in map {
            if !entry.is_dirty() {
                continue;
            }
            changed += 1;
            let key = coin_key(&outpoint);
            if entry.coin.is_spent() {
                batch.delete(Column::Coins, key);
            } else {
                let mut value = entry.coin.encode();
                self.obfuscate(&mut value);
                batch.put(Column::Coins, key, value);
            }
            if batch.len() >= self.batch_ops_limit {
                self.store.write_batch(&batch)?;
                batch = WriteBatch::new();
                batches += 1;
            }
        }

        batch.delete(Column::Meta, HEAD_BLOCKS_KEY);
        batch.put(Column::Meta, BEST_BLOCK_KEY, best_block);
        self.store.write_batch(&batch)?;
        emberd_log::log_debug!(
            "committed {changed} changed coin records (out of {total}) in {batches} batches"
        );
        Ok(())
    }

    fn estimate_size(&self) -> usize {
        self.store.size_estimate(Column::Coins) as usize
    }
}

pub struct CoinsCursor {
    best_block: Hash256,
    entries: std::vec::IntoIter<(OutPoint, Coin)>,
}

impl CoinsCursor {
    /// Best block at the time this cursor was created.
    pub fn best_block(&self) -> Hash256 {
        self.best_block
    }
}

impl Iterator for CoinsCursor {
    type Item = (OutPoint, Coin);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}
