//! Free helpers translating connected and disconnected transactions into
//! cache mutations.

use emberd_consensus::constants::MAX_OUTPUTS_PER_BLOCK;
use emberd_consensus::Hash256;
use emberd_primitives::{OutPoint, Transaction};

use crate::cache::CoinsCache;
use crate::coin::Coin;
use crate::undo::TxUndo;
use crate::view::CoinsView;

/// Add all outputs of `tx` to the cache. Coinbase transactions always pass
/// `possible_overwrite` so the historic duplicate-coinbase occurrences
/// replace their earlier copies; with `check` set, the view is queried per
/// output instead.
pub fn add_tx_coins<V: CoinsView + ?Sized>(
    cache: &mut CoinsCache<V>,
    tx: &Transaction,
    height: u32,
    check: bool,
) {
    let is_coinbase = tx.is_coinbase();
    let txid = tx.txid();
    for (i, output) in tx.vout.iter().enumerate() {
        let outpoint = OutPoint::new(txid, i as u32);
        let overwrite = if check {
            cache.have_coin(&outpoint)
        } else {
            is_coinbase
        };
        cache.add_coin(
            &outpoint,
            Coin::new(output.clone(), height, is_coinbase),
            overwrite,
        );
    }
}

/// Spend the inputs of `tx` and add its outputs, returning the spent coins
/// for later disconnect.
pub fn update_tx_coins<V: CoinsView + ?Sized>(
    cache: &mut CoinsCache<V>,
    tx: &Transaction,
    height: u32,
) -> TxUndo {
    let mut undo = TxUndo::default();
    if !tx.is_coinbase() {
        undo.prevouts.reserve(tx.vin.len());
        for input in &tx.vin {
            let spent = cache.spend_coin(&input.prevout).unwrap_or_else(Coin::spent);
            undo.prevouts.push(spent);
        }
    }
    add_tx_coins(cache, tx, height, false);
    undo
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    /// Undo data matched the view exactly.
    Ok,
    /// The coin could be restored but the view disagreed with the undo data.
    Unclean,
    /// The coin cannot be restored.
    Failed,
}

/// Restore one spent coin while disconnecting a transaction input.
pub fn apply_tx_in_undo<V: CoinsView + ?Sized>(
    mut undo_coin: Coin,
    cache: &mut CoinsCache<V>,
    outpoint: &OutPoint,
) -> DisconnectResult {
    let mut clean = true;
    if cache.have_coin(outpoint) {
        // Restoring over an existing unspent output: the undo data and the
        // view disagree.
        clean = false;
    }
    if undo_coin.height == 0 {
        // Undo data from before per-input metadata was recorded. Recover the
        // height and coinbase bit from a surviving sibling output.
        let alternate = access_coin_by_txid(cache, &outpoint.hash).clone();
        if alternate.is_spent() {
            return DisconnectResult::Failed;
        }
        undo_coin.height = alternate.height;
        undo_coin.is_coinbase = alternate.is_coinbase;
    }
    cache.add_coin(outpoint, undo_coin, !clean);
    if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    }
}

/// Find any unspent output of `txid`, scanning output indices from zero.
/// Expensive: a full miss costs up to `MAX_OUTPUTS_PER_BLOCK` lookups
/// against the backing store, so use sparingly.
pub fn access_coin_by_txid<'c, V: CoinsView + ?Sized>(
    cache: &'c mut CoinsCache<'_, V>,
    txid: &Hash256,
) -> &'c Coin {
    let mut index = 0u32;
    while index < MAX_OUTPUTS_PER_BLOCK {
        let outpoint = OutPoint::new(*txid, index);
        if cache.have_coin(&outpoint) {
            return cache.access_coin(&outpoint);
        }
        index += 1;
    }
    Coin::spent_sentinel()
}
