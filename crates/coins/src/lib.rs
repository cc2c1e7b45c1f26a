//! The layered UTXO set: coin records, views, the write-back cache, and
//! persistence to the key-value store.

pub mod apply;
pub mod cache;
pub mod coin;
pub mod compress;
pub mod db;
pub mod hasher;
pub mod undo;
pub mod view;

pub use apply::{
    access_coin_by_txid, add_tx_coins, apply_tx_in_undo, update_tx_coins, DisconnectResult,
};
pub use cache::CoinsCache;
pub use coin::Coin;
pub use db::{coin_key, CoinsCursor, CoinsDb};
pub use hasher::SaltedOutpointHasher;
pub use undo::TxUndo;
pub use view::{CoinsCacheEntry, CoinsMap, CoinsView, EmptyCoinsView, DIRTY, FRESH};
