//! Consensus constants and monetary rules.

pub mod constants;
pub mod money;

pub use money::{money_range, Amount, CENT, COIN, MAX_MONEY};

pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the "no block" sentinel.
pub const NULL_HASH: Hash256 = [0u8; 32];
