//! Consensus-wide limits shared across validation.

/// The maximum allowed size for a script, in bytes (network rule).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// The maximum allowed weight for a block (network rule).
pub const MAX_BLOCK_WEIGHT: u32 = 4_000_000;
/// Scale factor between base size and weight.
pub const WITNESS_SCALE_FACTOR: u32 = 4;
/// Serialized size of the smallest possible transaction output
/// (8-byte value plus a zero compact-size script length).
pub const MIN_TRANSACTION_OUTPUT_SIZE: u32 = 9;
pub const MIN_TRANSACTION_OUTPUT_WEIGHT: u32 = WITNESS_SCALE_FACTOR * MIN_TRANSACTION_OUTPUT_SIZE;
/// Upper bound on the number of outputs a single block can create.
pub const MAX_OUTPUTS_PER_BLOCK: u32 = MAX_BLOCK_WEIGHT / MIN_TRANSACTION_OUTPUT_WEIGHT;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
