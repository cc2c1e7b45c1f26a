//! A UTXO record: one unspent transaction output plus block metadata.

use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::TxOut;

use crate::compress;

/// Serialized as `varint128(height * 2 + coinbase)` followed by the compressed
/// output. A coin is spent when its output is the null sentinel; spent coins
/// carry no meaningful height or coinbase bit and cannot be serialized.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub out: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

static SPENT_COIN: Coin = Coin {
    out: TxOut {
        value: -1,
        script_pubkey: Vec::new(),
    },
    height: 0,
    is_coinbase: false,
};

impl Coin {
    pub fn new(out: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
        }
    }

    pub fn spent() -> Self {
        SPENT_COIN.clone()
    }

    /// The shared spent instance handed out by borrow-returning lookups.
    pub fn spent_sentinel() -> &'static Coin {
        &SPENT_COIN
    }

    pub fn is_spent(&self) -> bool {
        self.out.is_null()
    }

    pub fn clear(&mut self) {
        self.out.clear();
        self.height = 0;
        self.is_coinbase = false;
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.out.script_pubkey.capacity()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        assert!(!self.is_spent(), "cannot serialize a spent coin");
        let code = u64::from(self.height) * 2 + u64::from(self.is_coinbase);
        encoder.write_varint128(code);
        compress::write_txout(encoder, &self.out);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_varint128()?;
        let code =
            u32::try_from(code).map_err(|_| DecodeError::InvalidData("coin height out of range"))?;
        let out = compress::read_txout(decoder)?;
        Ok(Self {
            out,
            height: code >> 1,
            is_coinbase: code & 1 == 1,
        })
    }
}
