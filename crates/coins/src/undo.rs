//! Per-transaction undo data for block disconnects.

use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coin::Coin;

/// The coins consumed by one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<Coin>,
}

impl TxUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.prevouts.len() as u64);
        for coin in &self.prevouts {
            coin.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let mut prevouts = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            prevouts.push(Coin::decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { prevouts })
    }
}
