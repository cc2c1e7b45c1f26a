//! Compact on-disk encoding for transaction outputs.
//!
//! Amounts are packed by folding trailing decimal zeros into an exponent.
//! Common script templates collapse to a one-byte tag plus their hash or
//! pubkey payload; everything else is stored raw behind a shifted length.

use emberd_consensus::constants::MAX_SCRIPT_SIZE;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::script::{
    OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_RETURN,
};
use emberd_primitives::TxOut;
use secp256k1::PublicKey;

/// Script tags 0..5 encode templates; raw lengths start here.
const SPECIAL_SCRIPTS: u64 = 6;

pub fn compress_amount(mut n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut e = 0u64;
    while n % 10 == 0 && e < 9 {
        n /= 10;
        e += 1;
    }
    if e < 9 {
        let d = n % 10;
        n /= 10;
        1 + (n * 9 + d - 1) * 10 + e
    } else {
        1 + (n - 1) * 10 + 9
    }
}

pub fn decompress_amount(mut x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    x -= 1;
    let e = x % 10;
    x /= 10;
    let mut n = if e < 9 {
        let d = (x % 9) + 1;
        x /= 9;
        x * 10 + d
    } else {
        x + 1
    };
    for _ in 0..e {
        n = n.wrapping_mul(10);
    }
    n
}

fn to_key_id(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        Some(&script[3..23])
    } else {
        None
    }
}

fn to_script_id(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        Some(&script[2..22])
    } else {
        None
    }
}

fn to_pubkey(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 35
        && script[0] == 33
        && script[34] == OP_CHECKSIG
        && (script[1] == 0x02 || script[1] == 0x03)
    {
        return Some(&script[1..34]);
    }
    if script.len() == 67 && script[0] == 65 && script[66] == OP_CHECKSIG && script[1] == 0x04 {
        let key = &script[1..66];
        // Only a valid curve point can be reconstructed from x alone.
        if PublicKey::from_slice(key).is_ok() {
            return Some(key);
        }
    }
    None
}

pub fn compress_script(script: &[u8]) -> Option<Vec<u8>> {
    if let Some(key_hash) = to_key_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x00);
        out.extend_from_slice(key_hash);
        return Some(out);
    }
    if let Some(script_hash) = to_script_id(script) {
        let mut out = Vec::with_capacity(21);
        out.push(0x01);
        out.extend_from_slice(script_hash);
        return Some(out);
    }
    if let Some(pubkey) = to_pubkey(script) {
        let mut out = Vec::with_capacity(33);
        if pubkey[0] == 0x02 || pubkey[0] == 0x03 {
            out.push(pubkey[0]);
        } else {
            out.push(0x04 | (pubkey[64] & 0x01));
        }
        out.extend_from_slice(&pubkey[1..33]);
        return Some(out);
    }
    None
}

fn special_script_size(tag: u8) -> usize {
    match tag {
        0 | 1 => 20,
        _ => 32,
    }
}

pub fn decompress_script(tag: u8, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match tag {
        0x00 => {
            let mut script = Vec::with_capacity(25);
            script.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
            script.extend_from_slice(payload);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            Ok(script)
        }
        0x01 => {
            let mut script = Vec::with_capacity(23);
            script.extend_from_slice(&[OP_HASH160, 20]);
            script.extend_from_slice(payload);
            script.push(OP_EQUAL);
            Ok(script)
        }
        0x02 | 0x03 => {
            let mut script = Vec::with_capacity(35);
            script.push(33);
            script.push(tag);
            script.extend_from_slice(payload);
            script.push(OP_CHECKSIG);
            Ok(script)
        }
        0x04 | 0x05 => {
            let mut compressed = [0u8; 33];
            compressed[0] = tag - 2;
            compressed[1..].copy_from_slice(payload);
            let key = PublicKey::from_slice(&compressed)
                .map_err(|_| DecodeError::InvalidData("invalid pubkey in compressed script"))?;
            let mut script = Vec::with_capacity(67);
            script.push(65);
            script.extend_from_slice(&key.serialize_uncompressed());
            script.push(OP_CHECKSIG);
            Ok(script)
        }
        _ => Err(DecodeError::InvalidData("unknown script compression tag")),
    }
}

pub fn write_txout(encoder: &mut Encoder, out: &TxOut) {
    encoder.write_varint128(compress_amount(out.value as u64));
    match compress_script(&out.script_pubkey) {
        Some(compressed) => encoder.write_bytes(&compressed),
        None => {
            encoder.write_varint128(out.script_pubkey.len() as u64 + SPECIAL_SCRIPTS);
            encoder.write_bytes(&out.script_pubkey);
        }
    }
}

pub fn read_txout(decoder: &mut Decoder) -> Result<TxOut, DecodeError> {
    let value = decompress_amount(decoder.read_varint128()?) as i64;
    let size = decoder.read_varint128()?;
    let script_pubkey = if size < SPECIAL_SCRIPTS {
        let tag = size as u8;
        let payload = decoder.read_bytes(special_script_size(tag))?;
        decompress_script(tag, &payload)?
    } else {
        let len = size - SPECIAL_SCRIPTS;
        if len > MAX_SCRIPT_SIZE as u64 {
            // Replace with an unspendable stand-in and skip the payload
            // instead of allocating an attacker-chosen length.
            let skip = usize::try_from(len).map_err(|_| DecodeError::SizeTooLarge)?;
            decoder.skip(skip)?;
            vec![OP_RETURN]
        } else {
            decoder.read_bytes(len as usize)?
        }
    };
    Ok(TxOut {
        value,
        script_pubkey,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{CENT, COIN, MAX_MONEY};

    fn roundtrip_amount(n: u64) {
        assert_eq!(decompress_amount(compress_amount(n)), n);
    }

    #[test]
    fn amount_compression_known_values() {
        assert_eq!(compress_amount(0), 0);
        assert_eq!(compress_amount(1), 1);
        assert_eq!(compress_amount(600_u64 * 100_000_000), 600);
        assert_eq!(decompress_amount(600), 60_000_000_000);
        assert_eq!(compress_amount(110_397), 993_571);
    }

    #[test]
    fn amount_compression_roundtrips() {
        for n in 0..=1000u64 {
            roundtrip_amount(n);
        }
        roundtrip_amount(CENT as u64);
        roundtrip_amount(COIN as u64);
        roundtrip_amount(50 * COIN as u64);
        roundtrip_amount(MAX_MONEY as u64);
        roundtrip_amount(u64::MAX / 10);
    }

    fn roundtrip_txout(out: TxOut) {
        let mut encoder = Encoder::new();
        write_txout(&mut encoder, &out);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(read_txout(&mut decoder).expect("decode"), out);
        assert!(decoder.is_empty());
    }

    #[test]
    fn p2pkh_compresses_to_21_bytes() {
        let mut script = vec![OP_DUP, OP_HASH160, 20];
        script.extend_from_slice(&[0xab; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        let compressed = compress_script(&script).expect("template");
        assert_eq!(compressed.len(), 21);
        assert_eq!(compressed[0], 0x00);
        roundtrip_txout(TxOut {
            value: 1234,
            script_pubkey: script,
        });
    }

    #[test]
    fn p2sh_compresses_to_21_bytes() {
        let mut script = vec![OP_HASH160, 20];
        script.extend_from_slice(&[0xcd; 20]);
        script.push(OP_EQUAL);
        let compressed = compress_script(&script).expect("template");
        assert_eq!(compressed.len(), 21);
        assert_eq!(compressed[0], 0x01);
        roundtrip_txout(TxOut {
            value: 0,
            script_pubkey: script,
        });
    }

    #[test]
    fn compressed_pubkey_compresses_to_33_bytes() {
        // Generator point x-coordinate, even y.
        let mut script = vec![33, 0x02];
        script.extend_from_slice(&generator_x());
        script.push(OP_CHECKSIG);
        let compressed = compress_script(&script).expect("template");
        assert_eq!(compressed.len(), 33);
        assert_eq!(compressed[0], 0x02);
        roundtrip_txout(TxOut {
            value: 5 * COIN,
            script_pubkey: script,
        });
    }

    #[test]
    fn uncompressed_pubkey_compresses_to_33_bytes() {
        let key = PublicKey::from_slice(&generator_compressed()).expect("generator");
        let mut script = vec![65];
        script.extend_from_slice(&key.serialize_uncompressed());
        script.push(OP_CHECKSIG);
        let compressed = compress_script(&script).expect("template");
        assert_eq!(compressed.len(), 33);
        assert_eq!(compressed[0], 0x04);
        roundtrip_txout(TxOut {
            value: 7,
            script_pubkey: script,
        });
    }

    #[test]
    fn invalid_uncompressed_pubkey_stays_raw() {
        // 0x04 with an x that is not on the curve cannot use the template.
        let mut script = vec![65, 0x04];
        script.extend_from_slice(&[0u8; 64]);
        script.push(OP_CHECKSIG);
        assert!(compress_script(&script).is_none());
        roundtrip_txout(TxOut {
            value: 1,
            script_pubkey: script,
        });
    }

    #[test]
    fn arbitrary_script_stays_raw() {
        let script = vec![0x51, 0x52, 0x53, 0x54];
        assert!(compress_script(&script).is_none());
        roundtrip_txout(TxOut {
            value: 99,
            script_pubkey: script,
        });
        roundtrip_txout(TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        });
    }

    fn generator_x() -> [u8; 32] {
        let mut x = [0u8; 32];
        x.copy_from_slice(&generator_compressed()[1..]);
        x
    }

    fn generator_compressed() -> [u8; 33] {
        let mut key = [0u8; 33];
        key[0] = 0x02;
        key[1..].copy_from_slice(&[
            0x79, 0xbe, 0x66, 0x7e, 0xf9, 0xdc, 0xbb, 0xac, 0x55, 0xa0, 0x62, 0x95, 0xce, 0x87,
            0x0b, 0x07, 0x02, 0x9b, 0xfc, 0xdb, 0x2d, 0xce, 0x28, 0xd9, 0x59, 0xf2, 0x81, 0x5b,
            0x16, 0xf8, 0x17, 0x98,
        ]);
        key
    }
}
