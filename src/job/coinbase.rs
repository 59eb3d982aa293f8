//! Coinbase transaction synthesis
//!
//! The coinbase commits to the block height (BIP34) and a `/tag/` pool
//! marker in its signature script. When miners roll extranonce inside the
//! coinbase, the serialized transaction is split around the extranonce
//! bytes into `coinbase1` and `coinbase2`.

use super::encoding::{push_data, push_height, write_compact_size, WriteLe};
use crate::crypto::{sha256d, Hash256};
use crate::{Error, Result};

/// Consensus limit on coinbase script length
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

const SAPLING_VERSION: u32 = 0x8000_0004;
const SAPLING_VERSION_GROUP_ID: u32 = 0x892f_2085;

/// Transaction serialization used by a coin family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFormat {
    /// Pre-segwit layout; witness data is added separately when needed
    Legacy,
    /// Overwinter/Sapling v4 layout with empty shielded parts
    Sapling,
}

/// One coinbase output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseOutput {
    pub value: u64,
    pub script: Vec<u8>,
}

/// Inputs to coinbase synthesis
#[derive(Debug, Clone)]
pub struct CoinbaseSpec<'a> {
    pub height: u64,
    pub pool_tag: &'a str,
    /// Bytes reserved for extranonce1 + extranonce2; zero when the family
    /// rolls its nonce in the header instead
    pub extranonce_len: usize,
    pub outputs: Vec<CoinbaseOutput>,
    pub format: TxFormat,
}

/// Serialized coinbase split around the extranonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParts {
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub extranonce_len: usize,
}

impl CoinbaseParts {
    /// Full transaction for one extranonce value
    pub fn assemble(&self, extranonce: &[u8]) -> Result<Vec<u8>> {
        if extranonce.len() != self.extranonce_len {
            return Err(Error::encoding(format!(
                "extranonce is {} bytes, coinbase expects {}",
                extranonce.len(),
                self.extranonce_len
            )));
        }
        let mut tx =
            Vec::with_capacity(self.coinbase1.len() + extranonce.len() + self.coinbase2.len());
        tx.extend_from_slice(&self.coinbase1);
        tx.extend_from_slice(extranonce);
        tx.extend_from_slice(&self.coinbase2);
        Ok(tx)
    }

    /// Transaction id for one extranonce value
    pub fn txid(&self, extranonce: &[u8]) -> Result<Hash256> {
        Ok(sha256d(&self.assemble(extranonce)?))
    }

    /// Serialized size including the extranonce
    pub fn len(&self) -> usize {
        self.coinbase1.len() + self.extranonce_len + self.coinbase2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `/tag/` push identifying the pool
pub fn pool_tag_push(tag: &str) -> Vec<u8> {
    let mut script = Vec::new();
    if !tag.is_empty() {
        push_data(&mut script, format!("/{}/", tag).as_bytes());
    }
    script
}

/// Build the split coinbase
pub fn build_coinbase(spec: &CoinbaseSpec<'_>) -> Result<CoinbaseParts> {
    if spec.outputs.is_empty() {
        return Err(Error::template("coinbase needs at least one output"));
    }

    let mut script_prefix = Vec::new();
    push_height(&mut script_prefix, spec.height);
    script_prefix.extend_from_slice(&pool_tag_push(spec.pool_tag));
    if spec.extranonce_len > 0 {
        // Single push opcode covering the whole extranonce
        if spec.extranonce_len >= 0x4c {
            return Err(Error::template("extranonce too long for a direct push"));
        }
        script_prefix.push(spec.extranonce_len as u8);
    }

    let script_len = script_prefix.len() + spec.extranonce_len;
    if script_len > MAX_COINBASE_SCRIPT_LEN {
        return Err(Error::template(format!(
            "coinbase script is {} bytes, limit is {}",
            script_len, MAX_COINBASE_SCRIPT_LEN
        )));
    }
    if script_len < 2 {
        return Err(Error::template("coinbase script must be at least 2 bytes"));
    }

    let mut coinbase1 = Vec::with_capacity(64 + script_prefix.len());
    match spec.format {
        TxFormat::Legacy => coinbase1.put_u32_le(1),
        TxFormat::Sapling => {
            coinbase1.put_u32_le(SAPLING_VERSION);
            coinbase1.put_u32_le(SAPLING_VERSION_GROUP_ID);
        }
    }
    // One input spending the null outpoint
    write_compact_size(&mut coinbase1, 1);
    coinbase1.extend_from_slice(&[0u8; 32]);
    coinbase1.put_u32_le(0xffff_ffff);
    write_compact_size(&mut coinbase1, script_len as u64);
    coinbase1.extend_from_slice(&script_prefix);

    let mut coinbase2 = Vec::with_capacity(64);
    coinbase2.put_u32_le(0xffff_ffff); // sequence
    write_compact_size(&mut coinbase2, spec.outputs.len() as u64);
    for output in &spec.outputs {
        coinbase2.put_u64_le(output.value);
        write_compact_size(&mut coinbase2, output.script.len() as u64);
        coinbase2.extend_from_slice(&output.script);
    }
    coinbase2.put_u32_le(0); // lock time
    if spec.format == TxFormat::Sapling {
        coinbase2.put_u32_le(0); // expiry height
        coinbase2.put_i64_le(0); // value balance
        write_compact_size(&mut coinbase2, 0); // spends
        write_compact_size(&mut coinbase2, 0); // outputs
        write_compact_size(&mut coinbase2, 0); // joinsplits
    }

    Ok(CoinbaseParts {
        coinbase1,
        coinbase2,
        extranonce_len: spec.extranonce_len,
    })
}

/// Segwit serialization of a legacy coinbase
///
/// Inserts the marker and flag and a witness holding the 32-byte reserved
/// value that the witness commitment is computed against.
pub fn with_witness_reserved_value(tx: &[u8]) -> Result<Vec<u8>> {
    if tx.len() < 8 {
        return Err(Error::encoding("transaction too short"));
    }
    let (version, rest) = tx.split_at(4);
    let (body, lock_time) = rest.split_at(rest.len() - 4);

    let mut out = Vec::with_capacity(tx.len() + 2 + 34);
    out.extend_from_slice(version);
    out.extend_from_slice(&[0x00, 0x01]);
    out.extend_from_slice(body);
    write_compact_size(&mut out, 1);
    push_witness_item(&mut out, &[0u8; 32]);
    out.extend_from_slice(lock_time);
    Ok(out)
}

fn push_witness_item(out: &mut Vec<u8>, item: &[u8]) {
    write_compact_size(out, item.len() as u64);
    out.extend_from_slice(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(extranonce_len: usize, format: TxFormat) -> CoinbaseSpec<'static> {
        CoinbaseSpec {
            height: 840_000,
            pool_tag: "pool",
            extranonce_len,
            outputs: vec![CoinbaseOutput {
                value: 312_500_000,
                script: hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap(),
            }],
            format,
        }
    }

    #[test]
    fn test_legacy_coinbase_layout() {
        let parts = build_coinbase(&spec(8, TxFormat::Legacy)).unwrap();

        // version, input count, null outpoint
        assert_eq!(&parts.coinbase1[..5], &[1, 0, 0, 0, 1]);
        assert_eq!(&parts.coinbase1[5..37], &[0u8; 32]);
        assert_eq!(&parts.coinbase1[37..41], &[0xff; 4]);

        // script: height push (4) + tag push (1 + 6) + extranonce push opcode (1) + 8
        assert_eq!(parts.coinbase1[41], 4 + 7 + 1 + 8);
        assert_eq!(&parts.coinbase1[42..46], &[0x03, 0x40, 0xd1, 0x0c]);
        assert_eq!(&parts.coinbase1[46..53], b"\x06/pool/");
        assert_eq!(*parts.coinbase1.last().unwrap(), 8);

        // sequence then one output, lock time at the end
        assert_eq!(&parts.coinbase2[..4], &[0xff; 4]);
        assert_eq!(parts.coinbase2[4], 1);
        assert_eq!(&parts.coinbase2[5..13], &312_500_000u64.to_le_bytes());
        assert_eq!(&parts.coinbase2[parts.coinbase2.len() - 4..], &[0; 4]);

        let tx = parts.assemble(&[0xab; 8]).unwrap();
        assert_eq!(tx.len(), parts.len());
        assert!(parts.assemble(&[0xab; 7]).is_err());
        assert_ne!(
            parts.txid(&[0u8; 8]).unwrap(),
            parts.txid(&[1u8; 8]).unwrap()
        );
    }

    #[test]
    fn test_sapling_coinbase_layout() {
        let parts = build_coinbase(&spec(0, TxFormat::Sapling)).unwrap();
        assert_eq!(&parts.coinbase1[..4], &SAPLING_VERSION.to_le_bytes());
        assert_eq!(&parts.coinbase1[4..8], &SAPLING_VERSION_GROUP_ID.to_le_bytes());
        // lock time, expiry, value balance and three empty vectors
        assert_eq!(&parts.coinbase2[parts.coinbase2.len() - 19..], &[0u8; 19]);
        assert_eq!(parts.assemble(&[]).unwrap().len(), parts.len());
    }

    #[test]
    fn test_script_limit() {
        let long_tag = "x".repeat(90);
        let mut s = spec(8, TxFormat::Legacy);
        s.pool_tag = &long_tag;
        assert!(build_coinbase(&s).is_err());

        let mut s = spec(8, TxFormat::Legacy);
        s.outputs.clear();
        assert!(build_coinbase(&s).is_err());
    }

    #[test]
    fn test_witness_serialization() {
        let parts = build_coinbase(&spec(8, TxFormat::Legacy)).unwrap();
        let tx = parts.assemble(&[0u8; 8]).unwrap();
        let witness = with_witness_reserved_value(&tx).unwrap();

        assert_eq!(witness.len(), tx.len() + 2 + 1 + 1 + 32);
        assert_eq!(&witness[4..6], &[0x00, 0x01]);
        assert_eq!(&witness[..4], &tx[..4]);
        assert_eq!(&witness[witness.len() - 4..], &tx[tx.len() - 4..]);
    }
}
