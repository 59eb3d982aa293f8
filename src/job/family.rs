//! Coin families
//!
//! A closed set of variants, selected once at startup. Each family decides
//! its header layout, difficulty-1 target, extranonce placement, wire
//! formats for notify/submit, and block serialization.

use super::coinbase::{with_witness_reserved_value, TxFormat};
use super::encoding::{read_compact_size, swap_words, write_compact_size};
use super::layout::{HeaderField, HeaderLayout, BITCOIN_HEADER, EQUIHASH_HEADER};
use super::merkle::root_from_branches;
use super::Job;
use crate::crypto::{sha256d, Hash256};
use crate::share::difficulty::difficulty_to_target;
use crate::share::ShareSubmission;
use crate::stratum::protocol::StratumMethod;
use crate::utils::hex_to_bytes;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Extranonce1 size handed out to every session
pub const EXTRANONCE1_SIZE: usize = 4;

const BITCOIN_EXTRANONCE2_SIZE: usize = 4;
const EQUIHASH_NONCE_SIZE: usize = 32;

/// Bytes held back for an Equihash (200,9) solution and its length prefix
const EQUIHASH_SOLUTION_RESERVE: usize = 1347;

/// Supported coin families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
    /// 80-byte header, extranonce rolled inside the coinbase
    Bitcoin,
    /// 140-byte header plus solution, nonce rolled in the header
    Equihash,
}

impl fmt::Display for CoinFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinFamily::Bitcoin => write!(f, "bitcoin"),
            CoinFamily::Equihash => write!(f, "equihash"),
        }
    }
}

/// A share's header after patching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedShare {
    /// Exact bytes fed to the proof-of-work hash
    pub hash_input: Vec<u8>,
    /// Coinbase transaction for this share
    pub coinbase: Vec<u8>,
}

impl PatchedShare {
    /// Block hash as the chain identifies it
    pub fn block_hash(&self) -> Hash256 {
        sha256d(&self.hash_input)
    }
}

impl CoinFamily {
    pub fn layout(&self) -> &'static HeaderLayout {
        match self {
            CoinFamily::Bitcoin => &BITCOIN_HEADER,
            CoinFamily::Equihash => &EQUIHASH_HEADER,
        }
    }

    /// Compact bits of difficulty 1
    pub fn diff1_bits(&self) -> u32 {
        match self {
            CoinFamily::Bitcoin => 0x1d00ffff,
            CoinFamily::Equihash => 0x1f07ffff,
        }
    }

    /// Expected hashes per unit of difficulty, for hashrate estimates
    pub fn hashes_per_difficulty(&self) -> f64 {
        match self {
            CoinFamily::Bitcoin => 4_294_967_296.0,
            CoinFamily::Equihash => 8_192.0,
        }
    }

    pub fn extranonce1_size(&self) -> usize {
        EXTRANONCE1_SIZE
    }

    /// Bytes the miner chooses per share
    pub fn extranonce2_size(&self) -> usize {
        match self {
            CoinFamily::Bitcoin => BITCOIN_EXTRANONCE2_SIZE,
            CoinFamily::Equihash => EQUIHASH_NONCE_SIZE - EXTRANONCE1_SIZE,
        }
    }

    /// Extranonce bytes reserved inside the coinbase script
    pub fn coinbase_extranonce_len(&self) -> usize {
        match self {
            CoinFamily::Bitcoin => EXTRANONCE1_SIZE + BITCOIN_EXTRANONCE2_SIZE,
            CoinFamily::Equihash => 0,
        }
    }

    pub fn tx_format(&self) -> TxFormat {
        match self {
            CoinFamily::Bitcoin => TxFormat::Legacy,
            CoinFamily::Equihash => TxFormat::Sapling,
        }
    }

    /// Block bytes taken by the header and anything fixed-size around it
    pub fn header_reserve(&self) -> usize {
        match self {
            CoinFamily::Bitcoin => BITCOIN_HEADER.len,
            CoinFamily::Equihash => EQUIHASH_HEADER.len + EQUIHASH_SOLUTION_RESERVE,
        }
    }

    /// Whether the merkle root depends on the share
    pub fn rolls_coinbase(&self) -> bool {
        self.coinbase_extranonce_len() > 0
    }

    /// Result of `mining.subscribe`
    pub fn subscribe_result(&self, subscription_id: &str, extranonce1: &[u8]) -> Value {
        match self {
            CoinFamily::Bitcoin => json!([
                [
                    ["mining.set_difficulty", subscription_id],
                    ["mining.notify", subscription_id]
                ],
                hex::encode(extranonce1),
                BITCOIN_EXTRANONCE2_SIZE
            ]),
            CoinFamily::Equihash => json!([subscription_id, hex::encode(extranonce1)]),
        }
    }

    /// Method and params announcing a new share difficulty
    pub fn difficulty_message(&self, difficulty: f64) -> (StratumMethod, Value) {
        match self {
            CoinFamily::Bitcoin => (StratumMethod::SetDifficulty, json!([difficulty])),
            CoinFamily::Equihash => {
                let target = difficulty_to_target(difficulty, self.diff1_bits());
                (StratumMethod::SetTarget, json!([hex::encode(target)]))
            }
        }
    }

    /// Header skeleton with every template-time field filled in
    pub fn build_header(
        &self,
        version: u32,
        prev_hash: &Hash256,
        merkle_root: &Hash256,
        commitment_root: &Hash256,
        time: u32,
        bits: u32,
    ) -> Result<Vec<u8>> {
        let layout = self.layout();
        let mut header = layout.blank();
        layout.patch(&mut header, HeaderField::Version, &version.to_le_bytes())?;
        layout.patch(&mut header, HeaderField::PrevHash, prev_hash.as_bytes())?;
        layout.patch(&mut header, HeaderField::MerkleRoot, merkle_root.as_bytes())?;
        if *self == CoinFamily::Equihash {
            layout.patch(&mut header, HeaderField::CommitmentRoot, commitment_root.as_bytes())?;
        }
        layout.patch(&mut header, HeaderField::Time, &time.to_le_bytes())?;
        layout.patch(&mut header, HeaderField::Bits, &bits.to_le_bytes())?;
        Ok(header)
    }

    /// Merkle root for one share's coinbase
    pub fn compute_merkle(&self, job: &Job, coinbase: &[u8]) -> Hash256 {
        match job.fixed_merkle_root {
            Some(root) => root,
            None => root_from_branches(&sha256d(coinbase), &job.merkle_branches),
        }
    }

    /// `mining.notify` params, rendered once per job
    pub fn notify_params(&self, job: &Job) -> Value {
        match self {
            CoinFamily::Bitcoin => json!([
                job.id.to_string(),
                hex::encode(swap_words(job.prev_hash.as_bytes())),
                hex::encode(&job.coinbase.coinbase1),
                hex::encode(&job.coinbase.coinbase2),
                job.merkle_branches
                    .iter()
                    .map(Hash256::to_hex_le)
                    .collect::<Vec<_>>(),
                format!("{:08x}", job.version),
                format!("{:08x}", job.bits),
                format!("{:08x}", job.time),
                job.clean,
            ]),
            CoinFamily::Equihash => {
                let root = job.fixed_merkle_root.unwrap_or_default();
                json!([
                    job.id.to_string(),
                    hex::encode(job.version.to_le_bytes()),
                    job.prev_hash.to_hex_le(),
                    root.to_hex_le(),
                    job.commitment_root.to_hex_le(),
                    hex::encode(job.time.to_le_bytes()),
                    hex::encode(job.bits.to_le_bytes()),
                    job.clean,
                ])
            }
        }
    }

    /// Parse positional `mining.submit` params
    pub fn parse_submit(&self, params: &[Value]) -> Result<ShareSubmission> {
        let param = |index: usize| -> Result<&str> {
            params
                .get(index)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol(format!("submit parameter {} missing", index)))
        };

        match self {
            CoinFamily::Bitcoin => {
                let extranonce2 = hex_to_bytes(param(2)?, Some(BITCOIN_EXTRANONCE2_SIZE))?;
                let time = u32::from_str_radix(param(3)?, 16)
                    .map_err(|_| Error::protocol("invalid ntime"))?;
                let nonce = u32::from_str_radix(param(4)?, 16)
                    .map_err(|_| Error::protocol("invalid nonce"))?;
                Ok(ShareSubmission {
                    worker: param(0)?.to_string(),
                    job_id: param(1)?.to_string(),
                    extranonce2,
                    time,
                    nonce: nonce.to_le_bytes().to_vec(),
                    solution: Vec::new(),
                })
            }
            CoinFamily::Equihash => {
                let time_bytes = hex_to_bytes(param(2)?, Some(4))?;
                let mut time = [0u8; 4];
                time.copy_from_slice(&time_bytes);
                let extranonce2 = hex_to_bytes(param(3)?, Some(self.extranonce2_size()))?;
                let solution = hex_to_bytes(param(4)?, None)?;
                let (declared, prefix) = read_compact_size(&solution)?;
                if declared == 0 || solution.len() - prefix != declared as usize {
                    return Err(Error::protocol(format!(
                        "solution declares {} bytes, carries {}",
                        declared,
                        solution.len() - prefix
                    )));
                }
                Ok(ShareSubmission {
                    worker: param(0)?.to_string(),
                    job_id: param(1)?.to_string(),
                    extranonce2,
                    time: u32::from_le_bytes(time),
                    nonce: Vec::new(),
                    solution,
                })
            }
        }
    }

    /// Patch the job's header for one share
    pub fn patch_header(
        &self,
        job: &Job,
        extranonce1: &[u8],
        share: &ShareSubmission,
    ) -> Result<PatchedShare> {
        let layout = self.layout();
        let mut header = job.header.clone();
        layout.patch(&mut header, HeaderField::Time, &share.time.to_le_bytes())?;

        match self {
            CoinFamily::Bitcoin => {
                let mut extranonce = Vec::with_capacity(extranonce1.len() + share.extranonce2.len());
                extranonce.extend_from_slice(extranonce1);
                extranonce.extend_from_slice(&share.extranonce2);
                let coinbase = job.coinbase.assemble(&extranonce)?;
                let root = self.compute_merkle(job, &coinbase);
                layout.patch(&mut header, HeaderField::MerkleRoot, root.as_bytes())?;
                layout.patch(&mut header, HeaderField::Nonce, &share.nonce)?;
                Ok(PatchedShare {
                    hash_input: header,
                    coinbase,
                })
            }
            CoinFamily::Equihash => {
                let mut nonce = Vec::with_capacity(EQUIHASH_NONCE_SIZE);
                nonce.extend_from_slice(extranonce1);
                nonce.extend_from_slice(&share.extranonce2);
                layout.patch(&mut header, HeaderField::Nonce, &nonce)?;
                header.extend_from_slice(&share.solution);
                Ok(PatchedShare {
                    hash_input: header,
                    coinbase: job.coinbase.assemble(&[])?,
                })
            }
        }
    }

    /// Full block bytes for a winning share
    pub fn serialize_block(&self, job: &Job, share: &PatchedShare) -> Result<Vec<u8>> {
        let coinbase = if job.witness {
            with_witness_reserved_value(&share.coinbase)?
        } else {
            share.coinbase.clone()
        };

        let mut block = Vec::with_capacity(
            share.hash_input.len() + 9 + coinbase.len() + job.transactions.len(),
        );
        block.extend_from_slice(&share.hash_input);
        write_compact_size(&mut block, job.tx_count as u64);
        block.extend_from_slice(&coinbase);
        block.extend_from_slice(&job.transactions);
        Ok(block)
    }
}
