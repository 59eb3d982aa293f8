//! Block template to job construction

use super::coinbase::{build_coinbase, CoinbaseOutput, CoinbaseSpec};
use super::family::CoinFamily;
use super::merkle::{merkle_branches, merkle_root};
use super::{Job, JobId};
use crate::chain::BlockTemplate;
use crate::crypto::{sha256d, Hash256};
use crate::share::difficulty::bits_to_difficulty;
use crate::stratum::protocol::{StratumMethod, StratumNotification};
use crate::utils::hex_to_bytes;
use crate::{Error, Result};
use tracing::debug;

/// Witness commitment output header: OP_RETURN, push 36, magic
const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Static inputs to job construction
#[derive(Debug, Clone)]
pub struct JobBuilderConfig {
    pub family: CoinFamily,
    pub pool_tag: String,
    /// Script paid by the coinbase
    pub payout_script: Vec<u8>,
    pub max_block_bytes: usize,
    pub coinbase_reserve_bytes: usize,
}

/// Transactions admitted into a job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedTransactions {
    pub txids: Vec<Hash256>,
    pub wtxids: Vec<Hash256>,
    /// Concatenated raw transactions in block order
    pub data: Vec<u8>,
    /// Fees of transactions left out of the block
    pub dropped_fees: i64,
    pub dropped: usize,
}

impl SelectedTransactions {
    pub fn len(&self) -> usize {
        self.txids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }
}

/// A template after selection, ready to become a job
#[derive(Debug, Clone)]
pub struct PreparedTemplate {
    pub template: BlockTemplate,
    pub prev_hash: Hash256,
    pub bits: u32,
    pub selected: SelectedTransactions,
    pub coinbase_value: u64,
    pub fingerprint: Hash256,
}

/// Admit template transactions in order within `budget` bytes
pub fn select_transactions(template: &BlockTemplate, budget: usize) -> Result<SelectedTransactions> {
    let mut selected = SelectedTransactions::default();
    let mut included = vec![false; template.transactions.len()];
    let mut used = 0usize;

    for (index, tx) in template.transactions.iter().enumerate() {
        let raw = hex_to_bytes(&tx.data, None)
            .map_err(|e| Error::template(format!("transaction {}: {}", index, e)))?;

        let orphaned = tx
            .depends
            .iter()
            .any(|&dep| dep == 0 || dep > index || !included[dep - 1]);
        if orphaned || used + raw.len() > budget {
            selected.dropped += 1;
            selected.dropped_fees += tx.fee;
            continue;
        }

        let txid = Hash256::from_hex_be(&tx.txid)
            .map_err(|e| Error::template(format!("transaction {} txid: {}", index, e)))?;
        let wtxid = match &tx.hash {
            Some(hash) => Hash256::from_hex_be(hash)
                .map_err(|e| Error::template(format!("transaction {} hash: {}", index, e)))?,
            None => txid,
        };

        used += raw.len();
        included[index] = true;
        selected.txids.push(txid);
        selected.wtxids.push(wtxid);
        selected.data.extend_from_slice(&raw);
    }

    Ok(selected)
}

/// Identity of a template's block content, ignoring its timestamp
pub fn template_fingerprint(
    template: &BlockTemplate,
    prev_hash: &Hash256,
    bits: u32,
    selected: &SelectedTransactions,
    coinbase_value: u64,
) -> Hash256 {
    let mut data = Vec::with_capacity(48 + 32 * selected.len());
    data.extend_from_slice(&template.height.to_le_bytes());
    data.extend_from_slice(prev_hash.as_bytes());
    data.extend_from_slice(&bits.to_le_bytes());
    for txid in &selected.txids {
        data.extend_from_slice(txid.as_bytes());
    }
    data.extend_from_slice(&coinbase_value.to_le_bytes());
    sha256d(&data)
}

/// Witness commitment output script over the selected transactions
pub fn witness_commitment_script(wtxids: &[Hash256]) -> Vec<u8> {
    // The coinbase occupies the first leaf with an all-zero wtxid
    let mut leaves = Vec::with_capacity(wtxids.len() + 1);
    leaves.push(Hash256::ZERO);
    leaves.extend_from_slice(wtxids);
    let root = merkle_root(&leaves);

    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(root.as_bytes());
    let commitment = sha256d(&preimage);

    let mut script = WITNESS_COMMITMENT_HEADER.to_vec();
    script.extend_from_slice(commitment.as_bytes());
    script
}

/// Turns block templates into jobs
#[derive(Debug, Clone)]
pub struct JobBuilder {
    config: JobBuilderConfig,
}

impl JobBuilder {
    pub fn new(config: JobBuilderConfig) -> Result<Self> {
        config.family.layout().validate()?;
        if config.payout_script.is_empty() {
            return Err(Error::config("payout script is empty"));
        }
        let reserved = config.coinbase_reserve_bytes + config.family.header_reserve();
        if config.max_block_bytes <= reserved {
            return Err(Error::config(format!(
                "max block bytes {} leaves no room after {} reserved bytes",
                config.max_block_bytes, reserved
            )));
        }
        Ok(Self { config })
    }

    pub fn family(&self) -> CoinFamily {
        self.config.family
    }

    /// Bytes available to template transactions
    pub fn transaction_budget(&self) -> usize {
        self.config.max_block_bytes
            - self.config.coinbase_reserve_bytes
            - self.config.family.header_reserve()
    }

    /// Select transactions and fingerprint the result
    pub fn prepare(&self, template: BlockTemplate) -> Result<PreparedTemplate> {
        let prev_hash = template.prev_hash()?;
        let bits = template.bits_u32()?;
        let selected = select_transactions(&template, self.transaction_budget())?;
        if selected.dropped > 0 {
            debug!(
                height = template.height,
                dropped = selected.dropped,
                "Template transactions exceed the block budget"
            );
        }

        let dropped_fees = u64::try_from(selected.dropped_fees.max(0)).unwrap_or(0);
        let coinbase_value = template
            .coinbase_value
            .checked_sub(dropped_fees)
            .ok_or_else(|| Error::template("dropped fees exceed coinbase value"))?;
        let fingerprint =
            template_fingerprint(&template, &prev_hash, bits, &selected, coinbase_value);

        Ok(PreparedTemplate {
            template,
            prev_hash,
            bits,
            selected,
            coinbase_value,
            fingerprint,
        })
    }

    /// Build the immutable job for a prepared template
    pub fn build(&self, prepared: PreparedTemplate, id: JobId, clean: bool, now: u64) -> Result<Job> {
        let family = self.config.family;
        let template = &prepared.template;

        let witness_script = match &template.default_witness_commitment {
            Some(_) if prepared.selected.dropped > 0 => {
                Some(witness_commitment_script(&prepared.selected.wtxids))
            }
            Some(script) => Some(hex_to_bytes(script, None)?),
            None => None,
        };

        let mut outputs = vec![CoinbaseOutput {
            value: prepared.coinbase_value,
            script: self.config.payout_script.clone(),
        }];
        if let Some(script) = &witness_script {
            outputs.push(CoinbaseOutput {
                value: 0,
                script: script.clone(),
            });
        }

        let coinbase = build_coinbase(&CoinbaseSpec {
            height: template.height,
            pool_tag: &self.config.pool_tag,
            extranonce_len: family.coinbase_extranonce_len(),
            outputs,
            format: family.tx_format(),
        })?;
        if coinbase.len() > self.config.coinbase_reserve_bytes {
            return Err(Error::template(format!(
                "coinbase is {} bytes, only {} reserved",
                coinbase.len(),
                self.config.coinbase_reserve_bytes
            )));
        }

        let (merkle_branches, fixed_merkle_root) = if family.rolls_coinbase() {
            (merkle_branches(&prepared.selected.txids), None)
        } else {
            let mut leaves = Vec::with_capacity(prepared.selected.len() + 1);
            leaves.push(coinbase.txid(&[])?);
            leaves.extend_from_slice(&prepared.selected.txids);
            (Vec::new(), Some(merkle_root(&leaves)))
        };

        let commitment_root = commitment_root(template)?;
        let time = u32::try_from(template.cur_time)
            .map_err(|_| Error::template("curtime out of range"))?;
        let min_time = u32::try_from(template.min_time).unwrap_or(0);
        let header = family.build_header(
            template.version,
            &prepared.prev_hash,
            &fixed_merkle_root.unwrap_or_default(),
            &commitment_root,
            time,
            prepared.bits,
        )?;

        let mut job = Job {
            id,
            family,
            height: template.height,
            prev_hash: prepared.prev_hash,
            version: template.version,
            bits: prepared.bits,
            time,
            min_time,
            difficulty: bits_to_difficulty(prepared.bits, family.diff1_bits()),
            reward: prepared.coinbase_value,
            coinbase,
            merkle_branches,
            fixed_merkle_root,
            commitment_root,
            header,
            tx_count: prepared.selected.len() + 1,
            transactions: prepared.selected.data,
            witness: witness_script.is_some(),
            clean,
            fingerprint: prepared.fingerprint,
            created_at: now,
            notify_line: String::new(),
        };
        job.notify_line =
            StratumNotification::new(StratumMethod::Notify, family.notify_params(&job)).to_line()?;
        Ok(job)
    }
}

/// Extra header commitment for Equihash chains
fn commitment_root(template: &BlockTemplate) -> Result<Hash256> {
    let hex = template
        .default_roots
        .as_ref()
        .and_then(|roots| roots.block_commitments_hash.as_deref())
        .or(template.final_sapling_root_hash.as_deref());
    match hex {
        Some(hex) => Hash256::from_hex_be(hex)
            .map_err(|e| Error::template(format!("invalid commitment root: {}", e))),
        None => Ok(Hash256::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TemplateTransaction;
    use crate::job::test_support::{sample_template, PAYOUT_SCRIPT};

    fn tx(fill: u8, size: usize, fee: i64, depends: Vec<usize>) -> TemplateTransaction {
        TemplateTransaction {
            data: hex::encode(vec![fill; size]),
            txid: hex::encode([fill; 32]),
            hash: None,
            fee,
            depends,
        }
    }

    fn builder(family: CoinFamily, max_block_bytes: usize) -> JobBuilder {
        JobBuilder::new(JobBuilderConfig {
            family,
            pool_tag: "pool".into(),
            payout_script: hex::decode(PAYOUT_SCRIPT).unwrap(),
            max_block_bytes,
            coinbase_reserve_bytes: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_selection_respects_budget_and_dependencies() {
        let mut template = sample_template(CoinFamily::Bitcoin, false);
        template.transactions = vec![
            tx(1, 100, 10, vec![]),
            tx(2, 300, 20, vec![]),
            tx(3, 50, 30, vec![2]),
            tx(4, 50, 40, vec![1]),
        ];

        let selected = select_transactions(&template, 250).unwrap();
        assert_eq!(selected.txids.len(), 2);
        assert_eq!(selected.txids[0], Hash256::from_bytes([1; 32]));
        assert_eq!(selected.txids[1], Hash256::from_bytes([4; 32]));
        assert_eq!(selected.dropped, 2);
        assert_eq!(selected.dropped_fees, 50);
        assert_eq!(selected.data.len(), 150);

        let everything = select_transactions(&template, 10_000).unwrap();
        assert_eq!(everything.len(), 4);
        assert_eq!(everything.dropped_fees, 0);
    }

    #[test]
    fn test_dropped_fees_reduce_coinbase_value() {
        let mut template = sample_template(CoinFamily::Bitcoin, true);
        template.transactions = vec![tx(1, 400, 1_000, vec![]), tx(2, 400, 2_000, vec![])];

        let budget_for_one = 1000 + 80 + 400;
        let prepared = builder(CoinFamily::Bitcoin, budget_for_one)
            .prepare(template.clone())
            .unwrap();
        assert_eq!(prepared.selected.len(), 1);
        assert_eq!(prepared.coinbase_value, template.coinbase_value - 2_000);

        // A recomputed witness commitment replaces the template's
        let job = builder(CoinFamily::Bitcoin, budget_for_one)
            .build(prepared.clone(), JobId(1), true, 0)
            .unwrap();
        let expected = witness_commitment_script(&prepared.selected.wtxids);
        assert!(job
            .coinbase
            .coinbase2
            .windows(expected.len())
            .any(|w| w == expected.as_slice()));
    }

    #[test]
    fn test_fingerprint_ignores_time() {
        let b = builder(CoinFamily::Bitcoin, 1_000_000);
        let template = sample_template(CoinFamily::Bitcoin, false);
        let mut later = template.clone();
        later.cur_time += 30;
        assert_eq!(
            b.prepare(template.clone()).unwrap().fingerprint,
            b.prepare(later).unwrap().fingerprint
        );

        let mut more = template.clone();
        more.transactions.push(tx(9, 10, 5, vec![]));
        more.coinbase_value += 5;
        assert_ne!(
            b.prepare(template).unwrap().fingerprint,
            b.prepare(more).unwrap().fingerprint
        );
    }

    #[test]
    fn test_bitcoin_job_fields() {
        let b = builder(CoinFamily::Bitcoin, 1_000_000);
        let template = sample_template(CoinFamily::Bitcoin, true);
        let job = b
            .build(b.prepare(template.clone()).unwrap(), JobId(0x2a), true, 7)
            .unwrap();

        assert_eq!(job.id.to_string(), "0000002a");
        assert_eq!(job.header.len(), 80);
        assert_eq!(job.merkle_branches.len(), 2);
        assert!(job.fixed_merkle_root.is_none());
        assert_eq!(job.tx_count, template.transactions.len() + 1);
        assert!(job.witness);
        assert!((job.difficulty - 1.0).abs() < 1e-9);
        assert!(job.notify_line.starts_with("{\"id\":null,\"method\":\"mining.notify\""));
        assert!(job.notify_line.ends_with("true]}\n"));
    }

    #[test]
    fn test_equihash_job_fields() {
        let b = builder(CoinFamily::Equihash, 2_000_000);
        let template = sample_template(CoinFamily::Equihash, false);
        let job = b
            .build(b.prepare(template.clone()).unwrap(), JobId(1), false, 0)
            .unwrap();

        assert_eq!(job.header.len(), 140);
        assert!(job.merkle_branches.is_empty());
        let root = job.fixed_merkle_root.unwrap();
        assert_eq!(&job.header[36..68], root.as_bytes());
        assert_eq!(
            job.commitment_root.to_hex_be(),
            template.final_sapling_root_hash.clone().unwrap()
        );
        assert_eq!(job.coinbase.extranonce_len, 0);
    }

    #[test]
    fn test_builder_rejects_impossible_limits() {
        let result = JobBuilder::new(JobBuilderConfig {
            family: CoinFamily::Bitcoin,
            pool_tag: "pool".into(),
            payout_script: vec![0x51],
            max_block_bytes: 500,
            coinbase_reserve_bytes: 1000,
        });
        assert!(result.is_err());

        let result = JobBuilder::new(JobBuilderConfig {
            family: CoinFamily::Bitcoin,
            pool_tag: "pool".into(),
            payout_script: vec![],
            max_block_bytes: 1_000_000,
            coinbase_reserve_bytes: 1000,
        });
        assert!(result.is_err());
    }
}
