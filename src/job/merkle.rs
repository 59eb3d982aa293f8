//! Merkle trees over transaction ids
//!
//! Stratum v1 jobs carry the coinbase's merkle branch: the sibling hashes
//! on the path from the (unknown) coinbase leaf to the root. Hashes are in
//! internal byte order throughout.

use crate::crypto::{sha256d_pair, Hash256};

/// Branch for the first leaf, given every other leaf in block order
pub fn merkle_branches(txids: &[Hash256]) -> Vec<Hash256> {
    let mut branches = Vec::new();
    // The first slot stands for the coinbase, which is not known yet
    let mut level: Vec<Hash256> = Vec::with_capacity(txids.len() + 1);
    level.push(Hash256::ZERO);
    level.extend_from_slice(txids);

    while level.len() > 1 {
        branches.push(level[1]);
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        next.push(Hash256::ZERO);
        for pair in level[2..].chunks(2) {
            next.push(sha256d_pair(&pair[0], &pair[1]));
        }
        level = next;
    }

    branches
}

/// Root from the coinbase txid and its branch
pub fn root_from_branches(coinbase_txid: &Hash256, branches: &[Hash256]) -> Hash256 {
    branches
        .iter()
        .fold(*coinbase_txid, |acc, branch| sha256d_pair(&acc, branch))
}

/// Root of a complete leaf list
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }

    let mut level = txids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| sha256d_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}
