//! Per-transaction count of outputs the wallet still owns unspent

use super::store::{WalletStore, WalletTx};
use crate::transaction::{OutPoint, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transactions holding at least one unspent wallet output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentIndex {
    counts: BTreeMap<TxId, u32>,
}

impl UnspentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, txid: &TxId) -> Option<u32> {
        self.counts.get(txid).copied()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.counts.contains_key(txid)
    }

    /// A zero count removes the transaction.
    pub fn set(&mut self, txid: TxId, count: u32) {
        if count == 0 {
            self.counts.remove(&txid);
        } else {
            self.counts.insert(txid, count);
        }
    }

    pub fn remove(&mut self, txid: &TxId) -> Option<u32> {
        self.counts.remove(txid)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total_unspent(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TxId, &u32)> {
        self.counts.iter()
    }
}

/// Outputs of `wtx` the wallet owns and has not spent.
pub fn count_unspent(store: &dyn WalletStore, txid: &TxId, wtx: &WalletTx) -> u32 {
    wtx.tx
        .outputs
        .iter()
        .enumerate()
        .filter(|(index, output)| {
            store.is_mine(&output.script) && !store.is_spent(&OutPoint::new(*txid, *index as u32))
        })
        .count() as u32
}

/// Scans every wallet transaction.
pub fn rebuild_index(store: &dyn WalletStore) -> UnspentIndex {
    let mut index = UnspentIndex::new();
    for txid in store.transaction_ids() {
        if let Some(wtx) = store.transaction(&txid) {
            if wtx.depth >= 0 {
                index.set(txid, count_unspent(store, &txid, wtx));
            }
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_count_removes() {
        let mut index = UnspentIndex::new();
        index.set([1u8; 32], 2);
        index.set([2u8; 32], 3);
        assert_eq!(index.total_unspent(), 5);

        index.set([1u8; 32], 0);
        assert!(!index.contains(&[1u8; 32]));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&[2u8; 32]), Some(3));
    }
}
