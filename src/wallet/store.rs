//! Wallet transaction storage consulted by coin selection

use super::unspent::UnspentIndex;
use crate::coinselect::CoinRecord;
use crate::crypto::Address;
use crate::error::{ChainError, Result};
use crate::persistence::Persistence;
use crate::script::OutputScript;
use crate::transaction::{OutPoint, Transaction, TxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// A transaction the wallet knows about. Negative depth marks a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTx {
    pub tx: Transaction,
    pub depth: i32,
    pub from_me: bool,
}

impl WalletTx {
    pub fn new(tx: Transaction, depth: i32, from_me: bool) -> Self {
        Self { tx, depth, from_me }
    }

    pub fn txid(&self) -> TxId {
        self.tx.txid()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinFilter {
    /// Only coins paying to one of these.
    pub addresses: Option<BTreeSet<Address>>,
    pub min_depth: i32,
    pub include_locked: bool,
}

pub trait WalletStore: Send {
    fn transaction(&self, txid: &TxId) -> Option<&WalletTx>;

    fn transaction_ids(&self) -> Vec<TxId>;

    fn is_mine(&self, script: &OutputScript) -> bool;

    fn is_spent(&self, outpoint: &OutPoint) -> bool;

    fn is_locked(&self, outpoint: &OutPoint) -> bool;

    fn own_addresses(&self) -> Vec<Address>;

    /// Adds a transaction the wallet created.
    fn commit_transaction(&mut self, tx: Transaction) -> Result<TxId>;

    /// Returns false when the transaction was unknown.
    fn erase_transaction(&mut self, txid: &TxId) -> Result<bool>;

    fn load_unspent_index(&self) -> Result<UnspentIndex>;

    fn save_unspent_index(&self, index: &UnspentIndex) -> Result<()>;

    /// Unspent, unlocked wallet outputs matching `filter`.
    fn available_coins(&self, filter: &CoinFilter) -> Vec<CoinRecord> {
        let mut coins = Vec::new();
        for txid in self.transaction_ids() {
            let Some(wtx) = self.transaction(&txid) else {
                continue;
            };
            if wtx.depth < 0 || wtx.depth < filter.min_depth {
                continue;
            }
            for (index, output) in wtx.tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                if !self.is_mine(&output.script) || self.is_spent(&outpoint) {
                    continue;
                }
                if !filter.include_locked && self.is_locked(&outpoint) {
                    continue;
                }
                if let Some(addresses) = &filter.addresses {
                    match output.script.destination {
                        Some(destination) if addresses.contains(&destination) => {}
                        _ => continue,
                    }
                }
                coins.push(CoinRecord::new(outpoint, output.clone(), wtx.depth, wtx.from_me));
            }
        }
        coins
    }
}

/// Keeps the wallet in memory and writes every change through to a
/// persistence backend.
pub struct MemoryWalletStore {
    transactions: BTreeMap<TxId, WalletTx>,
    spent: HashSet<OutPoint>,
    locked: HashSet<OutPoint>,
    addresses: BTreeSet<Address>,
    persistence: Box<dyn Persistence>,
}

impl MemoryWalletStore {
    pub fn new(persistence: Box<dyn Persistence>) -> Self {
        Self {
            transactions: BTreeMap::new(),
            spent: HashSet::new(),
            locked: HashSet::new(),
            addresses: BTreeSet::new(),
            persistence,
        }
    }

    /// Loads whatever the backend holds.
    pub fn open(persistence: Box<dyn Persistence>) -> Result<Self> {
        let mut store = Self::new(persistence);
        for wtx in store.persistence.load_wallet_txs()? {
            store.transactions.insert(wtx.txid(), wtx);
        }
        store.spent.extend(store.persistence.load_spent()?);
        store.addresses.extend(store.persistence.load_addresses()?);
        debug!(
            transactions = store.transactions.len(),
            spent = store.spent.len(),
            addresses = store.addresses.len(),
            "wallet store opened"
        );
        Ok(store)
    }

    pub fn add_address(&mut self, address: Address) -> Result<()> {
        self.persistence.save_address(&address)?;
        self.addresses.insert(address);
        Ok(())
    }

    /// Records a transaction and marks the outputs it spends.
    pub fn add_transaction(&mut self, wtx: WalletTx) -> Result<TxId> {
        let txid = wtx.txid();
        let spends: Vec<OutPoint> = wtx.tx.inputs.iter().map(|i| i.previous_output).collect();
        self.persistence.save_wallet_tx(&wtx)?;
        self.persistence.save_spent(&spends)?;
        self.spent.extend(spends);
        self.transactions.insert(txid, wtx);
        Ok(txid)
    }

    pub fn set_depth(&mut self, txid: &TxId, depth: i32) -> Result<()> {
        let wtx = self.transactions.get_mut(txid).ok_or_else(|| {
            ChainError::WalletError(format!("Unknown transaction {}", hex::encode(txid)))
        })?;
        wtx.depth = depth;
        self.persistence.save_wallet_tx(wtx)
    }

    pub fn lock_coin(&mut self, outpoint: OutPoint) {
        self.locked.insert(outpoint);
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) {
        self.locked.remove(outpoint);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl WalletStore for MemoryWalletStore {
    fn transaction(&self, txid: &TxId) -> Option<&WalletTx> {
        self.transactions.get(txid)
    }

    fn transaction_ids(&self) -> Vec<TxId> {
        self.transactions.keys().copied().collect()
    }

    fn is_mine(&self, script: &OutputScript) -> bool {
        script
            .destination
            .map_or(false, |d| self.addresses.contains(&d))
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.locked.contains(outpoint)
    }

    fn own_addresses(&self) -> Vec<Address> {
        self.addresses.iter().copied().collect()
    }

    fn commit_transaction(&mut self, tx: Transaction) -> Result<TxId> {
        self.add_transaction(WalletTx::new(tx, 0, true))
    }

    fn erase_transaction(&mut self, txid: &TxId) -> Result<bool> {
        if self.transactions.remove(txid).is_none() {
            return Ok(false);
        }
        self.persistence.erase_wallet_tx(txid)?;
        Ok(true)
    }

    fn load_unspent_index(&self) -> Result<UnspentIndex> {
        self.persistence.load_unspent_index()
    }

    fn save_unspent_index(&self, index: &UnspentIndex) -> Result<()> {
        self.persistence.save_unspent_index(index)
    }
}
