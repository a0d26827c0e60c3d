//! Wallet-side lifecycle of the coin-selection engine: the unspent index,
//! the asset group tree kept between builds, spent-record purging and
//! automatic consolidation of addresses holding many small coins.

pub mod store;
pub mod unspent;

use crate::asset::{AssetId, AssetKey};
use crate::cache::CoinSelectionCache;
use crate::coinselect::orchestrator::{build_transaction, BuildRequest, BuiltTransaction};
use crate::coinselect::{sort_coins, AssetGroupTree, EngineContext};
use crate::crypto::Address;
use crate::error::{Result, SelectionResult};
use crate::transaction::TxId;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use store::{CoinFilter, MemoryWalletStore, WalletStore};
use tracing::{debug, info, warn};
use unspent::{count_unspent, rebuild_index, UnspentIndex};

pub use store::WalletTx;

pub struct Wallet<S: WalletStore = MemoryWalletStore> {
    store: S,
    groups: AssetGroupTree,
    cache: Option<CoinSelectionCache>,
    unspent: UnspentIndex,
    next_optimization: i64,
}

impl<S: WalletStore> Wallet<S> {
    pub fn new(ctx: &EngineContext, store: S) -> SelectionResult<Self> {
        let cache = match ctx.wallet.cs_cache_size {
            0 => None,
            size => Some(CoinSelectionCache::new(size)),
        };
        let unspent = store.load_unspent_index()?;
        Ok(Self {
            store,
            groups: ctx.new_group_tree()?,
            cache,
            unspent,
            next_optimization: 0,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn group_tree(&self) -> &AssetGroupTree {
        &self.groups
    }

    pub fn unspent_index(&self) -> &UnspentIndex {
        &self.unspent
    }

    pub fn cache(&self) -> Option<&CoinSelectionCache> {
        self.cache.as_ref()
    }

    /// Builds without touching the store.
    pub fn build_transaction(
        &mut self,
        ctx: &EngineContext,
        request: &BuildRequest,
    ) -> SelectionResult<BuiltTransaction> {
        build_transaction(ctx, &self.store, &mut self.groups, self.cache.as_ref(), request)
    }

    /// Builds, commits and indexes a transaction.
    pub fn send(&mut self, ctx: &EngineContext, request: &BuildRequest) -> SelectionResult<BuiltTransaction> {
        let built = self.build_transaction(ctx, request)?;
        let txid = self.store.commit_transaction(built.transaction.clone())?;
        self.update_unspent_index(ctx, &txid)?;
        Ok(built)
    }

    /// Full rescan: rebuilds the unspent index and regroups every asset
    /// the wallet holds.
    pub fn initialize_unspent_index(&mut self, ctx: &EngineContext) -> SelectionResult<()> {
        self.unspent = rebuild_index(&self.store);

        let mut coins = self.store.available_coins(&CoinFilter {
            include_locked: true,
            ..CoinFilter::default()
        });
        sort_coins(&mut coins);
        let coin_assets: Vec<Vec<AssetKey>> = coins
            .iter()
            .map(|coin| {
                let facts = ctx.parser.coin_facts(&coin.output);
                facts.amounts.iter().map(|(k, _)| *k).filter(AssetKey::is_real).collect()
            })
            .collect();

        // capacity follows the assets the wallet holds, not the whole catalog
        let held: BTreeSet<&AssetId> = coin_assets
            .iter()
            .flatten()
            .filter_map(AssetKey::entity)
            .filter(|id| !ctx.params.per_asset_permissions || !ctx.catalog.requires_dedicated_group(id))
            .collect();

        let mut tree = ctx.new_group_tree()?;
        if !held.is_empty() {
            tree.resize(held.len());
        }
        for assets in &coin_assets {
            tree.classify(assets, true, ctx.catalog.as_ref())?;
        }
        self.groups = tree;
        self.groups.log_summary();

        self.store.save_unspent_index(&self.unspent)?;
        info!(
            transactions = self.unspent.len(),
            unspent = self.unspent.total_unspent(),
            groups = self.groups.group_count(),
            "unspent index initialized"
        );
        Ok(())
    }

    /// Recounts `txid` and the transactions its inputs spend from.
    pub fn update_unspent_index(&mut self, ctx: &EngineContext, txid: &TxId) -> SelectionResult<()> {
        let Some(wtx) = self.store.transaction(txid) else {
            return Ok(());
        };

        let mut touched: BTreeSet<TxId> = wtx.tx.inputs.iter().map(|i| i.previous_output.txid).collect();
        touched.insert(*txid);

        for output in wtx.tx.outputs.iter().filter(|o| self.store.is_mine(&o.script)) {
            let facts = ctx.parser.coin_facts(output);
            let assets: Vec<AssetKey> = facts.amounts.iter().map(|(k, _)| *k).filter(AssetKey::is_real).collect();
            self.groups.classify(&assets, true, ctx.catalog.as_ref())?;
        }

        for id in touched {
            let count = match self.store.transaction(&id) {
                Some(source) if source.depth >= 0 => count_unspent(&self.store, &id, source),
                _ => 0,
            };
            self.unspent.set(id, count);
        }
        self.store.save_unspent_index(&self.unspent)?;
        Ok(())
    }

    /// Erases fully spent transactions deeper than `min_depth`, at most
    /// `max_coins` per call.
    pub fn purge_spent_coins(&mut self, min_depth: i32, max_coins: usize) -> Result<usize> {
        let candidates: Vec<TxId> = self
            .store
            .transaction_ids()
            .into_iter()
            .filter(|txid| !self.unspent.contains(txid))
            .filter(|txid| self.store.transaction(txid).map_or(false, |w| w.depth > min_depth))
            .take(max_coins)
            .collect();

        let mut erased = 0;
        for txid in candidates {
            if self.store.erase_transaction(&txid)? {
                if let Some(cache) = &self.cache {
                    cache.invalidate_tx(&txid);
                }
                erased += 1;
            }
        }
        if erased > 0 {
            debug!(erased, "purged spent wallet transactions");
        }
        Ok(erased)
    }

    pub fn optimize_unspent(&mut self, ctx: &EngineContext) -> SelectionResult<usize> {
        self.optimize_unspent_at(ctx, Utc::now().timestamp())
    }

    /// Combines the coins of addresses holding more than
    /// `autocombine_min_inputs` of them. Returns the number of combine
    /// transactions committed. Does nothing before the next scheduled run.
    pub fn optimize_unspent_at(&mut self, ctx: &EngineContext, now: i64) -> SelectionResult<usize> {
        if now < self.next_optimization {
            return Ok(0);
        }
        self.next_optimization = now + ctx.wallet.autocombine_delay_secs;

        let wallet = &ctx.wallet;
        let max_txs = match wallet.autocombine_max_txs {
            0 => {
                let spacing = ctx.params.target_spacing_secs.max(0) as usize;
                (2000 * spacing / wallet.autocombine_max_inputs.max(1)).max(1)
            }
            configured => configured,
        };

        let mut counts: BTreeMap<Address, usize> = BTreeMap::new();
        for coin in self.store.available_coins(&CoinFilter::default()) {
            let min_depth = if coin.from_me {
                wallet.autocombine_min_conf
            } else {
                wallet.autocombine_min_conf.max(1)
            };
            if coin.depth < min_depth {
                continue;
            }
            if let Some(address) = coin.output.script.destination {
                *counts.entry(address).or_default() += 1;
            }
        }

        let addresses: Vec<Address> = counts
            .keys()
            .filter(|a| ctx.oracle.can_send(a) && ctx.oracle.can_receive(a))
            .copied()
            .collect();

        let mut committed = 0usize;
        for address in addresses {
            while committed < max_txs && counts.get(&address).copied().unwrap_or(0) > wallet.autocombine_min_inputs {
                let request = BuildRequest::combine(
                    address,
                    wallet.autocombine_min_conf,
                    wallet.autocombine_min_inputs,
                    wallet.autocombine_max_inputs,
                );
                let built = match self.build_transaction(ctx, &request) {
                    Ok(built) => built,
                    Err(err) => {
                        warn!(address = %hex::encode(address), error = %err, "combine transaction failed");
                        counts.insert(address, 0);
                        break;
                    }
                };

                let inputs = built.inputs.len();
                let outputs = built.transaction.outputs.len();
                let txid = self.store.commit_transaction(built.transaction)?;
                self.update_unspent_index(ctx, &txid)?;
                committed += 1;

                let count = counts.entry(address).or_default();
                *count = count.saturating_sub(inputs) + outputs;
                info!(
                    address = %hex::encode(address),
                    txid = %hex::encode(txid),
                    inputs,
                    outputs,
                    "combined unspent outputs"
                );
            }
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetRegistry;
    use crate::config::Config;
    use crate::crypto::KeyStore;
    use crate::fees::StandardFeePolicy;
    use crate::permissions::{PermissionTable, Permissions};
    use crate::persistence::InMemoryPersistence;
    use crate::script::OutputScript;
    use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
    use std::sync::Arc;

    fn create_test_address(s: &str) -> Address {
        let mut address = [0u8; 32];
        let bytes = s.as_bytes();
        address[..bytes.len()].copy_from_slice(bytes);
        address
    }

    fn setup(address: Address) -> (EngineContext, Wallet) {
        let table = PermissionTable::new();
        table.grant(address, Permissions::SEND | Permissions::RECEIVE);
        let ctx = EngineContext::new(
            &Config::default(),
            Arc::new(table),
            Arc::new(AssetRegistry::new()),
            Arc::new(StandardFeePolicy::default()),
            Arc::new(KeyStore::new()),
        );
        let mut store = MemoryWalletStore::new(Box::new(InMemoryPersistence::new()));
        store.add_address(address).unwrap();
        let wallet = Wallet::new(&ctx, store).unwrap();
        (ctx, wallet)
    }

    fn fund(wallet: &mut Wallet, ctx: &EngineContext, to: Address, values: &[i64], depth: i32, nonce: u32) -> TxId {
        let mut tx = Transaction::new();
        tx.lock_time = nonce;
        for value in values {
            tx.outputs.push(TxOut::new(*value, OutputScript::pay_to(to)));
        }
        let txid = wallet
            .store_mut()
            .add_transaction(WalletTx::new(tx, depth, false))
            .unwrap();
        wallet.update_unspent_index(ctx, &txid).unwrap();
        txid
    }

    #[test]
    fn test_index_tracks_spends() {
        let alice = create_test_address("alice");
        let (ctx, mut wallet) = setup(alice);
        let txid = fund(&mut wallet, &ctx, alice, &[100, 200], 3, 1);
        assert_eq!(wallet.unspent_index().get(&txid), Some(2));

        let mut spend = Transaction::new();
        spend.inputs.push(TxIn::new(OutPoint::new(txid, 0)));
        spend.inputs.push(TxIn::new(OutPoint::new(txid, 1)));
        let spend_id = wallet.store_mut().commit_transaction(spend).unwrap();
        wallet.update_unspent_index(&ctx, &spend_id).unwrap();

        assert!(!wallet.unspent_index().contains(&txid));
        assert_eq!(wallet.store().load_unspent_index().unwrap(), *wallet.unspent_index());
    }

    #[test]
    fn test_purge_keeps_unspent_and_shallow() {
        let alice = create_test_address("alice");
        let (ctx, mut wallet) = setup(alice);
        let deep = fund(&mut wallet, &ctx, alice, &[100], 20, 1);
        let kept = fund(&mut wallet, &ctx, alice, &[100], 20, 2);

        let mut spend = Transaction::new();
        spend.inputs.push(TxIn::new(OutPoint::new(deep, 0)));
        let spend_id = wallet.store_mut().commit_transaction(spend).unwrap();
        wallet.update_unspent_index(&ctx, &spend_id).unwrap();

        assert_eq!(wallet.purge_spent_coins(10, 100).unwrap(), 1);
        assert!(wallet.store().transaction(&deep).is_none());
        assert!(wallet.store().transaction(&kept).is_some());
        // zero-depth spend has no unspent output but is too shallow
        assert!(wallet.store().transaction(&spend_id).is_some());
    }

    #[test]
    fn test_optimize_respects_schedule() {
        let alice = create_test_address("alice");
        let (ctx, mut wallet) = setup(alice);
        assert_eq!(wallet.optimize_unspent_at(&ctx, 1_000).unwrap(), 0);
        // the gate now blocks until the delay passes
        let values = vec![100_000i64; 60];
        fund(&mut wallet, &ctx, alice, &values, 5, 1);
        assert_eq!(wallet.optimize_unspent_at(&ctx, 1_000).unwrap(), 0);
    }
}
