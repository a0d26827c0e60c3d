//! Multi-asset coin selection split into the group tree, the coin matrix,
//! the per-asset selector, change calculation, the fee iterator, combine
//! selection and the orchestrating build

pub mod builder;
pub mod change;
pub mod combine;
pub mod group_tree;
pub mod matrix;
pub mod orchestrator;
pub mod selector;

pub use group_tree::{AssetGroupTree, GroupId, GroupResult};
pub use matrix::{CoinMatrix, CoinScan};
pub use orchestrator::{build_transaction, BuildRequest, BuiltTransaction};

use crate::asset::AssetCatalog;
use crate::config::{ChainParams, Config, WalletConfig};
use crate::crypto::Signer;
use crate::error::SelectionResult;
use crate::fees::FeePolicy;
use crate::permissions::PermissionOracle;
use crate::script::{ScriptParser, StandardScriptParser};
use crate::transaction::{OutPoint, TxOut};
use std::cmp::Ordering;
use std::sync::Arc;

/// Groups the tree starts out aiming for before it grows its capacity.
pub const OPTIMAL_GROUP_COUNT: usize = 32;

/// One spendable candidate handed to a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinRecord {
    pub outpoint: OutPoint,
    pub output: TxOut,
    pub depth: i32,
    pub from_me: bool,
    pub spendable: bool,
}

impl CoinRecord {
    pub fn new(outpoint: OutPoint, output: TxOut, depth: i32, from_me: bool) -> Self {
        Self {
            outpoint,
            output,
            depth,
            from_me,
            spendable: true,
        }
    }

    pub fn value(&self) -> i64 {
        self.output.value
    }
}

/// Deeper coins first, then larger scripts, then by outpoint so that equal
/// wallets always produce equal selections.
pub fn compare_coins(a: &CoinRecord, b: &CoinRecord) -> Ordering {
    b.depth
        .cmp(&a.depth)
        .then_with(|| b.output.script.script_size().cmp(&a.output.script.script_size()))
        .then_with(|| a.outpoint.cmp(&b.outpoint))
}

pub fn sort_coins(coins: &mut [CoinRecord]) {
    coins.sort_by(compare_coins);
}

/// Everything a build consults besides the wallet itself.
#[derive(Clone)]
pub struct EngineContext {
    pub params: ChainParams,
    pub wallet: WalletConfig,
    pub oracle: Arc<dyn PermissionOracle>,
    pub catalog: Arc<dyn AssetCatalog>,
    pub fees: Arc<dyn FeePolicy>,
    pub signer: Arc<dyn Signer>,
    pub parser: Arc<dyn ScriptParser>,
}

impl EngineContext {
    pub fn new(
        config: &Config,
        oracle: Arc<dyn PermissionOracle>,
        catalog: Arc<dyn AssetCatalog>,
        fees: Arc<dyn FeePolicy>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let parser = Arc::new(StandardScriptParser::new(
            Arc::clone(&oracle),
            Arc::clone(&catalog),
            config.chain.anyone_can_receive_empty,
            config.chain.per_asset_permissions,
        ));
        Self {
            params: config.chain.clone(),
            wallet: config.wallet.clone(),
            oracle,
            catalog,
            fees,
            signer,
            parser,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ScriptParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Empty tree sized from the chain parameters.
    pub fn new_group_tree(&self) -> SelectionResult<AssetGroupTree> {
        AssetGroupTree::new(1, self.params.max_assets_per_group(), OPTIMAL_GROUP_COUNT)
    }
}
