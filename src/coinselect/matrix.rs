//! Asset-by-coin quantity matrix and the scan that fills it

use super::group_tree::{AssetGroupTree, GroupResult};
use super::{CoinRecord, EngineContext};
use crate::asset::{AssetId, AssetKey};
use crate::cache::CoinSelectionCache;
use crate::error::{SelectionError, SelectionResult};
use crate::permissions::{PermissionRole, Permissions};
use crate::script::ParsedOutput;
use crate::transaction::OutPoint;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Scans above this size go through the parse cache.
const CACHE_MIN_COINS: usize = 2;

/// Quantities per asset row, one column per candidate coin, plus the
/// per-coin flags a build tracks.
#[derive(Debug, Clone, Default)]
pub struct CoinMatrix {
    rows: HashMap<AssetKey, Vec<i64>>,
    parsed: Vec<bool>,
    selected: Vec<bool>,
    saved: Vec<bool>,
    pure_native: Vec<bool>,
    index: HashMap<OutPoint, usize>,
}

impl CoinMatrix {
    pub fn new(coins: &[CoinRecord]) -> Self {
        let n = coins.len();
        Self {
            rows: HashMap::new(),
            parsed: vec![false; n],
            selected: vec![false; n],
            saved: vec![false; n],
            pure_native: vec![false; n],
            index: coins
                .iter()
                .enumerate()
                .map(|(i, c)| (c.outpoint, i))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsed.is_empty()
    }

    fn check_coin(&self, coin: usize) -> SelectionResult<()> {
        if coin >= self.len() {
            return Err(SelectionError::internal(format!(
                "coin {} outside a matrix of {}",
                coin,
                self.len()
            )));
        }
        Ok(())
    }

    /// Writes a coin's rows and marks it parsed. With `restrict`, only rows
    /// the request mentions are kept. Genesis rows never enter the matrix.
    pub fn insert_coin(
        &mut self,
        coin: usize,
        amounts: &[(AssetKey, i64)],
        restrict: Option<&BTreeMap<AssetKey, i64>>,
        pure_native: bool,
    ) -> SelectionResult<()> {
        self.check_coin(coin)?;
        let n = self.len();
        for (key, quantity) in amounts {
            if key.is_genesis() || *quantity == 0 {
                continue;
            }
            if restrict.map_or(false, |r| !r.contains_key(key)) {
                continue;
            }
            self.rows.entry(*key).or_insert_with(|| vec![0; n])[coin] += quantity;
        }
        self.parsed[coin] = true;
        self.pure_native[coin] = pure_native;
        Ok(())
    }

    pub fn is_parsed(&self, coin: usize) -> bool {
        self.parsed.get(coin).copied().unwrap_or(false)
    }

    pub fn is_selected(&self, coin: usize) -> bool {
        self.selected.get(coin).copied().unwrap_or(false)
    }

    pub fn is_pure_native(&self, coin: usize) -> bool {
        self.pure_native.get(coin).copied().unwrap_or(false)
    }

    /// Marks a parsed coin selected. Returns false if it already was.
    pub fn select(&mut self, coin: usize) -> SelectionResult<bool> {
        self.check_coin(coin)?;
        if !self.parsed[coin] {
            return Err(SelectionError::internal(format!(
                "coin {} selected without being parsed",
                coin
            )));
        }
        if self.selected[coin] {
            return Ok(false);
        }
        self.selected[coin] = true;
        Ok(true)
    }

    pub fn quantity(&self, key: &AssetKey, coin: usize) -> i64 {
        self.rows
            .get(key)
            .and_then(|row| row.get(coin))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the row over all parsed coins.
    pub fn available_total(&self, key: &AssetKey) -> i64 {
        self.row_total(key, |coin| self.parsed[coin])
    }

    pub fn selected_total(&self, key: &AssetKey) -> i64 {
        self.row_total(key, |coin| self.parsed[coin] && self.selected[coin])
    }

    fn row_total(&self, key: &AssetKey, include: impl Fn(usize) -> bool) -> i64 {
        self.rows.get(key).map_or(0, |row| {
            row.iter()
                .enumerate()
                .filter(|(coin, _)| include(*coin))
                .map(|(_, q)| *q)
                .sum()
        })
    }

    pub fn any_selected(&self) -> bool {
        self.selected.iter().any(|s| *s)
    }

    pub fn save_selection(&mut self) {
        self.saved.clone_from(&self.selected);
    }

    pub fn restore_selection(&mut self) {
        self.selected.clone_from(&self.saved);
    }

    pub fn selected_coins(&self) -> Vec<usize> {
        (0..self.len()).filter(|c| self.selected[*c]).collect()
    }

    pub fn parsed_count(&self) -> usize {
        self.parsed.iter().filter(|p| **p).count()
    }

    pub fn coin_for(&self, outpoint: &OutPoint) -> Option<usize> {
        self.index.get(outpoint).copied()
    }
}

/// What a scan learned about every candidate. `parsed[i]` is set for the
/// coins that may be spent in this build.
#[derive(Debug, Clone, Default)]
pub struct CoinScan {
    pub parsed: Vec<Option<ParsedOutput>>,
    pub pure_native: Vec<bool>,
    /// A coin was skipped because its address lacks send permission.
    pub no_send_coins: bool,
    /// A coin was skipped because it carries inline metadata.
    pub inline_coins: bool,
}

impl CoinScan {
    pub fn eligible(&self) -> usize {
        self.parsed.iter().filter(|p| p.is_some()).count()
    }

    /// Puts every eligible coin into the matrix.
    pub fn populate(
        &self,
        matrix: &mut CoinMatrix,
        restrict: Option<&BTreeMap<AssetKey, i64>>,
    ) -> SelectionResult<()> {
        for (coin, parsed) in self.parsed.iter().enumerate() {
            if let Some(parsed) = parsed {
                matrix.insert_coin(coin, &parsed.amounts, restrict, self.pure_native[coin])?;
            }
        }
        Ok(())
    }
}

/// Parses and classifies the candidates, deciding which of them this build
/// may spend. Coins with an unconfirmed issuance are skipped, as are coins
/// carrying inline metadata while that metadata is locked.
pub fn scan_coins(
    coins: &[CoinRecord],
    expected: Permissions,
    role_entities: &BTreeMap<PermissionRole, AssetId>,
    ctx: &EngineContext,
    tree: &mut AssetGroupTree,
    cache: Option<&CoinSelectionCache>,
) -> SelectionResult<CoinScan> {
    let cache = cache.filter(|_| coins.len() > CACHE_MIN_COINS);
    let mut scan = CoinScan {
        parsed: vec![None; coins.len()],
        pure_native: vec![false; coins.len()],
        ..CoinScan::default()
    };
    let mut skipped_genesis = 0usize;

    for (index, coin) in coins.iter().enumerate() {
        if !coin.spendable {
            continue;
        }

        let facts = match cache {
            Some(cache) => cache.facts_or_insert_with(&coin.outpoint, || {
                ctx.parser.coin_facts(&coin.output)
            }),
            None => ctx.parser.coin_facts(&coin.output),
        };

        if facts.required.contains(Permissions::ISSUE) {
            skipped_genesis += 1;
            continue;
        }
        if facts.inline_metadata && ctx.wallet.lock_inline_metadata {
            scan.inline_coins = true;
            continue;
        }

        let parsed = ctx
            .parser
            .resolve_coin(&facts, expected | Permissions::SEND, role_entities);

        let group = tree.classify(&parsed.real_assets(), true, ctx.catalog.as_ref())?;
        scan.pure_native[index] = group == GroupResult::NoRealAssets;

        if !parsed.allowed.contains(Permissions::SEND) {
            scan.no_send_coins = true;
            continue;
        }
        scan.parsed[index] = Some(parsed);
    }

    debug!(
        candidates = coins.len(),
        eligible = scan.eligible(),
        skipped_genesis,
        no_send = scan.no_send_coins,
        inline = scan.inline_coins,
        "coin scan finished"
    );
    Ok(scan)
}
