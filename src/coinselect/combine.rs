//! Coin choice for consolidation builds

use super::group_tree::{AssetGroupTree, GroupId, GroupResult};
use super::matrix::{CoinMatrix, CoinScan};
use super::{CoinRecord, EngineContext};
use crate::error::{SelectionError, SelectionResult};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CombineBucket {
    Group(GroupId),
    PureNative,
}

/// Limits of one consolidation build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombineLimits {
    pub min_conf: i32,
    pub min_inputs: usize,
    pub max_inputs: usize,
}

/// Chooses coins to merge and marks them selected.
///
/// Coins whose assets span several groups are taken first since they can
/// only be merged as they are. The remaining budget goes to the groups
/// holding the most coins, smallest groups capped first; a group with a
/// single coin has nothing to merge with. Native value is capped at
/// `max_money`, and hitting that cap is the one case where fewer than
/// `min_inputs` coins are accepted.
pub fn select_coins_to_combine(
    matrix: &mut CoinMatrix,
    scan: &CoinScan,
    coins: &[CoinRecord],
    limits: CombineLimits,
    ctx: &EngineContext,
    tree: &mut AssetGroupTree,
) -> SelectionResult<usize> {
    let catalog = ctx.catalog.as_ref();
    let eligible = |coin: usize| coins[coin].depth >= limits.min_conf;

    let mut count = 0usize;
    let mut taken = vec![false; coins.len()];
    let mut buckets: BTreeMap<CombineBucket, usize> = BTreeMap::new();

    for (coin, parsed) in scan.parsed.iter().enumerate() {
        let Some(parsed) = parsed else {
            continue;
        };
        if count >= limits.max_inputs || !eligible(coin) {
            continue;
        }
        match tree.classify(&parsed.real_assets(), true, catalog)? {
            GroupResult::Unassigned | GroupResult::Conflict => {
                matrix.insert_coin(coin, &parsed.amounts, None, false)?;
                taken[coin] = true;
                count += 1;
            }
            GroupResult::NoRealAssets => *buckets.entry(CombineBucket::PureNative).or_default() += 1,
            GroupResult::Group(group) => *buckets.entry(CombineBucket::Group(group)).or_default() += 1,
        }
    }

    let mut quota: BTreeMap<CombineBucket, usize> = BTreeMap::new();
    if count < limits.max_inputs {
        let mut by_size: Vec<(CombineBucket, usize)> = buckets.into_iter().collect();
        by_size.sort_by_key(|(_, size)| *size);
        let mut full_count = count;
        for (bucket, size) in by_size {
            let allowed = if size <= 1 || full_count + 1 >= limits.max_inputs {
                0
            } else {
                size.min(limits.max_inputs - full_count)
            };
            full_count += allowed;
            quota.insert(bucket, allowed);
        }
    }

    let mut total_native = 0i64;
    let mut native_cap_hit = false;
    for (coin, parsed) in scan.parsed.iter().enumerate() {
        let Some(parsed) = parsed else {
            continue;
        };
        if taken[coin] || count >= limits.max_inputs || !eligible(coin) {
            continue;
        }
        let bucket = match tree.classify(&parsed.real_assets(), false, catalog)? {
            GroupResult::Group(group) => CombineBucket::Group(group),
            GroupResult::NoRealAssets => CombineBucket::PureNative,
            _ => continue,
        };
        let Some(remaining) = quota.get_mut(&bucket).filter(|r| **r > 0) else {
            continue;
        };
        let value = coins[coin].value();
        if total_native + value > ctx.params.max_money {
            native_cap_hit = true;
            continue;
        }
        matrix.insert_coin(coin, &parsed.amounts, None, bucket == CombineBucket::PureNative)?;
        taken[coin] = true;
        *remaining -= 1;
        count += 1;
        total_native += value;
    }

    if count < limits.min_inputs && (!native_cap_hit || count == 1) {
        debug!(found = count, required = limits.min_inputs, "not enough coins to combine");
        return Err(SelectionError::NotEnoughInputs {
            found: count,
            required: limits.min_inputs,
        });
    }

    for coin in (0..coins.len()).filter(|c| taken[*c]) {
        matrix.select(coin)?;
    }
    debug!(inputs = count, total_native, "coins chosen for combining");
    Ok(count)
}
