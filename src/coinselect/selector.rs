//! Per-asset coin selection over the matrix

use super::matrix::CoinMatrix;
use super::{CoinRecord, EngineContext};
use crate::asset::AssetKey;
use crate::error::{SelectionError, SelectionResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const SUBSET_ITERATIONS: usize = 1000;

/// (confirmations for own coins, confirmations for foreign coins)
const CONFIRMATION_TIERS: [(i32, i32); 2] = [(1, 6), (1, 1)];
const ZERO_CONF_TIER: (i32, i32) = (0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preference {
    /// Only coins carrying no real asset.
    PureNative,
    /// Only coins holding the row being covered.
    HoldsRow,
    Any,
}

/// Makes sure the selected coins cover `target` of `key`, reusing coins
/// selected for earlier rows and adding unselected parsed coins otherwise.
pub fn select_asset_coins(
    matrix: &mut CoinMatrix,
    coins: &[CoinRecord],
    key: AssetKey,
    target: i64,
    ctx: &EngineContext,
) -> SelectionResult<()> {
    let available = matrix.available_total(&key);
    if target > available {
        return Err(SelectionError::InsufficientFunds(format!(
            "{} needed: {}, available: {}",
            key, target, available
        )));
    }

    let remaining = target - matrix.selected_total(&key);
    if remaining <= 0 && matrix.any_selected() {
        return Ok(());
    }

    let first = if key.is_special() {
        Preference::PureNative
    } else {
        Preference::HoldsRow
    };
    let cent = if key == AssetKey::Native { ctx.params.cent } else { 0 };

    for preference in [first, Preference::Any] {
        let mut tiers = CONFIRMATION_TIERS.to_vec();
        if ctx.wallet.spend_zero_conf_change {
            tiers.push(ZERO_CONF_TIER);
        }
        for (conf_mine, conf_theirs) in tiers {
            let candidates = Candidates {
                matrix,
                coins,
                key,
                conf_mine,
                conf_theirs,
                preference,
            };
            if let Some(chosen) = select_min_conf(&candidates, remaining.max(0), cent) {
                for coin in chosen {
                    matrix.select(coin)?;
                }
                return Ok(());
            }
        }
    }

    debug!(%key, target, remaining, "no coin subset covers the row");
    Err(SelectionError::InsufficientFunds(format!(
        "could not select coins for {} {}",
        remaining, key
    )))
}

struct Candidates<'a> {
    matrix: &'a CoinMatrix,
    coins: &'a [CoinRecord],
    key: AssetKey,
    conf_mine: i32,
    conf_theirs: i32,
    preference: Preference,
}

impl Candidates<'_> {
    fn usable(&self, coin: usize) -> bool {
        let record = &self.coins[coin];
        let min_depth = if record.from_me { self.conf_mine } else { self.conf_theirs };
        if !record.spendable || record.depth < min_depth {
            return false;
        }
        if !self.matrix.is_parsed(coin) || self.matrix.is_selected(coin) {
            return false;
        }
        match self.preference {
            Preference::PureNative => self.matrix.is_pure_native(coin),
            Preference::HoldsRow => self.matrix.quantity(&self.key, coin) != 0,
            Preference::Any => true,
        }
    }
}

/// One confirmation tier of the classic wallet algorithm: an exact match,
/// else all smaller coins if they add up exactly, else the lowest larger
/// coin or an approximate best subset of the smaller ones.
fn select_min_conf(candidates: &Candidates, target: i64, cent: i64) -> Option<Vec<usize>> {
    let mut lower: Vec<(i64, usize)> = Vec::new();
    let mut total_lower = 0i64;
    let mut lowest_larger: Option<(i64, usize)> = None;

    for coin in 0..candidates.coins.len() {
        if !candidates.usable(coin) {
            continue;
        }
        let quantity = candidates.matrix.quantity(&candidates.key, coin);
        if quantity <= 0 {
            if quantity == 0 && target == 0 {
                return Some(vec![coin]);
            }
            continue;
        }

        if quantity == target {
            return Some(vec![coin]);
        } else if quantity < target + cent {
            lower.push((quantity, coin));
            total_lower += quantity;
        } else if lowest_larger.map_or(true, |(value, _)| quantity < value) {
            lowest_larger = Some((quantity, coin));
        }
    }

    if total_lower == target {
        if lower.is_empty() {
            return match (target, lowest_larger) {
                (0, Some((_, coin))) => Some(vec![coin]),
                _ => None,
            };
        }
        return Some(lower.into_iter().map(|(_, coin)| coin).collect());
    }

    if total_lower < target {
        return lowest_larger.map(|(_, coin)| vec![coin]);
    }

    lower.sort_by(|a, b| b.cmp(a));
    let mut rng = StdRng::seed_from_u64(subset_seed(target, lower.len()));
    let (mut best, mut best_total) = approximate_best_subset(&lower, total_lower, target, &mut rng);
    if best_total != target && total_lower >= target + cent {
        (best, best_total) = approximate_best_subset(&lower, total_lower, target + cent, &mut rng);
    }

    let chosen: Vec<usize> = match lowest_larger {
        Some((value, coin))
            if (best_total != target && best_total < target + cent) || value <= best_total =>
        {
            vec![coin]
        }
        _ => lower
            .iter()
            .zip(best.iter())
            .filter(|(_, included)| **included)
            .map(|((_, coin), _)| *coin)
            .collect(),
    };

    if target == 0 && chosen.is_empty() {
        return None;
    }
    Some(chosen)
}

fn subset_seed(target: i64, candidates: usize) -> u64 {
    (target as u64).rotate_left(17) ^ candidates as u64
}

/// Randomized search for the subset of `values` closest to, but not
/// below, `target`.
fn approximate_best_subset(
    values: &[(i64, usize)],
    total_lower: i64,
    target: i64,
    rng: &mut StdRng,
) -> (Vec<bool>, i64) {
    let mut best = vec![true; values.len()];
    let mut best_total = total_lower;

    for _ in 0..SUBSET_ITERATIONS {
        if best_total == target {
            break;
        }
        let mut included = vec![false; values.len()];
        let mut total = 0i64;
        let mut reached = false;
        for pass in 0..2 {
            if reached {
                break;
            }
            for i in 0..values.len() {
                let take = if pass == 0 { rng.gen::<bool>() } else { !included[i] };
                if !take {
                    continue;
                }
                total += values[i].0;
                included[i] = true;
                if total >= target {
                    reached = true;
                    if total < best_total {
                        best_total = total;
                        best.clone_from(&included);
                    }
                    total -= values[i].0;
                    included[i] = false;
                }
            }
        }
    }
    (best, best_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetRegistry;
    use crate::config::Config;
    use crate::crypto::KeyStore;
    use crate::fees::StandardFeePolicy;
    use crate::permissions::PermissionTable;
    use crate::script::OutputScript;
    use crate::transaction::{OutPoint, TxOut};
    use std::sync::Arc;

    fn context() -> EngineContext {
        EngineContext::new(
            &Config::default(),
            Arc::new(PermissionTable::new()),
            Arc::new(AssetRegistry::new()),
            Arc::new(StandardFeePolicy::default()),
            Arc::new(KeyStore::new()),
        )
    }

    fn native_matrix(values: &[i64], depth: i32) -> (Vec<CoinRecord>, CoinMatrix) {
        let coins: Vec<CoinRecord> = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                CoinRecord::new(
                    OutPoint::new([i as u8; 32], 0),
                    TxOut::new(*v, OutputScript::pay_to([1u8; 32])),
                    depth,
                    true,
                )
            })
            .collect();
        let mut matrix = CoinMatrix::new(&coins);
        for (i, v) in values.iter().enumerate() {
            matrix.insert_coin(i, &[(AssetKey::Native, *v)], None, true).unwrap();
        }
        (coins, matrix)
    }

    #[test]
    fn test_exact_match_preferred() {
        let ctx = context();
        let (coins, mut matrix) = native_matrix(&[5_000_000, 3_000_000, 9_000_000], 3);
        select_asset_coins(&mut matrix, &coins, AssetKey::Native, 3_000_000, &ctx).unwrap();
        assert_eq!(matrix.selected_coins(), vec![1]);
    }

    #[test]
    fn test_lowest_larger_when_lower_insufficient() {
        let ctx = context();
        let (coins, mut matrix) = native_matrix(&[100, 200, 50_000_000, 70_000_000], 3);
        select_asset_coins(&mut matrix, &coins, AssetKey::Native, 10_000_000, &ctx).unwrap();
        assert_eq!(matrix.selected_coins(), vec![2]);
    }

    #[test]
    fn test_reuse_of_selected_coins() {
        let ctx = context();
        let (coins, mut matrix) = native_matrix(&[40, 60], 3);
        matrix.select(1).unwrap();
        select_asset_coins(&mut matrix, &coins, AssetKey::Native, 50, &ctx).unwrap();
        assert_eq!(matrix.selected_coins(), vec![1]);
    }

    #[test]
    fn test_insufficient_funds() {
        let ctx = context();
        let (coins, mut matrix) = native_matrix(&[40, 60], 3);
        let err = select_asset_coins(&mut matrix, &coins, AssetKey::Native, 101, &ctx).unwrap_err();
        assert!(matches!(err, SelectionError::InsufficientFunds(_)));
        assert!(!matrix.any_selected());
    }

    #[test]
    fn test_zero_target_selects_one_coin() {
        let ctx = context();
        let (coins, mut matrix) = native_matrix(&[40, 60], 3);
        select_asset_coins(&mut matrix, &coins, AssetKey::Native, 0, &ctx).unwrap();
        assert_eq!(matrix.selected_coins().len(), 1);
    }

    #[test]
    fn test_unconfirmed_foreign_coins_skipped() {
        let ctx = context();
        let (mut coins, mut matrix) = native_matrix(&[40, 60], 0);
        coins[0].from_me = false;
        select_asset_coins(&mut matrix, &coins, AssetKey::Native, 30, &ctx).unwrap();
        assert_eq!(matrix.selected_coins(), vec![1]);
    }

    #[test]
    fn test_asset_row_uses_holding_coins() {
        let ctx = context();
        let gold = AssetKey::Entity([3u8; 32]);
        let (coins, mut matrix) = native_matrix(&[10, 10, 10], 3);
        matrix.insert_coin(2, &[(gold, 7)], None, false).unwrap();
        select_asset_coins(&mut matrix, &coins, gold, 5, &ctx).unwrap();
        assert_eq!(matrix.selected_coins(), vec![2]);
    }

    #[test]
    fn test_subset_is_deterministic() {
        let ctx = context();
        let values = [300_000, 200_000, 400_000, 100_000, 500_000];
        let (coins, mut first) = native_matrix(&values, 3);
        let (_, mut second) = native_matrix(&values, 3);
        select_asset_coins(&mut first, &coins, AssetKey::Native, 700_000, &ctx).unwrap();
        select_asset_coins(&mut second, &coins, AssetKey::Native, 700_000, &ctx).unwrap();

        assert_eq!(first.selected_coins(), second.selected_coins());
        assert!(first.selected_total(&AssetKey::Native) >= 700_000);
    }
}
