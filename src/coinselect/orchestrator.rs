//! Top-level transaction build

use super::builder::{build_asset_transaction, BuildOutcome, TransactionDraft};
use super::change::{calculate_change, find_change_address, ChangeAmounts};
use super::combine::{select_coins_to_combine, CombineLimits};
use super::group_tree::AssetGroupTree;
use super::matrix::{scan_coins, CoinMatrix, CoinScan};
use super::selector::select_asset_coins;
use super::{sort_coins, CoinRecord, EngineContext};
use crate::asset::{AssetId, AssetKey};
use crate::cache::CoinSelectionCache;
use crate::crypto::Address;
use crate::error::{SelectionError, SelectionResult, NO_SEND_COINS_REASON};
use crate::permissions::{PermissionRole, Permissions};
use crate::transaction::{check_output_permissions, OutPoint, Transaction, TxOut};
use crate::wallet::store::{CoinFilter, WalletStore};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// What the caller wants built. An empty `outputs` list asks for a
/// consolidation of the source coins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub outputs: Vec<TxOut>,
    /// Spend only coins of these addresses.
    pub source_addresses: Option<BTreeSet<Address>>,
    pub min_conf: i32,
    pub min_inputs: usize,
    pub max_inputs: usize,
    /// Coins that must be among the inputs.
    pub must_use: Vec<OutPoint>,
    pub change_destination: Option<Address>,
    pub sign: bool,
}

impl BuildRequest {
    pub fn send(outputs: Vec<TxOut>) -> Self {
        Self {
            outputs,
            source_addresses: None,
            min_conf: 1,
            min_inputs: 0,
            max_inputs: usize::MAX,
            must_use: Vec::new(),
            change_destination: None,
            sign: true,
        }
    }

    pub fn combine(address: Address, min_conf: i32, min_inputs: usize, max_inputs: usize) -> Self {
        Self {
            outputs: Vec::new(),
            source_addresses: Some([address].into_iter().collect()),
            min_conf,
            min_inputs,
            max_inputs,
            must_use: Vec::new(),
            change_destination: None,
            sign: true,
        }
    }

    pub fn from_addresses(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.source_addresses = Some(addresses.into_iter().collect());
        self
    }

    pub fn with_must_use(mut self, outpoints: Vec<OutPoint>) -> Self {
        self.must_use = outpoints;
        self
    }

    pub fn with_change_to(mut self, address: Address) -> Self {
        self.change_destination = Some(address);
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.sign = false;
        self
    }

    pub fn is_combine(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTransaction {
    pub transaction: Transaction,
    /// Native input less native output.
    pub fee: i64,
    pub inputs: Vec<OutPoint>,
    pub change_address: Option<Address>,
}

/// Requested totals and the permissions the outputs demand.
struct Requirements {
    out_amounts: BTreeMap<AssetKey, i64>,
    required: Permissions,
    role_entities: BTreeMap<PermissionRole, AssetId>,
}

/// Builds a complete transaction for `request` or fails without side
/// effects on the wallet. Only the group tree learns new assets.
pub fn build_transaction(
    ctx: &EngineContext,
    store: &dyn WalletStore,
    tree: &mut AssetGroupTree,
    cache: Option<&CoinSelectionCache>,
    request: &BuildRequest,
) -> SelectionResult<BuiltTransaction> {
    let combine = request.is_combine();
    check_output_permissions(
        &request.outputs,
        ctx.oracle.as_ref(),
        ctx.catalog.as_ref(),
        ctx.params.anyone_can_receive_empty,
        ctx.params.per_asset_permissions,
    )?;

    let mut needs = collect_requirements(ctx, request)?;
    check_single_source(ctx, request, &mut needs)?;
    for role in needs.required.roles().filter(|r| r.is_special()) {
        needs.out_amounts.insert(AssetKey::Role(role), 1);
    }

    let mut coins = store.available_coins(&CoinFilter {
        addresses: request.source_addresses.clone(),
        ..CoinFilter::default()
    });
    sort_coins(&mut coins);

    let scan = scan_coins(&coins, needs.required, &needs.role_entities, ctx, tree, cache)?;
    let mut matrix = CoinMatrix::new(&coins);

    if combine {
        let limits = CombineLimits {
            min_conf: request.min_conf,
            min_inputs: request.min_inputs,
            max_inputs: request.max_inputs,
        };
        select_coins_to_combine(&mut matrix, &scan, &coins, limits, ctx, tree)?;
    } else {
        scan.populate(&mut matrix, Some(&needs.out_amounts))?;
        for outpoint in &request.must_use {
            let coin = matrix
                .coin_for(outpoint)
                .filter(|c| matrix.is_parsed(*c))
                .ok_or(SelectionError::PreselectedCoinNotFound(*outpoint))?;
            matrix.select(coin)?;
        }
        select_requested(&mut matrix, &coins, &scan, &needs.out_amounts, ctx)?;
    }

    let mut change = calculate_change(&matrix, &scan, &needs.out_amounts, tree, ctx.catalog.as_ref())?;
    let change_address = find_change_address(
        request.change_destination,
        &change.used_addresses,
        &store.own_addresses(),
        needs.required,
        &needs.role_entities,
        ctx.oracle.as_ref(),
    );

    matrix.save_selection();
    let mut native_target = needs.out_amounts.get(&AssetKey::Native).copied().unwrap_or(0);
    let mut fee = 0i64;

    loop {
        let draft = TransactionDraft {
            ctx,
            coins: &coins,
            matrix: &matrix,
            outputs: &request.outputs,
            change: &change,
            change_address,
            sign: request.sign,
        };
        match build_asset_transaction(&draft, &mut fee)? {
            BuildOutcome::Complete { tx, .. } => {
                return Ok(finish(tx, &matrix, &coins, change_address, &change));
            }
            BuildOutcome::NeedNative(missing) => {
                if combine {
                    return Err(SelectionError::InsufficientFunds(
                        "Combine transaction requires extra native currency amount".to_string(),
                    ));
                }
                debug!(missing, native_target, "selecting more native currency");
                matrix.restore_selection();
                native_target += missing;
                select_asset_coins(&mut matrix, &coins, AssetKey::Native, native_target, ctx)
                    .map_err(|e| explain(e, &AssetKey::Native, native_target, &scan))?;
                change = calculate_change(&matrix, &scan, &needs.out_amounts, tree, ctx.catalog.as_ref())?;
            }
        }
    }
}

fn collect_requirements(ctx: &EngineContext, request: &BuildRequest) -> SelectionResult<Requirements> {
    let mut needs = Requirements {
        out_amounts: BTreeMap::new(),
        required: Permissions::SEND,
        role_entities: BTreeMap::new(),
    };
    needs.out_amounts.insert(AssetKey::Native, 0);

    for output in &request.outputs {
        let parsed = ctx.parser.parse_request(output)?;
        for (key, quantity) in parsed.amounts {
            *needs.out_amounts.entry(key).or_insert(0) += quantity;
        }
        needs.required |= parsed.required;
        for (role, entity) in parsed.role_entities {
            needs.role_entities.entry(role).or_insert(entity);
        }
    }
    Ok(needs)
}

/// With a single source address every coin comes from it, so the special
/// roles can be checked up front instead of carried as selection rows.
fn check_single_source(
    ctx: &EngineContext,
    request: &BuildRequest,
    needs: &mut Requirements,
) -> SelectionResult<()> {
    let Some(sources) = request.source_addresses.as_ref().filter(|s| s.len() == 1) else {
        return Ok(());
    };
    let Some(address) = sources.iter().next() else {
        return Ok(());
    };

    for role in needs.required.roles().filter(|r| r.is_special()) {
        if !ctx
            .oracle
            .can_perform(address, role, needs.role_entities.get(&role))
        {
            return Err(SelectionError::InsufficientPermissions {
                role,
                reason: format!("Source address doesn't have {} permission", role),
            });
        }
        needs.required.remove(role.bit());
    }
    Ok(())
}

/// One selector pass per requested row: real assets first, then roles,
/// native currency last so it can reuse coins picked for assets.
fn select_requested(
    matrix: &mut CoinMatrix,
    coins: &[CoinRecord],
    scan: &CoinScan,
    out_amounts: &BTreeMap<AssetKey, i64>,
    ctx: &EngineContext,
) -> SelectionResult<()> {
    let rank = |key: &AssetKey| match key {
        AssetKey::Entity(_) => 0,
        AssetKey::Role(_) => 1,
        AssetKey::Native => 2,
        AssetKey::Genesis(_) => 3,
    };
    let mut rows: Vec<(&AssetKey, &i64)> = out_amounts
        .iter()
        .filter(|(key, quantity)| !key.is_genesis() && (**quantity > 0 || **key == AssetKey::Native))
        .collect();
    rows.sort_by_key(|(key, _)| rank(*key));

    for (key, quantity) in rows {
        select_asset_coins(matrix, coins, *key, *quantity, ctx)
            .map_err(|e| explain(e, key, *quantity, scan))?;
    }
    Ok(())
}

/// Turns a selector shortfall into the error the caller should see.
fn explain(err: SelectionError, key: &AssetKey, quantity: i64, scan: &CoinScan) -> SelectionError {
    let err = match err {
        SelectionError::InsufficientFunds(reason) => match key {
            AssetKey::Role(role) => SelectionError::InsufficientPermissions {
                role: *role,
                reason: format!("No unspent output with {} permission", role),
            },
            _ if scan.no_send_coins => SelectionError::InsufficientPermissions {
                role: PermissionRole::Send,
                reason: NO_SEND_COINS_REASON.to_string(),
            },
            AssetKey::Native if quantity == 0 => {
                SelectionError::NoUnspentOutputs("No unspent output with enough confirmations".to_string())
            }
            _ => SelectionError::InsufficientFunds(reason),
        },
        other => other,
    };
    err.with_inline_note(scan.inline_coins)
}

fn finish(
    tx: Transaction,
    matrix: &CoinMatrix,
    coins: &[CoinRecord],
    change_address: Option<Address>,
    change: &ChangeAmounts,
) -> BuiltTransaction {
    let native_in: i64 = matrix.selected_coins().iter().map(|c| coins[*c].value()).sum();
    let fee = native_in - tx.total_output_value();
    let inputs: Vec<OutPoint> = tx.inputs.iter().map(|i| i.previous_output).collect();
    info!(
        txid = %tx.txid_str(),
        inputs = inputs.len(),
        outputs = tx.outputs.len(),
        fee,
        groups = change.active_groups().len(),
        "transaction built"
    );
    BuiltTransaction {
        transaction: tx,
        fee,
        inputs,
        change_address,
    }
}
