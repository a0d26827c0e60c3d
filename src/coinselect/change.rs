//! Change amounts per asset and the choice of change destination

use super::group_tree::{AssetGroupTree, GroupId, GroupResult};
use super::matrix::{CoinMatrix, CoinScan};
use crate::asset::{AssetCatalog, AssetId, AssetKey, AssetQuantity};
use crate::crypto::Address;
use crate::error::{SelectionError, SelectionResult};
use crate::permissions::{PermissionOracle, PermissionRole, Permissions};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeEntry {
    pub quantity: i64,
    /// Group of a real asset; `None` for native currency and roles.
    pub group: Option<GroupId>,
}

/// Surplus of the selected inputs over the requested outputs.
#[derive(Debug, Clone, Default)]
pub struct ChangeAmounts {
    pub amounts: BTreeMap<AssetKey, ChangeEntry>,
    /// Destinations of the selected coins.
    pub used_addresses: BTreeSet<Address>,
}

impl ChangeAmounts {
    /// Native currency left after the requested outputs, before the fee.
    pub fn native(&self) -> i64 {
        self.quantity(&AssetKey::Native)
    }

    pub fn quantity(&self, key: &AssetKey) -> i64 {
        self.amounts.get(key).map_or(0, |e| e.quantity)
    }

    /// Groups holding positive change, ascending.
    pub fn active_groups(&self) -> Vec<GroupId> {
        let groups: BTreeSet<GroupId> = self
            .amounts
            .values()
            .filter(|e| e.quantity > 0)
            .filter_map(|e| e.group)
            .collect();
        groups.into_iter().collect()
    }

    /// Positive change of the real assets in `group`.
    pub fn group_assets(&self, group: GroupId) -> Vec<AssetQuantity> {
        self.amounts
            .iter()
            .filter(|(_, e)| e.group == Some(group) && e.quantity > 0)
            .filter_map(|(key, e)| key.entity().map(|id| AssetQuantity::new(*id, e.quantity)))
            .collect()
    }
}

/// Sums every selected coin and subtracts the requested amounts. Genesis
/// rows take no part; a negative result means the selection was wrong.
pub fn calculate_change(
    matrix: &CoinMatrix,
    scan: &CoinScan,
    out_amounts: &BTreeMap<AssetKey, i64>,
    tree: &mut AssetGroupTree,
    catalog: &dyn AssetCatalog,
) -> SelectionResult<ChangeAmounts> {
    let mut change = ChangeAmounts::default();

    for coin in matrix.selected_coins() {
        let parsed = scan
            .parsed
            .get(coin)
            .and_then(Option::as_ref)
            .ok_or_else(|| SelectionError::internal(format!("selected coin {} was not parsed", coin)))?;
        if let Some(destination) = parsed.destination {
            change.used_addresses.insert(destination);
        }
        for (key, quantity) in &parsed.amounts {
            if key.is_genesis() {
                continue;
            }
            change.amounts.entry(*key).or_default().quantity += quantity;
        }
    }

    for (key, quantity) in out_amounts {
        if key.is_genesis() {
            continue;
        }
        change.amounts.entry(*key).or_default().quantity -= quantity;
    }

    for (key, entry) in change.amounts.iter_mut() {
        if entry.quantity < 0 {
            return Err(SelectionError::internal(format!(
                "negative change {} for {}",
                entry.quantity, key
            )));
        }
        if let AssetKey::Entity(id) = key {
            if entry.quantity > 0 {
                entry.group = match tree.classify_one(id, true, catalog)? {
                    GroupResult::Group(group) => Some(group),
                    other => {
                        return Err(SelectionError::internal(format!(
                            "asset {} has no group after classification: {:?}",
                            key, other
                        )))
                    }
                };
            }
        }
    }

    Ok(change)
}

/// Picks where change goes: the explicit destination, else the single
/// source address when it may receive, else one of the wallet's own
/// addresses among the sources holding the most suitable permissions.
pub fn find_change_address(
    explicit: Option<Address>,
    used_addresses: &BTreeSet<Address>,
    own_addresses: &[Address],
    expected: Permissions,
    role_entities: &BTreeMap<PermissionRole, AssetId>,
    oracle: &dyn PermissionOracle,
) -> Option<Address> {
    if explicit.is_some() {
        return explicit;
    }

    let required = (expected - Permissions::SEND) | Permissions::RECEIVE;

    if used_addresses.len() == 1 {
        return used_addresses
            .iter()
            .next()
            .copied()
            .filter(|address| oracle.can_receive(address));
    }

    let candidates: Vec<&Address> = own_addresses
        .iter()
        .filter(|a| used_addresses.is_empty() || used_addresses.contains(*a))
        .collect();

    let no_entities = BTreeMap::new();
    let attempts = [
        (Permissions::SEND | required, role_entities),
        (Permissions::SEND | Permissions::RECEIVE, &no_entities),
        (required, &no_entities),
        (Permissions::RECEIVE, &no_entities),
    ];
    for (permissions, entities) in attempts {
        if let Some(address) = candidates
            .iter()
            .find(|a| holds(oracle, a, permissions, entities))
        {
            return Some(**address);
        }
    }
    None
}

fn holds(
    oracle: &dyn PermissionOracle,
    address: &Address,
    permissions: Permissions,
    entities: &BTreeMap<PermissionRole, AssetId>,
) -> bool {
    permissions.roles().all(|role| match role {
        PermissionRole::Send => oracle.can_send(address),
        PermissionRole::Receive => oracle.can_receive(address),
        role => oracle.can_perform(address, role, entities.get(&role)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetRegistry;
    use crate::coinselect::CoinRecord;
    use crate::permissions::PermissionTable;
    use crate::script::{OutputScript, ParsedOutput};
    use crate::transaction::{OutPoint, TxOut};

    fn create_test_address(s: &str) -> Address {
        let mut address = [0u8; 32];
        let bytes = s.as_bytes();
        address[..bytes.len()].copy_from_slice(bytes);
        address
    }

    fn selected_scan(parsed: Vec<ParsedOutput>) -> (CoinMatrix, CoinScan) {
        let coins: Vec<CoinRecord> = (0..parsed.len())
            .map(|i| {
                CoinRecord::new(
                    OutPoint::new([i as u8; 32], 0),
                    TxOut::new(0, OutputScript::null_data()),
                    1,
                    true,
                )
            })
            .collect();
        let mut matrix = CoinMatrix::new(&coins);
        let scan = CoinScan {
            pure_native: vec![false; parsed.len()],
            parsed: parsed.into_iter().map(Some).collect(),
            ..CoinScan::default()
        };
        scan.populate(&mut matrix, None).unwrap();
        for coin in 0..coins.len() {
            matrix.select(coin).unwrap();
        }
        (matrix, scan)
    }

    #[test]
    fn test_change_per_group() {
        let registry = AssetRegistry::new();
        let mut tree = AssetGroupTree::new(4, 16, 2).unwrap();
        let gold = [1u8; 32];
        let alice = create_test_address("alice");
        let (matrix, scan) = selected_scan(vec![ParsedOutput {
            destination: Some(alice),
            amounts: vec![(AssetKey::Native, 100), (AssetKey::Entity(gold), 50)],
            ..ParsedOutput::default()
        }]);

        let mut out = BTreeMap::new();
        out.insert(AssetKey::Native, 0);
        out.insert(AssetKey::Entity(gold), 30);

        let change = calculate_change(&matrix, &scan, &out, &mut tree, &registry).unwrap();
        assert_eq!(change.native(), 100);
        assert_eq!(change.quantity(&AssetKey::Entity(gold)), 20);
        assert_eq!(change.active_groups().len(), 1);
        let group = change.active_groups()[0];
        assert_eq!(change.group_assets(group), vec![AssetQuantity::new(gold, 20)]);
        assert!(change.used_addresses.contains(&alice));
    }

    #[test]
    fn test_negative_change_is_internal() {
        let registry = AssetRegistry::new();
        let mut tree = AssetGroupTree::new(4, 16, 2).unwrap();
        let (matrix, scan) = selected_scan(vec![ParsedOutput {
            amounts: vec![(AssetKey::Native, 10)],
            ..ParsedOutput::default()
        }]);
        let mut out = BTreeMap::new();
        out.insert(AssetKey::Native, 11);

        let err = calculate_change(&matrix, &scan, &out, &mut tree, &registry).unwrap_err();
        assert!(matches!(err, SelectionError::InternalInvariantViolation(_)));
    }

    #[test]
    fn test_single_source_change_address() {
        let table = PermissionTable::new();
        let alice = create_test_address("alice");
        let used: BTreeSet<Address> = [alice].into_iter().collect();

        assert_eq!(
            find_change_address(None, &used, &[alice], Permissions::SEND, &BTreeMap::new(), &table),
            None
        );
        table.grant(alice, Permissions::RECEIVE);
        assert_eq!(
            find_change_address(None, &used, &[alice], Permissions::SEND, &BTreeMap::new(), &table),
            Some(alice)
        );

        let explicit = create_test_address("vault");
        assert_eq!(
            find_change_address(Some(explicit), &used, &[alice], Permissions::SEND, &BTreeMap::new(), &table),
            Some(explicit)
        );
    }

    #[test]
    fn test_change_address_prefers_sender() {
        let table = PermissionTable::new();
        let alice = create_test_address("alice");
        let bob = create_test_address("bob");
        table.grant(alice, Permissions::RECEIVE);
        table.grant(bob, Permissions::SEND | Permissions::RECEIVE);
        let used: BTreeSet<Address> = [alice, bob].into_iter().collect();

        let found = find_change_address(None, &used, &[alice, bob], Permissions::SEND, &BTreeMap::new(), &table);
        assert_eq!(found, Some(bob));

        table.revoke(&bob, Permissions::RECEIVE);
        let found = find_change_address(None, &used, &[alice, bob], Permissions::SEND, &BTreeMap::new(), &table);
        assert_eq!(found, Some(alice));
    }
}
