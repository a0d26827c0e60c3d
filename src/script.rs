//! Typed output scripts and the parser that turns outputs into asset rows
//! and permission facts

use crate::asset::{AssetCatalog, AssetId, AssetKey, AssetQuantity, EntityKind};
use crate::crypto::Address;
use crate::error::{SelectionError, SelectionResult};
use crate::permissions::{PermissionOracle, PermissionRole, Permissions};
use crate::transaction::TxOut;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptKind {
    PayToKeyHash,
    PayToScriptHash,
    NullData,
    NonStandard,
}

/// One tagged script element holding asset quantities.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetElement {
    pub quantities: Vec<AssetQuantity>,
}

/// New asset issued by this output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuance {
    pub asset: AssetId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub permissions: Permissions,
    /// `None` grants global permissions.
    pub entity: Option<AssetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputScript {
    pub kind: ScriptKind,
    pub destination: Option<Address>,
    pub transfers: Vec<AssetElement>,
    pub issuance: Option<Issuance>,
    pub follow_on: Option<AssetQuantity>,
    pub grant: Option<PermissionGrant>,
    pub create_stream: bool,
    pub publish: Option<AssetId>,
    pub inline_metadata: bool,
    pub offchain_payload: u64,
}

impl OutputScript {
    fn with_kind(kind: ScriptKind, destination: Option<Address>) -> Self {
        Self {
            kind,
            destination,
            transfers: Vec::new(),
            issuance: None,
            follow_on: None,
            grant: None,
            create_stream: false,
            publish: None,
            inline_metadata: false,
            offchain_payload: 0,
        }
    }

    pub fn pay_to(address: Address) -> Self {
        Self::with_kind(ScriptKind::PayToKeyHash, Some(address))
    }

    pub fn pay_to_script(address: Address) -> Self {
        Self::with_kind(ScriptKind::PayToScriptHash, Some(address))
    }

    pub fn null_data() -> Self {
        Self::with_kind(ScriptKind::NullData, None)
    }

    pub fn non_standard() -> Self {
        Self::with_kind(ScriptKind::NonStandard, None)
    }

    /// Adds a transfer to the last element, opening one if needed.
    pub fn with_transfer(mut self, asset: AssetId, quantity: i64) -> Self {
        if self.transfers.is_empty() {
            self.transfers.push(AssetElement::default());
        }
        if let Some(element) = self.transfers.last_mut() {
            element.quantities.push(AssetQuantity::new(asset, quantity));
        }
        self
    }

    pub fn with_element(mut self, quantities: Vec<AssetQuantity>) -> Self {
        self.transfers.push(AssetElement { quantities });
        self
    }

    pub fn with_issuance(mut self, asset: AssetId, quantity: i64) -> Self {
        self.issuance = Some(Issuance { asset, quantity });
        self
    }

    pub fn with_follow_on(mut self, asset: AssetId, quantity: i64) -> Self {
        self.follow_on = Some(AssetQuantity::new(asset, quantity));
        self
    }

    pub fn with_grant(mut self, permissions: Permissions, entity: Option<AssetId>) -> Self {
        self.grant = Some(PermissionGrant {
            permissions,
            entity,
        });
        self
    }

    pub fn with_stream_creation(mut self) -> Self {
        self.create_stream = true;
        self
    }

    pub fn with_publish(mut self, stream: AssetId, payload: u64) -> Self {
        self.publish = Some(stream);
        self.offchain_payload = payload;
        self
    }

    pub fn with_inline_metadata(mut self) -> Self {
        self.inline_metadata = true;
        self
    }

    pub fn transfer_quantities(&self) -> impl Iterator<Item = &AssetQuantity> {
        self.transfers.iter().flat_map(|e| e.quantities.iter())
    }

    pub fn has_transfers(&self) -> bool {
        self.transfer_quantities().next().is_some()
    }

    /// Pay-to-key-hash and pay-to-script-hash outputs with a destination.
    pub fn is_standard(&self) -> bool {
        matches!(
            self.kind,
            ScriptKind::PayToKeyHash | ScriptKind::PayToScriptHash
        ) && self.destination.is_some()
    }

    pub fn is_pay_to_script(&self) -> bool {
        self.kind == ScriptKind::PayToScriptHash
    }

    /// Encoded size, used to order coins and to price dust change.
    pub fn script_size(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |size| size as usize)
    }
}

/// Destination-independent facts about an existing output. These are what
/// the parse cache keeps between builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinFacts {
    pub destination: Option<Address>,
    pub pay_to_script: bool,
    pub amounts: Vec<(AssetKey, i64)>,
    pub required: Permissions,
    pub inline_metadata: bool,
    pub script_size: usize,
}

impl CoinFacts {
    /// No value and no assets.
    pub fn is_empty(&self) -> bool {
        self.amounts.iter().all(|(_, quantity)| *quantity == 0)
    }
}

/// Asset rows and permission facts of one output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedOutput {
    pub destination: Option<Address>,
    pub amounts: Vec<(AssetKey, i64)>,
    pub required: Permissions,
    pub allowed: Permissions,
    pub inline_metadata: bool,
    pub offchain_payload: u64,
    /// Entity each special role is scoped to, when the output names one.
    pub role_entities: BTreeMap<PermissionRole, AssetId>,
}

impl ParsedOutput {
    pub fn quantity(&self, key: &AssetKey) -> i64 {
        self.amounts
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, q)| *q)
            .sum()
    }

    pub fn real_assets(&self) -> Vec<AssetKey> {
        self.amounts
            .iter()
            .filter(|(k, _)| k.is_real())
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn is_pure_native(&self) -> bool {
        !self.amounts.iter().any(|(k, _)| k.is_real())
    }
}

fn add_amount(amounts: &mut Vec<(AssetKey, i64)>, key: AssetKey, quantity: i64) {
    match amounts.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => *existing += quantity,
        None => amounts.push((key, quantity)),
    }
}

/// Turns outputs into asset rows and permission facts.
pub trait ScriptParser: Send + Sync {
    /// Parses an output the caller wants to create.
    fn parse_request(&self, output: &TxOut) -> SelectionResult<ParsedOutput>;

    /// Facts about an existing coin that do not depend on current permissions.
    fn coin_facts(&self, output: &TxOut) -> CoinFacts;

    /// Applies the destination's current permissions to cached facts. Roles in
    /// `expected` the destination holds become quantity-1 rows.
    fn resolve_coin(
        &self,
        facts: &CoinFacts,
        expected: Permissions,
        role_entities: &BTreeMap<PermissionRole, AssetId>,
    ) -> ParsedOutput;

    fn parse_coin(
        &self,
        output: &TxOut,
        expected: Permissions,
        role_entities: &BTreeMap<PermissionRole, AssetId>,
    ) -> ParsedOutput {
        self.resolve_coin(&self.coin_facts(output), expected, role_entities)
    }
}

/// Parser for the standard script forms.
pub struct StandardScriptParser {
    oracle: Arc<dyn PermissionOracle>,
    catalog: Arc<dyn AssetCatalog>,
    anyone_can_receive_empty: bool,
    per_asset_permissions: bool,
}

impl StandardScriptParser {
    pub fn new(
        oracle: Arc<dyn PermissionOracle>,
        catalog: Arc<dyn AssetCatalog>,
        anyone_can_receive_empty: bool,
        per_asset_permissions: bool,
    ) -> Self {
        Self {
            oracle,
            catalog,
            anyone_can_receive_empty,
            per_asset_permissions,
        }
    }

    fn asset_rights_ok(&self, address: &Address, amounts: &[(AssetKey, i64)]) -> bool {
        if !self.per_asset_permissions {
            return true;
        }
        amounts.iter().all(|(key, _)| match key {
            AssetKey::Entity(id) => {
                let restrictions = self.catalog.restrictions(id);
                (!restrictions.contains(Permissions::SEND) || self.oracle.can_send_asset(address, id))
                    && (!restrictions.contains(Permissions::RECEIVE)
                        || self.oracle.can_receive_asset(address, id))
            }
            _ => true,
        })
    }
}

impl ScriptParser for StandardScriptParser {
    fn parse_request(&self, output: &TxOut) -> SelectionResult<ParsedOutput> {
        let script = &output.script;
        if output.value < 0 {
            return Err(SelectionError::InvalidParameter(
                "Output value must be non-negative".to_string(),
            ));
        }

        let mut parsed = ParsedOutput {
            destination: script.destination,
            required: Permissions::SEND,
            inline_metadata: script.inline_metadata,
            offchain_payload: script.offchain_payload,
            ..ParsedOutput::default()
        };
        add_amount(&mut parsed.amounts, AssetKey::Native, output.value);

        for transfer in script.transfer_quantities() {
            if transfer.quantity < 0 {
                return Err(SelectionError::InvalidParameter(
                    "Asset quantity must be non-negative".to_string(),
                ));
            }
            add_amount(&mut parsed.amounts, AssetKey::Entity(transfer.asset), transfer.quantity);
        }

        if let Some(issuance) = script.issuance {
            add_amount(&mut parsed.amounts, AssetKey::Genesis(issuance.asset), issuance.quantity);
            parsed.required |= Permissions::ISSUE;
        }

        if let Some(follow_on) = script.follow_on {
            parsed.required |= Permissions::ISSUE;
            parsed
                .role_entities
                .insert(PermissionRole::Issue, follow_on.asset);
        }

        if let Some(grant) = script.grant {
            let role = if grant.permissions.activate_is_enough() {
                PermissionRole::Activate
            } else {
                PermissionRole::Admin
            };
            parsed.required |= role.bit();
            if let Some(entity) = grant.entity {
                parsed.role_entities.insert(role, entity);
            }
        }

        if script.create_stream {
            parsed.required |= Permissions::CREATE;
        }

        if let Some(stream) = script.publish {
            let open = matches!(
                self.catalog.entity(&stream).map(|e| e.kind),
                Some(EntityKind::Stream { open: true })
            );
            if !open {
                parsed.required |= Permissions::WRITE;
                parsed.role_entities.insert(PermissionRole::Write, stream);
            }
        }

        Ok(parsed)
    }

    fn coin_facts(&self, output: &TxOut) -> CoinFacts {
        let script = &output.script;
        let mut amounts = Vec::new();
        let mut required = Permissions::SEND;

        add_amount(&mut amounts, AssetKey::Native, output.value);
        for transfer in script.transfer_quantities() {
            add_amount(&mut amounts, AssetKey::Entity(transfer.asset), transfer.quantity);
        }
        if let Some(issuance) = script.issuance {
            if self.catalog.is_confirmed(&issuance.asset) {
                add_amount(&mut amounts, AssetKey::Entity(issuance.asset), issuance.quantity);
            } else {
                add_amount(&mut amounts, AssetKey::Genesis(issuance.asset), issuance.quantity);
                required |= Permissions::ISSUE;
            }
        }
        if let Some(follow_on) = script.follow_on {
            add_amount(&mut amounts, AssetKey::Entity(follow_on.asset), follow_on.quantity);
        }

        CoinFacts {
            destination: script.destination,
            pay_to_script: script.is_pay_to_script(),
            amounts,
            required,
            inline_metadata: script.inline_metadata,
            script_size: script.script_size(),
        }
    }

    fn resolve_coin(
        &self,
        facts: &CoinFacts,
        expected: Permissions,
        role_entities: &BTreeMap<PermissionRole, AssetId>,
    ) -> ParsedOutput {
        let mut parsed = ParsedOutput {
            destination: facts.destination,
            amounts: facts.amounts.clone(),
            required: facts.required,
            inline_metadata: facts.inline_metadata,
            ..ParsedOutput::default()
        };

        let Some(address) = facts.destination else {
            return parsed;
        };

        if expected.contains(Permissions::SEND) && self.oracle.can_send(&address) {
            let receivable = self.oracle.can_receive(&address)
                || (self.anyone_can_receive_empty && facts.is_empty());
            if receivable && self.asset_rights_ok(&address, &facts.amounts) {
                parsed.allowed |= Permissions::SEND;
            }
        }

        for role in expected.roles().filter(|r| r.is_special()) {
            let entity = role_entities.get(&role);
            if self.oracle.can_perform(&address, role, entity) {
                parsed.allowed |= role.bit();
                add_amount(&mut parsed.amounts, AssetKey::Role(role), 1);
            }
        }

        parsed
    }
}
