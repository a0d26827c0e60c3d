//! Asset identifiers, matrix row keys and the catalog of known entities

use crate::permissions::{PermissionRole, Permissions};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Identifier of an asset or stream entity.
pub type AssetId = [u8; 32];

/// Derives an entity id from its name. Handy for tests and tooling.
pub fn asset_id_from_name(name: &str) -> AssetId {
    let mut hasher = Sha256::new();
    hasher.update(b"entity:");
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

/// Key of one row in the selection and change tables.
///
/// `Native` and `Role` are pseudo-assets: the native currency and the
/// permission roles a transaction needs an input for. `Genesis` marks an
/// in-flight issuance and never takes part in spend accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetKey {
    Native,
    Role(PermissionRole),
    Entity(AssetId),
    Genesis(AssetId),
}

impl AssetKey {
    pub fn is_real(&self) -> bool {
        matches!(self, AssetKey::Entity(_))
    }

    pub fn is_special(&self) -> bool {
        matches!(self, AssetKey::Native | AssetKey::Role(_))
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, AssetKey::Genesis(_))
    }

    pub fn entity(&self) -> Option<&AssetId> {
        match self {
            AssetKey::Entity(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssetKey::Native => write!(f, "native"),
            AssetKey::Role(role) => write!(f, "role:{}", role),
            AssetKey::Entity(id) => write!(f, "asset:{}", hex::encode(&id[..8])),
            AssetKey::Genesis(id) => write!(f, "genesis:{}", hex::encode(&id[..8])),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetQuantity {
    pub asset: AssetId,
    pub quantity: i64,
}

impl AssetQuantity {
    pub fn new(asset: AssetId, quantity: i64) -> Self {
        Self { asset, quantity }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Asset,
    Stream { open: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntity {
    pub id: AssetId,
    pub name: String,
    pub kind: EntityKind,
    /// False while the issuing transaction is still unconfirmed.
    pub confirmed: bool,
    /// Operations on this entity that need a per-entity grant.
    pub restrictions: Permissions,
}

impl AssetEntity {
    pub fn asset(name: &str) -> Self {
        Self {
            id: asset_id_from_name(name),
            name: name.to_string(),
            kind: EntityKind::Asset,
            confirmed: true,
            restrictions: Permissions::NONE,
        }
    }

    pub fn stream(name: &str, open: bool) -> Self {
        Self {
            kind: EntityKind::Stream { open },
            ..Self::asset(name)
        }
    }

    pub fn with_restrictions(mut self, restrictions: Permissions) -> Self {
        self.restrictions = restrictions;
        self
    }

    pub fn unconfirmed(mut self) -> Self {
        self.confirmed = false;
        self
    }
}

/// Lookup of asset and stream entities known to the chain.
pub trait AssetCatalog: Send + Sync {
    fn entity(&self, id: &AssetId) -> Option<AssetEntity>;

    fn is_confirmed(&self, id: &AssetId) -> bool {
        self.entity(id).map_or(false, |e| e.confirmed)
    }

    fn restrictions(&self, id: &AssetId) -> Permissions {
        self.entity(id).map(|e| e.restrictions).unwrap_or_default()
    }

    /// Send- or receive-restricted assets never share a change output.
    fn requires_dedicated_group(&self, id: &AssetId) -> bool {
        self.restrictions(id)
            .intersects(Permissions::SEND | Permissions::RECEIVE)
    }
}

/// In-memory entity registry.
#[derive(Debug, Default)]
pub struct AssetRegistry {
    entities: RwLock<HashMap<AssetId, AssetEntity>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: AssetEntity) -> AssetId {
        let id = entity.id;
        self.entities.write().insert(id, entity);
        id
    }

    pub fn confirm(&self, id: &AssetId) {
        if let Some(entity) = self.entities.write().get_mut(id) {
            entity.confirmed = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AssetCatalog for AssetRegistry {
    fn entity(&self, id: &AssetId) -> Option<AssetEntity> {
        self.entities.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_key_classes() {
        let id = asset_id_from_name("gold");
        assert!(AssetKey::Entity(id).is_real());
        assert!(AssetKey::Native.is_special());
        assert!(AssetKey::Role(PermissionRole::Admin).is_special());
        assert!(AssetKey::Genesis(id).is_genesis());
        assert!(!AssetKey::Genesis(id).is_real());
    }

    #[test]
    fn test_asset_key_ordering_is_stable() {
        let mut keys = vec![
            AssetKey::Entity([2u8; 32]),
            AssetKey::Native,
            AssetKey::Role(PermissionRole::Issue),
            AssetKey::Entity([1u8; 32]),
        ];
        keys.sort();
        assert_eq!(keys[0], AssetKey::Native);
        assert_eq!(keys[2], AssetKey::Entity([1u8; 32]));
    }

    #[test]
    fn test_registry_pinning_predicate() {
        let registry = AssetRegistry::new();
        let open = registry.register(AssetEntity::asset("open"));
        let gated = registry.register(
            AssetEntity::asset("gated").with_restrictions(Permissions::SEND | Permissions::RECEIVE),
        );
        let receive_only = registry.register(
            AssetEntity::asset("receive-only").with_restrictions(Permissions::RECEIVE),
        );

        assert!(!registry.requires_dedicated_group(&open));
        assert!(registry.requires_dedicated_group(&gated));
        assert!(registry.requires_dedicated_group(&receive_only));
        assert!(!registry.requires_dedicated_group(&[9u8; 32]));
    }

    #[test]
    fn test_confirm_entity() {
        let registry = AssetRegistry::new();
        let id = registry.register(AssetEntity::asset("pending").unconfirmed());
        assert!(!registry.is_confirmed(&id));
        registry.confirm(&id);
        assert!(registry.is_confirmed(&id));
    }
}
