//! Permission bits, roles and the oracle that answers per-address permission queries

use crate::asset::AssetId;
use crate::crypto::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// A set of permission bits held by an address or demanded by an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const CONNECT: Permissions = Permissions(0x0001);
    pub const SEND: Permissions = Permissions(0x0002);
    pub const RECEIVE: Permissions = Permissions(0x0004);
    pub const WRITE: Permissions = Permissions(0x0008);
    pub const ISSUE: Permissions = Permissions(0x0010);
    pub const CREATE: Permissions = Permissions(0x0020);
    pub const MINE: Permissions = Permissions(0x0100);
    pub const ADMIN: Permissions = Permissions(0x1000);
    pub const ACTIVATE: Permissions = Permissions(0x2000);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Permissions(bits)
    }

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Permissions) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Permissions) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Permissions) {
        self.0 &= !other.0;
    }

    /// Roles whose bits are present in this set, in role order.
    pub fn roles(self) -> impl Iterator<Item = PermissionRole> {
        PermissionRole::ALL
            .into_iter()
            .filter(move |role| self.contains(role.bit()))
    }

    /// Granting only these bits can be done by an address holding `activate`.
    pub fn activate_is_enough(self) -> bool {
        (self - (Permissions::CONNECT | Permissions::SEND | Permissions::RECEIVE)).is_empty()
    }
}

impl BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Permissions) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;
    fn bitand(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 & rhs.0)
    }
}

impl Sub for Permissions {
    type Output = Permissions;
    fn sub(self, rhs: Permissions) -> Permissions {
        Permissions(self.0 & !rhs.0)
    }
}

/// A permission an address may hold. `Send` and `Receive` gate value flow;
/// the rest are the special roles that get their own matrix rows when a
/// transaction requires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionRole {
    Send,
    Receive,
    Issue,
    Admin,
    Activate,
    Write,
    Create,
}

impl PermissionRole {
    pub const ALL: [PermissionRole; 7] = [
        PermissionRole::Send,
        PermissionRole::Receive,
        PermissionRole::Issue,
        PermissionRole::Admin,
        PermissionRole::Activate,
        PermissionRole::Write,
        PermissionRole::Create,
    ];

    /// Roles that are tracked as pseudo-asset rows during selection.
    pub const SPECIAL: [PermissionRole; 5] = [
        PermissionRole::Issue,
        PermissionRole::Admin,
        PermissionRole::Activate,
        PermissionRole::Write,
        PermissionRole::Create,
    ];

    pub fn bit(self) -> Permissions {
        match self {
            PermissionRole::Send => Permissions::SEND,
            PermissionRole::Receive => Permissions::RECEIVE,
            PermissionRole::Issue => Permissions::ISSUE,
            PermissionRole::Admin => Permissions::ADMIN,
            PermissionRole::Activate => Permissions::ACTIVATE,
            PermissionRole::Write => Permissions::WRITE,
            PermissionRole::Create => Permissions::CREATE,
        }
    }

    pub fn is_special(self) -> bool {
        !matches!(self, PermissionRole::Send | PermissionRole::Receive)
    }
}

impl fmt::Display for PermissionRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PermissionRole::Send => "send",
            PermissionRole::Receive => "receive",
            PermissionRole::Issue => "issue",
            PermissionRole::Admin => "admin",
            PermissionRole::Activate => "activate",
            PermissionRole::Write => "write",
            PermissionRole::Create => "create",
        };
        write!(f, "{}", name)
    }
}

/// Read-only view of the permission database.
pub trait PermissionOracle: Send + Sync {
    fn can_send(&self, address: &Address) -> bool;

    fn can_receive(&self, address: &Address) -> bool;

    /// Whether `address` holds `role`, globally or (with `entity`) on one asset or stream.
    fn can_perform(&self, address: &Address, role: PermissionRole, entity: Option<&AssetId>) -> bool;

    /// Per-asset send right, consulted only for assets with restricted sends.
    fn can_send_asset(&self, _address: &Address, _asset: &AssetId) -> bool {
        true
    }

    /// Per-asset receive right, consulted only for assets with restricted receives.
    fn can_receive_asset(&self, _address: &Address, _asset: &AssetId) -> bool {
        true
    }

    fn holds_all(&self, address: &Address, permissions: Permissions) -> bool {
        permissions.roles().all(|role| match role {
            PermissionRole::Send => self.can_send(address),
            PermissionRole::Receive => self.can_receive(address),
            other => self.can_perform(address, other, None),
        })
    }
}

/// In-memory permission table.
#[derive(Debug, Default)]
pub struct PermissionTable {
    global: RwLock<HashMap<Address, Permissions>>,
    scoped: RwLock<HashMap<(Address, AssetId), Permissions>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, address: Address, permissions: Permissions) {
        self.global
            .write()
            .entry(address)
            .or_default()
            .insert(permissions);
    }

    pub fn revoke(&self, address: &Address, permissions: Permissions) {
        if let Some(held) = self.global.write().get_mut(address) {
            held.remove(permissions);
        }
    }

    pub fn grant_scoped(&self, address: Address, entity: AssetId, permissions: Permissions) {
        self.scoped
            .write()
            .entry((address, entity))
            .or_default()
            .insert(permissions);
    }

    pub fn permissions(&self, address: &Address) -> Permissions {
        self.global.read().get(address).copied().unwrap_or_default()
    }

    fn scoped_permissions(&self, address: &Address, entity: &AssetId) -> Permissions {
        self.scoped
            .read()
            .get(&(*address, *entity))
            .copied()
            .unwrap_or_default()
    }
}

impl PermissionOracle for PermissionTable {
    fn can_send(&self, address: &Address) -> bool {
        self.permissions(address).contains(Permissions::SEND)
    }

    fn can_receive(&self, address: &Address) -> bool {
        self.permissions(address).contains(Permissions::RECEIVE)
    }

    fn can_perform(&self, address: &Address, role: PermissionRole, entity: Option<&AssetId>) -> bool {
        match entity {
            Some(entity) => self.scoped_permissions(address, entity).contains(role.bit()),
            None => self.permissions(address).contains(role.bit()),
        }
    }

    fn can_send_asset(&self, address: &Address, asset: &AssetId) -> bool {
        self.scoped_permissions(address, asset)
            .contains(Permissions::SEND)
    }

    fn can_receive_asset(&self, address: &Address, asset: &AssetId) -> bool {
        self.scoped_permissions(address, asset)
            .contains(Permissions::RECEIVE)
    }
}
