//! Assignment of assets to bounded-capacity groups.
//!
//! Every asset the wallet has seen belongs to exactly one group, and all
//! change for a group travels in a single output, so a group's capacity is
//! bounded by how many asset quantities fit into that output's script.
//! Groups with free slots are kept in per-fill-level lists, which makes
//! "find a group with room for k more assets" a scan over at most
//! `capacity` list heads.

use crate::asset::{AssetCatalog, AssetId, AssetKey};
use crate::error::{SelectionError, SelectionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Group identifier, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(u32);

impl GroupId {
    fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupResult {
    /// All real assets of the set share this group.
    Group(GroupId),
    /// The set holds only native currency, roles or genesis markers.
    NoRealAssets,
    /// The set's assets span more than one group.
    Conflict,
    /// Some assets are unknown and were not added.
    Unassigned,
}

#[derive(Debug, Clone, Default)]
struct AssetGroup {
    next: Option<GroupId>,
    members: Vec<AssetId>,
    pinned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AssetGroupTree {
    assets_per_group: usize,
    max_assets_per_group: usize,
    optimal_group_count: usize,
    pinned_count: usize,
    membership: HashMap<AssetId, GroupId>,
    groups: Vec<AssetGroup>,
    fill_heads: Vec<Option<GroupId>>,
}

impl AssetGroupTree {
    pub fn new(
        assets_per_group: usize,
        max_assets_per_group: usize,
        optimal_group_count: usize,
    ) -> SelectionResult<Self> {
        let mut tree = Self::default();
        tree.initialize(assets_per_group, max_assets_per_group, optimal_group_count)?;
        Ok(tree)
    }

    pub fn initialize(
        &mut self,
        assets_per_group: usize,
        max_assets_per_group: usize,
        optimal_group_count: usize,
    ) -> SelectionResult<()> {
        if assets_per_group == 0 {
            return Err(SelectionError::internal("asset group capacity must be positive"));
        }
        *self = Self {
            assets_per_group,
            max_assets_per_group: max_assets_per_group.max(assets_per_group),
            optimal_group_count: optimal_group_count.max(1),
            fill_heads: vec![None; assets_per_group],
            ..Self::default()
        };
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.assets_per_group
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn asset_count(&self) -> usize {
        self.membership.len()
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned_count
    }

    pub fn group_of(&self, asset: &AssetId) -> Option<GroupId> {
        self.membership.get(asset).copied()
    }

    pub fn members(&self, group: GroupId) -> &[AssetId] {
        self.groups
            .get(group.index())
            .map(|g| g.members.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_pinned(&self, group: GroupId) -> bool {
        self.groups.get(group.index()).map_or(false, |g| g.pinned)
    }

    /// Classifies a coin's asset set. With `add_if_absent`, unknown assets
    /// are assigned, preferably all to one group.
    pub fn classify(
        &mut self,
        assets: &[AssetKey],
        add_if_absent: bool,
        catalog: &dyn AssetCatalog,
    ) -> SelectionResult<GroupResult> {
        let mut real: Vec<AssetId> = Vec::new();
        for id in assets.iter().filter_map(AssetKey::entity) {
            if !real.contains(id) {
                real.push(*id);
            }
        }
        if real.is_empty() {
            return Ok(GroupResult::NoRealAssets);
        }

        let fresh: Vec<AssetId> = real
            .iter()
            .filter(|id| !self.membership.contains_key(*id))
            .copied()
            .collect();

        if fresh.is_empty() {
            return Ok(self.shared_group(&real));
        }
        if !add_if_absent {
            return Ok(GroupResult::Unassigned);
        }

        let (pinned, grouped): (Vec<AssetId>, Vec<AssetId>) = fresh
            .into_iter()
            .partition(|id| catalog.requires_dedicated_group(id));
        for asset in pinned {
            self.place_pinned(asset)?;
        }

        if !grouped.is_empty() {
            self.place_together(&real, &grouped)?;
        }

        Ok(self.shared_group(&real))
    }

    /// Single-asset variant of [`classify`](Self::classify).
    pub fn classify_one(
        &mut self,
        asset: &AssetId,
        add_if_absent: bool,
        catalog: &dyn AssetCatalog,
    ) -> SelectionResult<GroupResult> {
        if let Some(group) = self.group_of(asset) {
            return Ok(GroupResult::Group(group));
        }
        if !add_if_absent {
            return Ok(GroupResult::Unassigned);
        }
        if catalog.requires_dedicated_group(asset) {
            return self.place_pinned(*asset).map(GroupResult::Group);
        }
        self.resize(1);
        let group = self.place_one(*asset)?;
        Ok(GroupResult::Group(group))
    }

    /// Doubles the per-group capacity while the groups implied by
    /// `optimal_group_count` cannot hold the known assets plus
    /// `additional`. Does nothing past `max_assets_per_group`.
    pub fn resize(&mut self, additional: usize) {
        let needed = (self.asset_count() + additional).saturating_sub(self.pinned_count);
        let mut capacity = self.assets_per_group;
        while self.optimal_group_count * capacity < needed {
            capacity *= 2;
        }
        if capacity == self.assets_per_group || capacity > self.max_assets_per_group {
            return;
        }

        let old_capacity = self.assets_per_group;
        self.assets_per_group = capacity;
        self.fill_heads.resize(capacity, None);

        // groups that were full have room again
        for index in 0..self.groups.len() {
            let group = &self.groups[index];
            if !group.pinned && group.members.len() == old_capacity {
                self.link(old_capacity, GroupId(index as u32 + 1));
            }
        }

        debug!(
            old_capacity,
            new_capacity = capacity,
            assets = self.asset_count(),
            "asset group tree resized"
        );
    }

    pub fn log_summary(&self) {
        debug!(
            capacity = self.assets_per_group,
            groups = self.groups.len(),
            assets = self.asset_count(),
            pinned = self.pinned_count,
            "asset group tree"
        );
        for (index, group) in self.groups.iter().enumerate() {
            debug!(
                group = index + 1,
                size = group.members.len(),
                pinned = group.pinned,
                next = ?group.next.map(GroupId::get),
                "asset group"
            );
        }
    }

    fn shared_group(&self, real: &[AssetId]) -> GroupResult {
        let mut shared: Option<GroupId> = None;
        for asset in real {
            match (self.group_of(asset), shared) {
                (None, _) => return GroupResult::Unassigned,
                (Some(group), None) => shared = Some(group),
                (Some(group), Some(current)) if group != current => return GroupResult::Conflict,
                _ => {}
            }
        }
        shared.map_or(GroupResult::NoRealAssets, GroupResult::Group)
    }

    fn place_together(&mut self, real: &[AssetId], fresh: &[AssetId]) -> SelectionResult<()> {
        let k = fresh.len();
        self.resize(k);

        // known assets of the set already share a group with room
        if let GroupResult::Group(group) = self.shared_known_group(real) {
            let size = self.group(group)?.members.len();
            if !self.group(group)?.pinned && size + k <= self.assets_per_group {
                self.unlink(size, group)?;
                self.add_members(group, fresh)?;
                self.link(size + k, group);
                return Ok(());
            }
        }

        if let Some(group) = self.find_and_shift_best_group(k)? {
            return self.add_members(group, fresh);
        }

        for asset in fresh {
            self.place_one(*asset)?;
        }
        Ok(())
    }

    fn shared_known_group(&self, real: &[AssetId]) -> GroupResult {
        let known: Vec<AssetId> = real
            .iter()
            .filter(|id| self.membership.contains_key(*id))
            .copied()
            .collect();
        self.shared_group(&known)
    }

    fn place_one(&mut self, asset: AssetId) -> SelectionResult<GroupId> {
        let group = self
            .find_and_shift_best_group(1)?
            .ok_or_else(|| SelectionError::internal("no asset group with a free slot"))?;
        self.add_members(group, &[asset])?;
        Ok(group)
    }

    fn place_pinned(&mut self, asset: AssetId) -> SelectionResult<GroupId> {
        let group = self.allocate_group(true)?;
        self.add_members(group, &[asset])?;
        self.pinned_count += 1;
        debug!(group = group.get(), asset = %hex::encode(&asset[..8]), "pinned asset to dedicated group");
        Ok(group)
    }

    /// Pops a group with room for `k` more members from the fullest
    /// suitable fill level, or allocates a new one, and re-links it at its
    /// future fill level. Members are added by the caller.
    fn find_and_shift_best_group(&mut self, k: usize) -> SelectionResult<Option<GroupId>> {
        if k == 0 || k > self.assets_per_group {
            return Ok(None);
        }

        let top = self.assets_per_group - k;
        let found = (0..=top)
            .rev()
            .find_map(|level| self.fill_heads[level].map(|group| (level, group)));

        let (level, group) = match found {
            Some((level, group)) => {
                let next = self.group(group)?.next;
                self.fill_heads[level] = next;
                self.group_mut(group)?.next = None;
                (level, group)
            }
            None => (0, self.allocate_group(false)?),
        };

        self.link(level + k, group);
        Ok(Some(group))
    }

    fn allocate_group(&mut self, pinned: bool) -> SelectionResult<GroupId> {
        let id = u32::try_from(self.groups.len() + 1)
            .map_err(|_| SelectionError::internal("asset group arena exhausted"))?;
        self.groups.push(AssetGroup {
            next: None,
            members: Vec::new(),
            pinned,
        });
        Ok(GroupId(id))
    }

    fn add_members(&mut self, group: GroupId, assets: &[AssetId]) -> SelectionResult<()> {
        self.group_mut(group)?.members.extend_from_slice(assets);
        for asset in assets {
            self.membership.insert(*asset, group);
        }
        Ok(())
    }

    /// Pushes `group` onto the list for `level`; full groups stay unlinked.
    fn link(&mut self, level: usize, group: GroupId) {
        if level >= self.assets_per_group {
            return;
        }
        let head = self.fill_heads[level];
        if let Some(entry) = self.groups.get_mut(group.index()) {
            entry.next = head;
            self.fill_heads[level] = Some(group);
        }
    }

    fn unlink(&mut self, level: usize, group: GroupId) -> SelectionResult<()> {
        if level >= self.assets_per_group {
            // full groups are not linked anywhere
            return Ok(());
        }
        let mut previous: Option<GroupId> = None;
        let mut cursor = self.fill_heads[level];
        while let Some(current) = cursor {
            let next = self.group(current)?.next;
            if current == group {
                match previous {
                    None => self.fill_heads[level] = next,
                    Some(prev) => self.group_mut(prev)?.next = next,
                }
                self.group_mut(group)?.next = None;
                return Ok(());
            }
            previous = Some(current);
            cursor = next;
        }
        Err(SelectionError::internal(format!(
            "group {} missing from fill level {}",
            group, level
        )))
    }

    fn group(&self, group: GroupId) -> SelectionResult<&AssetGroup> {
        self.groups
            .get(group.index())
            .ok_or_else(|| SelectionError::internal(format!("unknown asset group {}", group)))
    }

    fn group_mut(&mut self, group: GroupId) -> SelectionResult<&mut AssetGroup> {
        self.groups
            .get_mut(group.index())
            .ok_or_else(|| SelectionError::internal(format!("unknown asset group {}", group)))
    }
}
