//! Shared folder mappings and the root indirection exposed to guests.
//!
//! Mappings live in a fixed array of slots. Guests never see slot indices;
//! they see roots, which are bound to slots through a second array. Binding
//! the lowest free root keeps the numbering stable and predictable.

use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{ShflError, ShflResult};
use crate::shfl::types::Root;
use crate::shfl::utils::case_fold::{eq_ignore_case, host_is_case_sensitive};

pub const MAX_MAPPINGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Active,
    /// Removed by the host while guests still had it mapped.
    SoftDeleted,
    /// Restored from saved state without a matching host configuration.
    Placeholder,
}

/// Parameters of [`MappingTable::add`].
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub name: String,
    pub host_path: PathBuf,
    pub writable: bool,
    pub auto_mount: bool,
    pub auto_mount_point: String,
    pub symlinks: bool,
    /// The host folder is known to be absent.
    pub missing: bool,
    pub placeholder: bool,
}

impl NewMapping {
    pub fn new(name: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            host_path: host_path.into(),
            writable: true,
            auto_mount: false,
            auto_mount_point: String::new(),
            symlinks: false,
            missing: false,
            placeholder: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub name: String,
    pub host_path: PathBuf,
    pub auto_mount_point: String,
    pub writable: bool,
    pub auto_mount: bool,
    pub symlinks: bool,
    pub guest_case_sensitive: bool,
    pub host_case_sensitive: bool,
    missing: bool,
    pub state: MappingState,
    pub ref_count: u32,
}

impl Mapping {
    pub fn is_missing(&self) -> bool {
        self.missing || self.state != MappingState::Active
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.state, MappingState::SoftDeleted | MappingState::Placeholder)
    }
}

/// Checked view of a bound root, valid for the duration of one call.
#[derive(Debug, Clone)]
pub struct MappingRef {
    pub root: Root,
    pub host_path: PathBuf,
    pub writable: bool,
    pub symlinks: bool,
    pub guest_case_sensitive: bool,
    pub host_case_sensitive: bool,
    pub missing: bool,
}

impl MappingRef {
    pub fn needs_case_correction(&self) -> bool {
        self.host_case_sensitive && !self.guest_case_sensitive
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub name: String,
    pub auto_mount_point: String,
    pub writable: bool,
    pub auto_mount: bool,
    pub symlinks: bool,
    pub missing: bool,
    pub guest_case_sensitive: bool,
    pub host_case_sensitive: bool,
    /// Bumped every time the root is bound to a mapping.
    pub root_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueriedMapping {
    pub root: Root,
    pub root_version: u32,
}

/// Result of a mapping query.
///
/// `entries` is capped by the caller's capacity while `total` always holds
/// the number of matching mappings, so callers can detect a short buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingList {
    pub entries: Vec<QueriedMapping>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    StillInUse,
}

#[derive(Debug)]
pub struct MappingTable {
    slots: Vec<Option<Mapping>>,
    roots: Vec<Option<usize>>,
    root_versions: Vec<u32>,
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute form of `path` with `.` and `..` removed, without touching
/// symlinks.
pub fn normalize_host_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

impl MappingTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_MAPPINGS).map(|_| None).collect(),
            roots: vec![None; MAX_MAPPINGS],
            root_versions: vec![0; MAX_MAPPINGS],
        }
    }

    /// Creates a mapping and binds it to the lowest free root.
    pub fn add(&mut self, new: NewMapping) -> ShflResult<Root> {
        let slot = self.insert(new)?;
        self.bind_lowest_free(slot).inspect_err(|_| {
            warn!("No free root for mapping slot {}", slot);
            self.free_slot(slot);
        })
    }

    /// Creates a mapping without binding a root to it.
    pub fn insert(&mut self, new: NewMapping) -> ShflResult<usize> {
        if new.name.is_empty() {
            return Err(ShflError::InvalidParameter);
        }
        if !new.placeholder
            && self
                .slots
                .iter()
                .flatten()
                .any(|m| !m.is_placeholder() && eq_ignore_case(&m.name, &new.name))
        {
            warn!("Shared folder {:?} already exists", new.name);
            return Err(ShflError::AlreadyExists);
        }

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            warn!("No free mapping slot for {:?}", new.name);
            return Err(ShflError::TooMuchData);
        };

        let host_path = normalize_host_path(&new.host_path).map_err(|_| ShflError::InvalidParameter)?;
        let host_case_sensitive = if new.missing || new.placeholder {
            cfg!(not(any(windows, target_os = "macos")))
        } else {
            host_is_case_sensitive(&host_path)
        };

        info!(
            "Adding shared folder {:?} -> {:?} (writable: {}, auto-mount: {}, case sensitive host: {})",
            new.name, host_path, new.writable, new.auto_mount, host_case_sensitive
        );

        self.slots[slot] = Some(Mapping {
            name: new.name,
            host_path,
            auto_mount_point: new.auto_mount_point,
            writable: new.writable,
            auto_mount: new.auto_mount,
            symlinks: new.symlinks,
            guest_case_sensitive: false,
            host_case_sensitive,
            missing: new.missing,
            state: if new.placeholder {
                MappingState::Placeholder
            } else {
                MappingState::Active
            },
            ref_count: 0,
        });
        Ok(slot)
    }

    pub fn bind_lowest_free(&mut self, slot: usize) -> ShflResult<Root> {
        let index = self.roots.iter().position(Option::is_none).ok_or(ShflError::TooMuchData)?;
        let root = Root(index as u32);
        self.bind(root, slot);
        Ok(root)
    }

    pub(crate) fn bind(&mut self, root: Root, slot: usize) {
        let index = root.0 as usize;
        self.roots[index] = Some(slot);
        self.root_versions[index] = self.root_versions[index].wrapping_add(1);
        debug!("Bound {} to mapping slot {}", root, slot);
    }

    pub(crate) fn unbind_all(&mut self) {
        self.roots.iter_mut().for_each(|r| *r = None);
    }

    pub(crate) fn is_bound(&self, root: Root) -> bool {
        self.roots.get(root.0 as usize).is_some_and(Option::is_some)
    }

    pub(crate) fn root_of(&self, slot: usize) -> Option<Root> {
        self.roots.iter().position(|r| *r == Some(slot)).map(|i| Root(i as u32))
    }

    /// Slots holding a mapping with no root bound to it.
    pub(crate) fn unbound_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&slot| self.slots[slot].is_some() && self.root_of(slot).is_none())
            .collect()
    }

    /// Slot of the non-deleted mapping called `name`.
    pub(crate) fn find_slot(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|m| {
            m.as_ref()
                .is_some_and(|m| m.state != MappingState::SoftDeleted && eq_ignore_case(&m.name, name))
        })
    }

    fn free_slot(&mut self, slot: usize) {
        for root in self.roots.iter_mut().filter(|r| **r == Some(slot)) {
            *root = None;
        }
        if let Some(m) = self.slots[slot].take() {
            info!("Freed shared folder {:?}", m.name);
        }
    }

    /// Removes every mapping called `name`; mappings still in use are only
    /// marked as deleted and go away with their last user.
    pub fn remove(&mut self, name: &str) -> ShflResult<RemoveOutcome> {
        let matching: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].as_ref().is_some_and(|m| eq_ignore_case(&m.name, name)))
            .collect();
        if matching.is_empty() {
            return Err(ShflError::FileNotFound);
        }

        let mut outcome = RemoveOutcome::Removed;
        for slot in matching {
            let Some(mapping) = self.slots[slot].as_mut() else {
                continue;
            };
            if mapping.ref_count > 0 {
                info!(
                    "Shared folder {:?} still mapped {} times, marking as deleted",
                    mapping.name, mapping.ref_count
                );
                mapping.state = MappingState::SoftDeleted;
                outcome = RemoveOutcome::StillInUse;
            } else {
                self.free_slot(slot);
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, root: Root) -> Option<&Mapping> {
        let slot = (*self.roots.get(root.0 as usize)?)?;
        self.slots[slot].as_ref()
    }

    fn get_mut(&mut self, root: Root) -> Option<&mut Mapping> {
        let slot = (*self.roots.get(root.0 as usize)?)?;
        self.slots[slot].as_mut()
    }

    pub(crate) fn slot(&self, slot: usize) -> Option<&Mapping> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut Mapping> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn lookup(&self, root: Root) -> Option<MappingRef> {
        self.get(root).map(|m| MappingRef {
            root,
            host_path: m.host_path.clone(),
            writable: m.writable,
            symlinks: m.symlinks,
            guest_case_sensitive: m.guest_case_sensitive,
            host_case_sensitive: m.host_case_sensitive,
            missing: m.is_missing(),
        })
    }

    /// Bound mappings in root order, deleted ones still in use included.
    pub fn query(&self, only_auto_mounts: bool, capacity: usize) -> MappingList {
        let mut entries = Vec::new();
        let mut total = 0;
        for (index, slot) in self.roots.iter().enumerate() {
            let Some(m) = slot.and_then(|s| self.slots[s].as_ref()) else {
                continue;
            };
            if only_auto_mounts && !m.auto_mount {
                continue;
            }
            total += 1;
            if entries.len() < capacity {
                entries.push(QueriedMapping {
                    root: Root(index as u32),
                    root_version: self.root_versions[index],
                });
            }
        }
        MappingList { entries, total }
    }

    pub fn name(&self, root: Root) -> ShflResult<String> {
        self.get(root).map(|m| m.name.clone()).ok_or(ShflError::InvalidParameter)
    }

    pub fn info(&self, root: Root) -> ShflResult<MappingInfo> {
        let m = self.get(root).ok_or(ShflError::InvalidParameter)?;
        Ok(MappingInfo {
            name: m.name.clone(),
            auto_mount_point: m.auto_mount_point.clone(),
            writable: m.writable,
            auto_mount: m.auto_mount,
            symlinks: m.symlinks,
            missing: m.is_missing(),
            guest_case_sensitive: m.guest_case_sensitive,
            host_case_sensitive: m.host_case_sensitive,
            root_version: self.root_versions[root.0 as usize],
        })
    }

    pub fn writable(&self, root: Root) -> ShflResult<bool> {
        self.get(root).map(|m| m.writable).ok_or(ShflError::InvalidParameter)
    }

    pub fn symlinks(&self, root: Root) -> ShflResult<bool> {
        self.get(root).map(|m| m.symlinks).ok_or(ShflError::InvalidParameter)
    }

    /// Takes a reference on the active mapping called `name`.
    ///
    /// The first user decides whether the guest treats names case
    /// sensitively; later users must agree.
    pub fn map(&mut self, name: &str, case_sensitive: bool) -> ShflResult<Root> {
        let slot = self
            .slots
            .iter()
            .position(|m| {
                m.as_ref()
                    .is_some_and(|m| m.state == MappingState::Active && eq_ignore_case(&m.name, name))
            })
            .ok_or(ShflError::FileNotFound)?;
        let root = self.root_of(slot).ok_or(ShflError::FileNotFound)?;
        let mapping = self.slots[slot].as_mut().ok_or(ShflError::FileNotFound)?;

        if mapping.ref_count == 0 {
            mapping.guest_case_sensitive = case_sensitive;
        } else if mapping.guest_case_sensitive != case_sensitive {
            warn!(
                "Shared folder {:?} already mapped with case sensitivity {}",
                mapping.name, mapping.guest_case_sensitive
            );
            return Err(ShflError::IncompatibleConfig);
        }
        mapping.ref_count += 1;
        debug!("Mapped {:?} as {} ({} users)", mapping.name, root, mapping.ref_count);
        Ok(root)
    }

    /// Drops a reference. Returns `true` when a deleted or placeholder
    /// mapping went away with it.
    pub fn unmap(&mut self, root: Root) -> ShflResult<bool> {
        let mapping = self.get_mut(root).ok_or(ShflError::InvalidParameter)?;
        if mapping.ref_count == 0 {
            return Err(ShflError::InvalidHandle);
        }
        mapping.ref_count -= 1;
        debug!("Unmapped {:?} ({} users left)", mapping.name, mapping.ref_count);

        if mapping.ref_count == 0 && mapping.is_placeholder() {
            if let Some(slot) = self.roots[root.0 as usize] {
                self.free_slot(slot);
            }
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(dir: &Path, names: &[&str]) -> MappingTable {
        let mut table = MappingTable::new();
        for name in names {
            table.add(NewMapping::new(*name, dir)).unwrap();
        }
        table
    }

    #[test]
    fn failed_bind_releases_the_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = table_with(tmp.path(), &["a"]);
        for index in 1..MAX_MAPPINGS {
            table.bind(Root(index as u32), 0);
        }

        assert_eq!(table.add(NewMapping::new("b", tmp.path())).unwrap_err(), ShflError::TooMuchData);
        assert!(table.find_slot("b").is_none());
        assert!(table.unbound_slots().is_empty());
        assert!(table.slot(1).is_none());
    }

    #[test]
    fn roots_are_lowest_free() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = table_with(tmp.path(), &["a", "b", "c"]);
        assert_eq!(table.remove("b").unwrap(), RemoveOutcome::Removed);
        let root = table.add(NewMapping::new("d", tmp.path())).unwrap();
        assert_eq!(root, Root(1));
        assert_eq!(table.name(Root(1)).unwrap(), "d");
        assert_eq!(table.info(Root(1)).unwrap().root_version, 2);
    }

    #[test]
    fn names_collide_case_insensitively() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = table_with(tmp.path(), &["Share"]);
        let err = table.add(NewMapping::new("SHARE", tmp.path())).unwrap_err();
        assert_eq!(err, ShflError::AlreadyExists);
    }

    #[test]
    fn table_fills_up() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = MappingTable::new();
        for i in 0..MAX_MAPPINGS {
            table.add(NewMapping::new(format!("s{i}"), tmp.path())).unwrap();
        }
        let err = table.add(NewMapping::new("one-more", tmp.path())).unwrap_err();
        assert_eq!(err, ShflError::TooMuchData);
    }

    #[test]
    fn host_path_is_normalised() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = MappingTable::new();
        let root = table.add(NewMapping::new("x", tmp.path().join("sub/../."))).unwrap();
        assert_eq!(table.get(root).unwrap().host_path, normalize_host_path(tmp.path()).unwrap());
    }

    #[test]
    fn soft_delete_until_last_unmap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = table_with(tmp.path(), &["s"]);
        let root = table.map("s", false).unwrap();

        assert_eq!(table.remove("s").unwrap(), RemoveOutcome::StillInUse);
        let m = table.get(root).unwrap();
        assert_eq!(m.state, MappingState::SoftDeleted);
        assert!(m.is_missing());
        assert!(m.is_placeholder());
        assert!(table.lookup(root).unwrap().missing);
        assert_eq!(table.query(false, 10).total, 1);
        assert!(table.info(root).unwrap().missing);
        assert_eq!(table.map("s", false).unwrap_err(), ShflError::FileNotFound);

        assert!(table.unmap(root).unwrap());
        assert!(table.get(root).is_none());
        assert_eq!(table.query(false, 10).total, 0);
        assert_eq!(table.unmap(root).unwrap_err(), ShflError::InvalidParameter);
    }

    #[test]
    fn remove_unknown_name() {
        let mut table = MappingTable::new();
        assert_eq!(table.remove("nope").unwrap_err(), ShflError::FileNotFound);
    }

    #[test]
    fn guest_case_sensitivity_is_decided_by_first_user() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = table_with(tmp.path(), &["s"]);
        let root = table.map("S", true).unwrap();
        assert_eq!(table.map("s", false).unwrap_err(), ShflError::IncompatibleConfig);
        assert_eq!(table.map("s", true).unwrap(), root);
        assert_eq!(table.get(root).unwrap().ref_count, 2);

        table.unmap(root).unwrap();
        table.unmap(root).unwrap();
        assert_eq!(table.unmap(root).unwrap_err(), ShflError::InvalidHandle);
        assert_eq!(table.map("s", false).unwrap(), root);
    }

    #[test]
    fn query_reports_true_total() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = MappingTable::new();
        for (name, auto) in [("a", true), ("b", false), ("c", true)] {
            let mut new = NewMapping::new(name, tmp.path());
            new.auto_mount = auto;
            table.add(new).unwrap();
        }

        let all = table.query(false, 1);
        assert_eq!(all.total, 3);
        assert_eq!(all.entries.len(), 1);
        assert_eq!(all.entries[0].root, Root(0));

        let auto = table.query(true, 10);
        assert_eq!(auto.total, 2);
        assert_eq!(auto.entries.iter().map(|e| e.root).collect::<Vec<_>>(), vec![Root(0), Root(2)]);
    }

    #[test]
    fn missing_mapping_skips_case_check() {
        let mut table = MappingTable::new();
        let mut new = NewMapping::new("gone", "/definitely/not/here");
        new.missing = true;
        let root = table.add(new).unwrap();
        assert!(table.info(root).unwrap().missing);
        assert!(table.lookup(root).unwrap().missing);
    }
}
