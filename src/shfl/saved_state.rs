//! Three-phase restore of the mapping table.
//!
//! The byte layout belongs to whoever persists the state. This module only
//! exports a per-root view and reconciles it with the mappings configured on
//! the host when it is loaded back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use log::{info, warn};

use crate::error::{ShflError, ShflResult};
use crate::server::FolderServer;
use crate::shfl::mappings::{MAX_MAPPINGS, NewMapping, normalize_host_path};
use crate::shfl::types::Root;
use crate::shfl::utils::error_style::ErrorStyle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMapping {
    pub root: Root,
    pub name: String,
    pub host_path: PathBuf,
    pub auto_mount_point: String,
    pub writable: bool,
    pub auto_mount: bool,
    pub symlinks: bool,
    pub guest_case_sensitive: bool,
    pub ref_count: u32,
}

/// Per-connection state a guest connection carries across a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSession {
    pub utf8: bool,
    pub symlinks: bool,
    pub error_style: ErrorStyle,
    pub delimiter: Option<char>,
    pub mapping_counts: HashMap<Root, u32>,
}

impl FolderServer {
    pub fn saved_mappings(&self) -> Vec<SavedMapping> {
        let table = self.mappings();
        (0..MAX_MAPPINGS as u32)
            .map(Root)
            .filter_map(|root| {
                let m = table.get(root)?;
                Some(SavedMapping {
                    root,
                    name: m.name.clone(),
                    host_path: m.host_path.clone(),
                    auto_mount_point: m.auto_mount_point.clone(),
                    writable: m.writable,
                    auto_mount: m.auto_mount,
                    symlinks: m.symlinks,
                    guest_case_sensitive: m.guest_case_sensitive,
                    ref_count: m.ref_count,
                })
            })
            .collect()
    }

    /// Drops every root binding; the saved roots are re-established by
    /// [`mapping_loaded`](Self::mapping_loaded).
    pub fn begin_loading(&self) {
        info!("Loading saved shared folder state");
        self.loading.store(true, Ordering::SeqCst);
        self.mappings().unbind_all();
    }

    /// Binds `root` to the configured mapping matching `saved`, or to a
    /// placeholder when the host no longer has one.
    pub fn mapping_loaded(&self, saved: &SavedMapping, root: Root) -> ShflResult<()> {
        if root.0 as usize >= MAX_MAPPINGS {
            return Err(ShflError::InvalidParameter);
        }
        if !self.loading.load(Ordering::SeqCst) {
            warn!("Saved mapping {:?} loaded outside of a restore", saved.name);
        }

        let mut table = self.mappings();
        if table.is_bound(root) {
            warn!("Saved state binds {} twice, keeping the first binding", root);
            return Ok(());
        }

        let saved_path = normalize_host_path(&saved.host_path).unwrap_or_else(|_| saved.host_path.clone());
        let slot = match table.find_slot(&saved.name) {
            Some(slot) if table.root_of(slot).is_some() => {
                warn!("Saved mapping {:?} is already bound, ignoring {}", saved.name, root);
                return Ok(());
            }
            Some(slot) if table.slot(slot).is_some_and(|m| m.host_path == saved_path) => slot,
            _ => {
                info!("Saved mapping {:?} has no host counterpart, adding a placeholder", saved.name);
                let mut new = NewMapping::new(saved.name.clone(), saved.host_path.clone());
                new.writable = saved.writable;
                new.auto_mount = saved.auto_mount;
                new.auto_mount_point = saved.auto_mount_point.clone();
                new.symlinks = saved.symlinks;
                new.missing = true;
                new.placeholder = true;
                table.insert(new)?
            }
        };

        table.bind(root, slot);
        if let Some(mapping) = table.slot_mut(slot) {
            mapping.ref_count = saved.ref_count;
            mapping.guest_case_sensitive = saved.guest_case_sensitive;
        }
        Ok(())
    }

    /// Gives every mapping that did not appear in the saved state a root.
    pub fn loading_done(&self) -> ShflResult<()> {
        {
            let mut table = self.mappings();
            for slot in table.unbound_slots() {
                let root = table.bind_lowest_free(slot)?;
                info!("Configured mapping in slot {} bound to {} after restore", slot, root);
            }
        }
        self.loading.store(false, Ordering::SeqCst);
        self.notifier().notify_changed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shfl::mappings::MappingState;

    #[test]
    fn restore_keeps_saved_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let before = FolderServer::default();
        before.add_mapping(NewMapping::new("a", tmp.path())).unwrap();
        before.add_mapping(NewMapping::new("b", tmp.path())).unwrap();
        before.remove_mapping("a").unwrap();
        let saved = before.saved_mappings();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].root, Root(1));

        // Same configuration, added in a different order on the new host.
        let after = FolderServer::default();
        after.add_mapping(NewMapping::new("c", tmp.path())).unwrap();
        after.add_mapping(NewMapping::new("b", tmp.path())).unwrap();
        after.begin_loading();
        for entry in &saved {
            after.mapping_loaded(entry, entry.root).unwrap();
        }
        after.loading_done().unwrap();

        assert_eq!(after.query_map_name(Root(1)).unwrap(), "b");
        assert_eq!(after.query_map_name(Root(0)).unwrap(), "c");
    }

    #[test]
    fn unknown_saved_mapping_becomes_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let server = FolderServer::default();
        server.begin_loading();
        let saved = SavedMapping {
            root: Root(3),
            name: "gone".into(),
            host_path: tmp.path().join("gone"),
            auto_mount_point: String::new(),
            writable: true,
            auto_mount: false,
            symlinks: false,
            guest_case_sensitive: false,
            ref_count: 1,
        };
        server.mapping_loaded(&saved, Root(3)).unwrap();
        // Duplicate root is tolerated.
        server.mapping_loaded(&saved, Root(3)).unwrap();
        server.loading_done().unwrap();

        let table = server.mappings();
        let m = table.get(Root(3)).unwrap();
        assert_eq!(m.state, MappingState::Placeholder);
        assert!(m.is_missing());
        assert_eq!(m.ref_count, 1);
    }

    #[test]
    fn out_of_range_root_is_rejected() {
        let server = FolderServer::default();
        let saved = SavedMapping {
            root: Root(99),
            name: "x".into(),
            host_path: PathBuf::from("/x"),
            auto_mount_point: String::new(),
            writable: false,
            auto_mount: false,
            symlinks: false,
            guest_case_sensitive: false,
            ref_count: 0,
        };
        assert_eq!(server.mapping_loaded(&saved, Root(99)).unwrap_err(), ShflError::InvalidParameter);
    }
}
