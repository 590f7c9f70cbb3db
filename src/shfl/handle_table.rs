//! Process-wide table of open file and directory handles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::error::{ShflError, ShflResult};
use crate::file_info::{DirInfo, FileInfo};
use crate::shfl::types::{ClientId, Root, ShflHandle};

pub const MAX_HANDLES: usize = 4096;

#[derive(Debug)]
pub enum HandleEntry {
    File(FileInfo),
    Dir(DirInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

impl HandleEntry {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleEntry::File(_) => HandleKind::File,
            HandleEntry::Dir(_) => HandleKind::Dir,
        }
    }
}

/// Payload of a handle, locked on its own so host I/O on one handle does
/// not hold up lookups of the others.
pub type SharedEntry = Arc<Mutex<HandleEntry>>;

#[derive(Debug)]
struct Slot {
    owner: ClientId,
    root: Root,
    generation: u32,
    kind: HandleKind,
    entry: SharedEntry,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Option<Slot>>,
    /// Generation of the next handle handed out for each slot.
    generations: Vec<u32>,
    cursor: usize,
    used: usize,
}

/// Slot 0 is never handed out; handle values carry the slot index in the
/// low 32 bits and a per-slot generation above it, so a handle closed and
/// later reused is recognised as stale.
#[derive(Debug)]
pub struct HandleTable {
    inner: Mutex<Inner>,
}

fn encode(index: usize, generation: u32) -> ShflHandle {
    ShflHandle(((generation as u64) << 32) | index as u64)
}

fn decode(handle: ShflHandle) -> (usize, u32) {
    ((handle.0 & 0xffff_ffff) as usize, (handle.0 >> 32) as u32)
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            inner: Mutex::new(Inner {
                slots: (0..capacity).map(|_| None).collect(),
                generations: vec![0; capacity],
                cursor: 1,
                used: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `entry` in the next free slot after the rolling cursor.
    ///
    /// Returns `None` when every slot is taken; the payload is dropped then,
    /// which closes the host object.
    pub fn alloc(&self, owner: ClientId, root: Root, entry: HandleEntry) -> Option<ShflHandle> {
        let mut inner = self.lock();
        let capacity = inner.slots.len();
        if inner.used + 1 >= capacity {
            warn!("Handle table full ({} slots)", capacity);
            return None;
        }

        let start = inner.cursor;
        let mut index = start;
        loop {
            if index != 0 && inner.slots[index].is_none() {
                break;
            }
            index = (index + 1) % capacity;
            if index == start {
                return None;
            }
        }

        let generation = inner.generations[index];
        inner.generations[index] = generation.wrapping_add(1) & 0x7fff_ffff;
        inner.slots[index] = Some(Slot {
            owner,
            root,
            generation,
            kind: entry.kind(),
            entry: Arc::new(Mutex::new(entry)),
        });
        inner.used += 1;
        inner.cursor = (index + 1) % capacity;

        let handle = encode(index, generation);
        debug!("Allocated handle {} for client {:?} on {}", handle, owner, root);
        Some(handle)
    }

    fn slot_mut<'t>(inner: &'t mut Inner, owner: ClientId, handle: ShflHandle) -> ShflResult<&'t mut Slot> {
        if handle.is_nil() {
            return Err(ShflError::InvalidHandle);
        }
        let (index, generation) = decode(handle);
        match inner.slots.get_mut(index).and_then(Option::as_mut) {
            Some(slot) if index != 0 && slot.owner == owner && slot.generation == generation => Ok(slot),
            _ => Err(ShflError::InvalidHandle),
        }
    }

    pub fn kind_of(&self, owner: ClientId, handle: ShflHandle) -> ShflResult<(HandleKind, Root)> {
        let mut inner = self.lock();
        let slot = Self::slot_mut(&mut inner, owner, handle)?;
        Ok((slot.kind, slot.root))
    }

    /// Clones the payload out of the table so the table lock is released
    /// before the caller touches the host.
    fn shared(&self, owner: ClientId, handle: ShflHandle) -> ShflResult<(SharedEntry, Root)> {
        let mut inner = self.lock();
        let slot = Self::slot_mut(&mut inner, owner, handle)?;
        Ok((slot.entry.clone(), slot.root))
    }

    /// Runs `f` on the file behind `handle`. Directory handles are rejected.
    pub fn with_file<R>(
        &self,
        owner: ClientId,
        handle: ShflHandle,
        f: impl FnOnce(&mut FileInfo, Root) -> R,
    ) -> ShflResult<R> {
        let (shared, root) = self.shared(owner, handle)?;
        let mut entry = shared.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *entry {
            HandleEntry::File(file) => Ok(f(file, root)),
            HandleEntry::Dir(_) => Err(ShflError::InvalidHandle),
        }
    }

    /// Runs `f` on the directory behind `handle`. File handles are rejected.
    pub fn with_dir<R>(
        &self,
        owner: ClientId,
        handle: ShflHandle,
        f: impl FnOnce(&mut DirInfo, Root) -> R,
    ) -> ShflResult<R> {
        let (shared, root) = self.shared(owner, handle)?;
        let mut entry = shared.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *entry {
            HandleEntry::Dir(dir) => Ok(f(dir, root)),
            HandleEntry::File(_) => Err(ShflError::InvalidHandle),
        }
    }

    /// Detaches `handle` from the table. The host object closes once the
    /// last in-flight call on it is done.
    pub fn free(&self, owner: ClientId, handle: ShflHandle) -> ShflResult<HandleKind> {
        let mut inner = self.lock();
        Self::slot_mut(&mut inner, owner, handle)?;
        let (index, _) = decode(handle);
        let slot = inner.slots[index].take().ok_or(ShflError::InvalidHandle)?;
        inner.used -= 1;
        debug!("Freed handle {} of client {:?}", handle, owner);
        Ok(slot.kind)
    }

    /// Removes every handle owned by `owner`.
    pub fn drain_session(&self, owner: ClientId) -> Vec<SharedEntry> {
        let mut inner = self.lock();
        let mut drained = Vec::new();
        for slot in inner.slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.owner == owner) {
                if let Some(s) = slot.take() {
                    drained.push(s.entry);
                }
            }
        }
        inner.used -= drained.len();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(MAX_HANDLES)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::shfl::types::Access;

    fn dir_entry(path: &std::path::Path) -> HandleEntry {
        HandleEntry::Dir(DirInfo::open(path.to_path_buf()).unwrap())
    }

    fn file_entry(path: &std::path::Path) -> HandleEntry {
        let file = fs::File::open(path).unwrap();
        HandleEntry::File(FileInfo::from_file(file, path.to_path_buf(), Access::Read, false))
    }

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    #[test]
    fn slot_zero_is_never_returned() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::new(4);
        let mut handles = Vec::new();
        while let Some(h) = table.alloc(A, Root(0), dir_entry(tmp.path())) {
            handles.push(h);
        }
        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| decode(*h).0 != 0));
    }

    #[test]
    fn cursor_wraps_and_reuses_freed_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::new(4);
        let h1 = table.alloc(A, Root(0), dir_entry(tmp.path())).unwrap();
        let h2 = table.alloc(A, Root(0), dir_entry(tmp.path())).unwrap();
        let _h3 = table.alloc(A, Root(0), dir_entry(tmp.path())).unwrap();
        assert!(table.alloc(A, Root(0), dir_entry(tmp.path())).is_none());

        table.free(A, h2).unwrap();
        let h4 = table.alloc(A, Root(0), dir_entry(tmp.path())).unwrap();
        assert_eq!(decode(h4).0, decode(h2).0);
        assert_ne!(h4, h2);

        table.free(A, h1).unwrap();
        assert_eq!(table.free(A, h1).unwrap_err(), ShflError::InvalidHandle);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn foreign_and_stale_handles_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"abc").unwrap();

        let table = HandleTable::default();
        let h = table.alloc(A, Root(3), file_entry(&file)).unwrap();

        assert_eq!(table.free(B, h).unwrap_err(), ShflError::InvalidHandle);
        assert_eq!(table.kind_of(A, h).unwrap(), (HandleKind::File, Root(3)));
        assert_eq!(table.with_dir(A, h, |_, _| ()).unwrap_err(), ShflError::InvalidHandle);
        assert_eq!(table.with_file(A, ShflHandle::NIL, |_, _| ()).unwrap_err(), ShflError::InvalidHandle);
        assert_eq!(table.with_file(A, h, |f, root| (f.path.clone(), root)).unwrap(), (file.clone(), Root(3)));

        assert_eq!(table.free(A, h).unwrap(), HandleKind::File);
        assert_eq!(table.kind_of(A, h).unwrap_err(), ShflError::InvalidHandle);
    }

    #[test]
    fn drain_only_takes_own_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let table = HandleTable::default();
        table.alloc(A, Root(0), dir_entry(tmp.path())).unwrap();
        table.alloc(A, Root(1), dir_entry(tmp.path())).unwrap();
        let hb = table.alloc(B, Root(0), dir_entry(tmp.path())).unwrap();

        assert_eq!(table.drain_session(A).len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.kind_of(B, hb).is_ok());
    }

    #[test]
    fn table_stays_usable_while_a_handle_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"abc").unwrap();

        let table = HandleTable::default();
        let busy = table.alloc(A, Root(0), file_entry(&file)).unwrap();
        let other = table.alloc(B, Root(0), dir_entry(tmp.path())).unwrap();

        let seen = table
            .with_file(A, busy, |_, _| {
                let kind = table.kind_of(B, other).unwrap();
                let closed = table.free(B, other).unwrap();
                (kind, closed, table.len())
            })
            .unwrap();
        assert_eq!(seen, ((HandleKind::Dir, Root(0)), HandleKind::Dir, 1));
    }
}
