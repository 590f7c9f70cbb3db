use std::io;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{ShflError, ShflResult};
use crate::server::FolderServer;
use crate::shfl::handle_table::HandleKind;
use crate::shfl::mappings::{MappingInfo, MappingList, MappingRef};
use crate::shfl::notify::WaitTicket;
use crate::shfl::saved_state::SavedSession;
use crate::shfl::types::{
    ClientId, CreateReply, CreateRequest, GuestPath, ListFlags, ListReply, LockFlags, LockMode, ObjInfo,
    RemoveFlags, RenameFlags, Root, SetObjInfo, ShflHandle, VolumeInfo,
};
use crate::shfl::utils::error_style::{self, ErrorStyle, HostOp};
use crate::shfl::utils::path_resolver::{PathResolver, ResolveFlags, ResolvedPath};

use super::SessionState;
use super::handlers::{create, dir_ops, file_ops, path_ops};

/// Result of a write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReply {
    pub written: u32,
    /// File offset after the write. For append handles this is the new size.
    pub offset: u64,
}

/// One guest connection to the shared folders service.
///
/// Dropping the session has the same effect as [`disconnect`](Self::disconnect).
#[derive(Debug)]
pub struct ShflSession {
    pub(crate) server: Arc<FolderServer>,
    pub(crate) state: SessionState,
    connected: bool,
}

impl ShflSession {
    pub(crate) fn new(server: Arc<FolderServer>, id: ClientId) -> Self {
        Self {
            server,
            state: SessionState::new(id),
            connected: true,
        }
    }

    pub fn id(&self) -> ClientId {
        self.state.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn server(&self) -> &Arc<FolderServer> {
        &self.server
    }

    pub fn set_utf8(&mut self) {
        self.state.utf8 = true;
    }

    pub fn set_symlinks(&mut self) {
        self.state.symlinks = true;
    }

    pub fn set_error_style(&mut self, style: ErrorStyle) {
        debug!("Client {:?} uses {:?} error style", self.state.id, style);
        self.state.error_style = style;
    }

    pub fn query_mappings(&self, only_auto_mounts: bool, capacity: usize) -> MappingList {
        self.server.query_mappings(only_auto_mounts, capacity)
    }

    pub fn query_map_name(&self, root: Root) -> ShflResult<String> {
        self.server.query_map_name(root)
    }

    pub fn query_map_info(&self, root: Root) -> ShflResult<MappingInfo> {
        self.server.query_map_info(root)
    }

    pub fn map_folder(&mut self, name: &str, delimiter: char, case_sensitive: bool) -> ShflResult<Root> {
        if delimiter != '/' && delimiter != '\\' {
            return Err(ShflError::InvalidParameter);
        }
        if let Some(fixed) = self.state.delimiter {
            if fixed != delimiter {
                warn!(
                    "Client {:?} asked for delimiter {:?} but uses {:?}",
                    self.state.id, delimiter, fixed
                );
                return Err(ShflError::InvalidParameter);
            }
        }

        let root = self.server.mappings().map(name, case_sensitive)?;
        self.state.delimiter.get_or_insert(delimiter);
        *self.state.mapping_counts.entry(root).or_insert(0) += 1;

        info!("Client {:?} mapped {:?} as {}", self.state.id, name, root);
        Ok(root)
    }

    pub fn unmap_folder(&mut self, root: Root) -> ShflResult<()> {
        let freed = {
            let mut table = self.server.mappings();
            if !table.is_bound(root) {
                return Err(ShflError::InvalidParameter);
            }
            let Some(count) = self.state.mapping_counts.get_mut(&root) else {
                return Err(ShflError::InvalidHandle);
            };
            let freed = table.unmap(root)?;
            *count -= 1;
            if *count == 0 {
                self.state.mapping_counts.remove(&root);
            }
            freed
        };

        info!("Client {:?} unmapped {}", self.state.id, root);
        if freed {
            self.server.notifier().notify_changed();
        }
        Ok(())
    }

    /// Waits for the mapping table to move past `known_version`.
    ///
    /// A [`WaitTicket::Pending`] answer is the "pending" reply for the
    /// transport; awaiting it yields the completion.
    pub fn wait_for_changes(&mut self, known_version: u32) -> ShflResult<WaitTicket> {
        let restored = std::mem::take(&mut self.state.restored);
        self.server.notifier().begin_wait(self.state.id, known_version, restored)
    }

    pub fn cancel_waits(&self) {
        self.server.notifier().cancel_waits(self.state.id);
    }

    pub fn create(&mut self, root: Root, path: &GuestPath, request: &CreateRequest) -> ShflResult<CreateReply> {
        create::handle_create(self, root, path, request)
    }

    pub fn close(&mut self, root: Root, handle: ShflHandle) -> ShflResult<()> {
        file_ops::handle_close(self, root, handle)
    }

    pub fn read(&mut self, root: Root, handle: ShflHandle, offset: u64, len: u32) -> ShflResult<Vec<u8>> {
        file_ops::handle_read(self, root, handle, offset, len)
    }

    pub fn write(&mut self, root: Root, handle: ShflHandle, offset: u64, data: &[u8]) -> ShflResult<WriteReply> {
        file_ops::handle_write(self, root, handle, offset, data)
    }

    pub fn flush(&mut self, root: Root, handle: ShflHandle) -> ShflResult<()> {
        file_ops::handle_flush(self, root, handle)
    }

    pub fn lock(
        &mut self,
        root: Root,
        handle: ShflHandle,
        offset: u64,
        len: u64,
        mode: LockMode,
        flags: LockFlags,
    ) -> ShflResult<()> {
        file_ops::handle_lock(self, root, handle, offset, len, mode, flags)
    }

    pub fn unlock(&mut self, root: Root, handle: ShflHandle, offset: u64, len: u64, mode: LockMode) -> ShflResult<()> {
        file_ops::handle_unlock(self, root, handle, offset, len, mode)
    }

    pub fn set_file_size(&mut self, root: Root, handle: ShflHandle, size: u64) -> ShflResult<ObjInfo> {
        file_ops::handle_set_size(self, root, handle, size)
    }

    pub fn query_file_info(&mut self, root: Root, handle: ShflHandle) -> ShflResult<ObjInfo> {
        file_ops::handle_query_info(self, root, handle)
    }

    pub fn set_file_info(&mut self, root: Root, handle: ShflHandle, info: &SetObjInfo) -> ShflResult<ObjInfo> {
        file_ops::handle_set_info(self, root, handle, info)
    }

    pub fn query_volume_info(&mut self, root: Root) -> ShflResult<VolumeInfo> {
        file_ops::handle_query_volume(self, root)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_file_part(
        &mut self,
        src_root: Root,
        src_handle: ShflHandle,
        src_offset: u64,
        dst_root: Root,
        dst_handle: ShflHandle,
        dst_offset: u64,
        len: u64,
    ) -> ShflResult<u64> {
        file_ops::handle_copy_file_part(self, src_root, src_handle, src_offset, dst_root, dst_handle, dst_offset, len)
    }

    pub fn list(
        &mut self,
        root: Root,
        handle: ShflHandle,
        pattern: Option<&GuestPath>,
        flags: ListFlags,
        buffer_size: u32,
    ) -> ShflResult<ListReply> {
        dir_ops::handle_list(self, root, handle, pattern, flags, buffer_size)
    }

    pub fn remove(&mut self, root: Root, path: &GuestPath, flags: RemoveFlags) -> ShflResult<()> {
        path_ops::handle_remove(self, root, path, flags, None)
    }

    /// Closes `handle` and removes the object at `path` in one call.
    pub fn close_and_remove(
        &mut self,
        root: Root,
        path: &GuestPath,
        flags: RemoveFlags,
        handle: ShflHandle,
    ) -> ShflResult<()> {
        path_ops::handle_remove(self, root, path, flags, Some(handle))
    }

    pub fn rename(&mut self, root: Root, src: &GuestPath, dst: &GuestPath, flags: RenameFlags) -> ShflResult<()> {
        path_ops::handle_rename(self, root, src, dst, flags)
    }

    pub fn copy_file(
        &mut self,
        src_root: Root,
        src: &GuestPath,
        dst_root: Root,
        dst: &GuestPath,
        flags: u32,
    ) -> ShflResult<()> {
        path_ops::handle_copy_file(self, src_root, src, dst_root, dst, flags)
    }

    pub fn read_link(&mut self, root: Root, path: &GuestPath) -> ShflResult<GuestPath> {
        path_ops::handle_read_link(self, root, path)
    }

    pub fn symlink(&mut self, root: Root, new_path: &GuestPath, target: &GuestPath) -> ShflResult<ObjInfo> {
        path_ops::handle_symlink(self, root, new_path, target)
    }

    pub fn saved_state(&self) -> SavedSession {
        SavedSession {
            utf8: self.state.utf8,
            symlinks: self.state.symlinks,
            error_style: self.state.error_style,
            delimiter: self.state.delimiter,
            mapping_counts: self.state.mapping_counts.clone(),
        }
    }

    /// Reinstates a connection from saved state. Mapping reference counts
    /// are expected to come back with the saved mappings.
    pub fn restore(&mut self, saved: SavedSession) {
        self.state.utf8 = saved.utf8;
        self.state.symlinks = saved.symlinks;
        self.state.error_style = saved.error_style;
        self.state.delimiter = saved.delimiter;
        self.state.mapping_counts = saved.mapping_counts;
        self.state.restored = true;
    }

    /// Cancels waits, closes every handle and drops every mapping reference
    /// the connection holds.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;

        self.server.notifier().disconnect(self.state.id);

        let closed = self.server.handles().drain_session(self.state.id);
        if !closed.is_empty() {
            info!("Closing {} handles of client {:?}", closed.len(), self.state.id);
        }
        drop(closed);

        let mut freed = false;
        {
            let mut table = self.server.mappings();
            for (root, count) in self.state.mapping_counts.drain() {
                for _ in 0..count {
                    match table.unmap(root) {
                        Ok(gone) => freed |= gone,
                        Err(e) => {
                            warn!("Client {:?} could not release {}: {}", self.state.id, root, e);
                            break;
                        }
                    }
                }
            }
        }
        if freed {
            self.server.notifier().notify_changed();
        }

        info!("Client {:?} disconnected", self.state.id);
    }

    pub(crate) fn resolver<'m>(&self, mapping: &'m MappingRef) -> PathResolver<'m> {
        PathResolver::new(&mapping.host_path, self.state.delimiter(), self.state.utf8)
            .with_case_correction(mapping.needs_case_correction())
    }

    /// Mapping behind `root` for a path based call.
    pub(crate) fn path_mapping(&self, root: Root) -> ShflResult<MappingRef> {
        let mapping = self.server.lookup(root).ok_or(ShflError::InvalidParameter)?;
        if mapping.missing {
            debug!("{} is missing, refusing path access", root);
            return Err(ShflError::PathNotFound);
        }
        Ok(mapping)
    }

    pub(crate) fn resolve(
        &self,
        mapping: &MappingRef,
        path: &GuestPath,
        flags: ResolveFlags,
    ) -> ShflResult<ResolvedPath> {
        self.resolver(mapping).resolve_path(path, flags)
    }

    /// Validates that `handle` belongs to this session and to `root`, and
    /// that the mapping is still there.
    pub(crate) fn handle_mapping(&self, root: Root, handle: ShflHandle) -> ShflResult<(HandleKind, MappingRef)> {
        let (kind, origin) = self.server.handles().kind_of(self.state.id, handle)?;
        if origin != root {
            warn!("Handle {} belongs to {}, not {}", handle, origin, root);
            return Err(ShflError::InvalidHandle);
        }
        match self.server.lookup(root) {
            Some(mapping) if !mapping.missing => Ok((kind, mapping)),
            _ => Err(ShflError::AccessDenied),
        }
    }

    pub(crate) fn host_error(&self, e: io::Error, path: &ResolvedPath, op: HostOp) -> ShflError {
        error_style::adjust(self.state.error_style, ShflError::from(e), path, op)
    }
}

pub(crate) fn require_writable(mapping: &MappingRef) -> ShflResult<()> {
    if mapping.writable {
        Ok(())
    } else {
        Err(ShflError::WriteProtect)
    }
}

impl Drop for ShflSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
