use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, error, info, warn};

use crate::error::{ShflError, ShflResult};
use crate::shfl::handle_table::HandleKind;
use crate::shfl::session::{ShflSession, WriteReply, require_writable};
use crate::shfl::types::{LockFlags, LockMode, ObjInfo, Root, SetObjInfo, ShflHandle, VolumeInfo};
use crate::shfl::utils::metadata::MetadataConverter;

/// Largest chunk moved per host call by `copy_file_part`.
const COPY_CHUNK: usize = 64 * 1024;

pub fn handle_close(session: &mut ShflSession, root: Root, handle: ShflHandle) -> ShflResult<()> {
    info!("close handle: {}", handle);

    let (_, origin) = session.server.handles().kind_of(session.state.id, handle)?;
    if origin != root {
        warn!("Handle {} belongs to {}, not {}", handle, origin, root);
        return Err(ShflError::InvalidHandle);
    }

    let kind = session.server.handles().free(session.state.id, handle)?;
    info!("Closed {:?} handle: {}", kind, handle);
    Ok(())
}

fn read_at(file: &mut File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

pub fn handle_read(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    offset: u64,
    len: u32,
) -> ShflResult<Vec<u8>> {
    debug!("read handle: {}, offset: {}, requested len: {}", handle, offset, len);
    session.handle_mapping(root, handle)?;
    let len = len.min(session.server.max_read_size());

    let data = session
        .server
        .handles()
        .with_file(session.state.id, handle, |info, _| read_at(&mut info.file, offset, len as usize))?
        .map_err(|e| {
            error!("Failed to read from file handle {}: {}", handle, e);
            ShflError::from(e)
        })?;

    if let Some(led) = session.server.led() {
        led.record_read();
    }
    debug!("Read {} bytes from handle: {} at offset: {}", data.len(), handle, offset);
    Ok(data)
}

pub fn handle_write(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    offset: u64,
    data: &[u8],
) -> ShflResult<WriteReply> {
    debug!("write handle: {}, offset: {}, data len: {}", handle, offset, data.len());
    let (_, mapping) = session.handle_mapping(root, handle)?;
    require_writable(&mapping)?;

    let reply = session.server.handles().with_file(session.state.id, handle, |info, _| -> ShflResult<WriteReply> {
        if !info.access.can_write() && !info.append {
            warn!("Write through read-only handle {}", handle);
            return Err(ShflError::AccessDenied);
        }
        let target = if info.append { SeekFrom::End(0) } else { SeekFrom::Start(offset) };
        info.file.seek(target)?;
        info.file.write_all(data)?;
        let offset = info.file.stream_position()?;
        Ok(WriteReply {
            written: data.len() as u32,
            offset,
        })
    })??;

    if let Some(led) = session.server.led() {
        led.record_write();
    }
    debug!("Wrote {} bytes to handle: {}, now at offset: {}", reply.written, handle, reply.offset);
    Ok(reply)
}

pub fn handle_flush(session: &mut ShflSession, root: Root, handle: ShflHandle) -> ShflResult<()> {
    session.handle_mapping(root, handle)?;
    session
        .server
        .handles()
        .with_file(session.state.id, handle, |info, _| -> std::io::Result<()> {
            info.file.flush()?;
            info.file.sync_data()
        })?
        .map_err(ShflError::from)
}

pub fn handle_lock(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    offset: u64,
    len: u64,
    mode: LockMode,
    flags: LockFlags,
) -> ShflResult<()> {
    let (kind, _) = session.handle_mapping(root, handle)?;
    if kind != HandleKind::File {
        return Err(ShflError::InvalidHandle);
    }
    if mode == LockMode::Cancel || flags.contains(LockFlags::ENTIRE) {
        return Err(ShflError::InvalidParameter);
    }

    // POSIX record locks are advisory; the guest is told it got the lock.
    debug!(
        "lock handle: {}, {:?} {}..+{} (wait: {}), not enforced on this host",
        handle,
        mode,
        offset,
        len,
        flags.contains(LockFlags::WAIT)
    );
    Ok(())
}

pub fn handle_unlock(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    offset: u64,
    len: u64,
    mode: LockMode,
) -> ShflResult<()> {
    let (kind, _) = session.handle_mapping(root, handle)?;
    if kind != HandleKind::File {
        return Err(ShflError::InvalidHandle);
    }
    if mode != LockMode::Cancel {
        return Err(ShflError::InvalidParameter);
    }
    debug!("unlock handle: {}, {}..+{}", handle, offset, len);
    Ok(())
}

pub fn handle_set_size(session: &mut ShflSession, root: Root, handle: ShflHandle, size: u64) -> ShflResult<ObjInfo> {
    info!("set size handle: {}, size: {}", handle, size);
    let (_, mapping) = session.handle_mapping(root, handle)?;
    require_writable(&mapping)?;

    session.server.handles().with_file(session.state.id, handle, |info, _| -> ShflResult<ObjInfo> {
        if !info.access.can_write() && !info.append {
            return Err(ShflError::AccessDenied);
        }
        info.file.set_len(size)?;
        Ok(MetadataConverter::to_obj_info(&info.file.metadata()?))
    })?
}

pub fn handle_query_info(session: &mut ShflSession, root: Root, handle: ShflHandle) -> ShflResult<ObjInfo> {
    let (kind, _) = session.handle_mapping(root, handle)?;
    let id = session.state.id;
    let metadata = match kind {
        HandleKind::File => session.server.handles().with_file(id, handle, |info, _| info.file.metadata())?,
        HandleKind::Dir => session.server.handles().with_dir(id, handle, |dir, _| fs::metadata(&dir.path))?,
    }?;
    Ok(MetadataConverter::to_obj_info(&metadata))
}

pub fn handle_set_info(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    update: &SetObjInfo,
) -> ShflResult<ObjInfo> {
    info!("set info handle: {}, {:?}", handle, update);
    let (kind, mapping) = session.handle_mapping(root, handle)?;
    require_writable(&mapping)?;

    let id = session.state.id;
    let metadata = match kind {
        HandleKind::File => session.server.handles().with_file(id, handle, |info, _| -> std::io::Result<fs::Metadata> {
            MetadataConverter::apply(&info.file, &info.path, update)?;
            info.file.metadata()
        })?,
        HandleKind::Dir => session.server.handles().with_dir(id, handle, |dir, _| -> std::io::Result<fs::Metadata> {
            let file = File::open(&dir.path)?;
            MetadataConverter::apply(&file, &dir.path, update)?;
            fs::metadata(&dir.path)
        })?,
    }?;
    Ok(MetadataConverter::to_obj_info(&metadata))
}

#[cfg(unix)]
fn volume_sizes(path: &std::path::Path) -> ShflResult<(u64, u64, u32, u32, bool)> {
    use nix::sys::statvfs::{FsFlags, statvfs};

    let stats = statvfs(path).map_err(std::io::Error::from)?;
    let block = stats.fragment_size() as u64;
    Ok((
        stats.blocks() as u64 * block,
        stats.blocks_available() as u64 * block,
        stats.block_size() as u32,
        stats.name_max() as u32,
        stats.flags().contains(FsFlags::ST_RDONLY),
    ))
}

#[cfg(not(unix))]
fn volume_sizes(_path: &std::path::Path) -> ShflResult<(u64, u64, u32, u32, bool)> {
    Ok((0, 0, 4096, 255, false))
}

#[cfg(unix)]
fn volume_serial(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.dev() as u32
}

#[cfg(not(unix))]
fn volume_serial(_metadata: &fs::Metadata) -> u32 {
    0
}

pub fn handle_query_volume(session: &mut ShflSession, root: Root) -> ShflResult<VolumeInfo> {
    let mapping = session.path_mapping(root)?;
    let metadata = fs::metadata(&mapping.host_path)?;
    let (total_bytes, free_bytes, block_size, max_component_len, host_read_only) = volume_sizes(&mapping.host_path)?;

    Ok(VolumeInfo {
        total_bytes,
        free_bytes,
        block_size,
        serial: volume_serial(&metadata),
        max_component_len,
        read_only: host_read_only || !mapping.writable,
        case_sensitive: mapping.host_case_sensitive,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn handle_copy_file_part(
    session: &mut ShflSession,
    src_root: Root,
    src_handle: ShflHandle,
    src_offset: u64,
    dst_root: Root,
    dst_handle: ShflHandle,
    dst_offset: u64,
    len: u64,
) -> ShflResult<u64> {
    info!(
        "copy part: {}@{} -> {}@{}, {} bytes",
        src_handle, src_offset, dst_handle, dst_offset, len
    );
    let (src_kind, _) = session.handle_mapping(src_root, src_handle)?;
    let (dst_kind, dst_mapping) = session.handle_mapping(dst_root, dst_handle)?;
    if src_kind != HandleKind::File || dst_kind != HandleKind::File {
        return Err(ShflError::InvalidHandle);
    }
    require_writable(&dst_mapping)?;

    let id = session.state.id;
    let handles = session.server.handles();
    handles.with_file(id, dst_handle, |info, _| {
        if info.access.can_write() {
            Ok(())
        } else {
            Err(ShflError::AccessDenied)
        }
    })??;

    let mut copied = 0u64;
    while copied < len {
        let want = (len - copied).min(COPY_CHUNK as u64) as usize;
        let chunk = handles.with_file(id, src_handle, |info, _| read_at(&mut info.file, src_offset + copied, want))??;
        if chunk.is_empty() {
            break;
        }
        handles.with_file(id, dst_handle, |info, _| -> std::io::Result<()> {
            info.file.seek(SeekFrom::Start(dst_offset + copied))?;
            info.file.write_all(&chunk)
        })??;
        copied += chunk.len() as u64;
    }

    debug!("copy part: {} bytes copied", copied);
    Ok(copied)
}
