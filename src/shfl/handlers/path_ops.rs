use std::fs::{self, OpenOptions};
use std::io;

use log::{info, warn};

use crate::error::{ShflError, ShflResult};
use crate::shfl::session::{ShflSession, require_writable};
use crate::shfl::types::{GuestPath, ObjInfo, RemoveFlags, RenameFlags, Root, ShflHandle};
use crate::shfl::utils::case_fold::same_object;
use crate::shfl::utils::error_style::HostOp;
use crate::shfl::utils::metadata::MetadataConverter;
use crate::shfl::utils::path_resolver::ResolveFlags;

use super::file_ops::handle_close;

pub fn handle_remove(
    session: &mut ShflSession,
    root: Root,
    path: &GuestPath,
    flags: RemoveFlags,
    handle_to_close: Option<ShflHandle>,
) -> ShflResult<()> {
    // The handle goes away whatever happens to the removal.
    if let Some(handle) = handle_to_close {
        handle_close(session, root, handle)?;
    }

    let mapping = session.path_mapping(root)?;
    require_writable(&mapping)?;
    let resolved = session.resolve(&mapping, path, ResolveFlags::CHECK_ROOT_ESCAPE)?;

    info!("remove: {:?} {:?}", resolved.path, flags);
    if resolved.is_root() {
        warn!("Refusing to remove the root of {}", root);
        return Err(ShflError::AccessDenied);
    }

    let metadata = fs::symlink_metadata(&resolved.path).map_err(|e| session.host_error(e, &resolved, HostOp::Other))?;
    let outcome = if metadata.file_type().is_symlink() && flags.contains(RemoveFlags::SYMLINK) {
        fs::remove_file(&resolved.path)
    } else if metadata.is_dir() {
        if !flags.contains(RemoveFlags::DIR) {
            return Err(ShflError::IsADirectory);
        }
        fs::remove_dir(&resolved.path)
    } else {
        if !flags.contains(RemoveFlags::FILE) {
            return Err(ShflError::NotADirectory);
        }
        fs::remove_file(&resolved.path)
    };

    outcome.map_err(|e| {
        warn!("Failed to remove {:?}: {}", resolved.path, e);
        session.host_error(e, &resolved, HostOp::Other)
    })
}

pub fn handle_rename(
    session: &mut ShflSession,
    root: Root,
    src: &GuestPath,
    dst: &GuestPath,
    flags: RenameFlags,
) -> ShflResult<()> {
    let mapping = session.path_mapping(root)?;
    require_writable(&mapping)?;
    let from = session.resolve(&mapping, src, ResolveFlags::CHECK_ROOT_ESCAPE)?;
    let to = session.resolve(
        &mapping,
        dst,
        ResolveFlags::CHECK_ROOT_ESCAPE | ResolveFlags::PRESERVE_LAST,
    )?;

    info!("rename: {:?} -> {:?} {:?}", from.path, to.path, flags);
    if from.is_root() || to.is_root() {
        return Err(ShflError::AccessDenied);
    }

    let source = fs::symlink_metadata(&from.path).map_err(|e| session.host_error(e, &from, HostOp::Other))?;
    if source.is_dir() && !flags.contains(RenameFlags::DIR) {
        return Err(ShflError::IsADirectory);
    }
    if !source.is_dir() && !flags.contains(RenameFlags::FILE) {
        return Err(ShflError::NotADirectory);
    }

    if let Ok(target) = fs::symlink_metadata(&to.path) {
        // Renaming a name onto another spelling of itself.
        let same = same_object(&source, &target);
        if !same && !flags.contains(RenameFlags::REPLACE_IF_EXISTS) {
            return Err(ShflError::AlreadyExists);
        }
    }

    fs::rename(&from.path, &to.path).map_err(|e| {
        warn!("Failed to rename {:?}: {}", from.path, e);
        session.host_error(e, &to, HostOp::Other)
    })
}

pub fn handle_copy_file(
    session: &mut ShflSession,
    src_root: Root,
    src: &GuestPath,
    dst_root: Root,
    dst: &GuestPath,
    flags: u32,
) -> ShflResult<()> {
    if flags != 0 {
        return Err(ShflError::InvalidParameter);
    }
    let src_mapping = session.path_mapping(src_root)?;
    let dst_mapping = session.path_mapping(dst_root)?;
    require_writable(&dst_mapping)?;

    let from = session.resolve(&src_mapping, src, ResolveFlags::CHECK_ROOT_ESCAPE)?;
    let to = session.resolve(
        &dst_mapping,
        dst,
        ResolveFlags::CHECK_ROOT_ESCAPE | ResolveFlags::PRESERVE_LAST,
    )?;
    info!("copy: {:?} -> {:?}", from.path, to.path);

    let metadata = fs::metadata(&from.path).map_err(|e| session.host_error(e, &from, HostOp::Other))?;
    if metadata.is_dir() {
        return Err(ShflError::IsADirectory);
    }

    let mut reader = fs::File::open(&from.path).map_err(|e| session.host_error(e, &from, HostOp::OpenFile))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&to.path)
        .map_err(|e| session.host_error(e, &to, HostOp::OpenFile))?;

    if let Err(e) = io::copy(&mut reader, &mut writer) {
        warn!("Copy to {:?} failed, removing partial file: {}", to.path, e);
        drop(writer);
        let _ = fs::remove_file(&to.path);
        return Err(e.into());
    }
    writer.set_permissions(metadata.permissions())?;
    Ok(())
}

pub fn handle_read_link(session: &mut ShflSession, root: Root, path: &GuestPath) -> ShflResult<GuestPath> {
    let mapping = session.path_mapping(root)?;
    let resolved = session.resolve(&mapping, path, ResolveFlags::CHECK_ROOT_ESCAPE)?;

    let target = fs::read_link(&resolved.path).map_err(|e| session.host_error(e, &resolved, HostOp::Other))?;
    let target = target.to_str().ok_or(ShflError::InvalidName)?;
    info!("readlink: {:?} -> {:?}", resolved.path, target);

    Ok(if session.state.utf8 {
        GuestPath::utf8(target)
    } else {
        GuestPath::utf16(target)
    })
}

pub fn handle_symlink(
    session: &mut ShflSession,
    root: Root,
    new_path: &GuestPath,
    target: &GuestPath,
) -> ShflResult<ObjInfo> {
    if !session.state.utf8 {
        return Err(ShflError::NotImplemented);
    }
    let mapping = session.path_mapping(root)?;
    require_writable(&mapping)?;
    if !mapping.symlinks {
        warn!("Symlink creation is disabled on {}", root);
        return Err(ShflError::WriteProtect);
    }

    let link = session.resolve(
        &mapping,
        new_path,
        ResolveFlags::CHECK_ROOT_ESCAPE | ResolveFlags::PRESERVE_LAST,
    )?;
    // Validated like any guest path, but stored as the guest wrote it.
    session.resolve(&mapping, target, ResolveFlags::empty())?;
    let GuestPath::Utf8(raw) = target else {
        return Err(ShflError::InvalidParameter);
    };
    let target = std::str::from_utf8(raw).map_err(|_| ShflError::InvalidName)?;
    let target = target.trim_end_matches('\0');

    info!("symlink: {:?} -> {:?}", link.path, target);
    create_symlink(target, &link.path).map_err(|e| session.host_error(e, &link, HostOp::Other))?;
    Ok(MetadataConverter::query_path(&link.path)?)
}

#[cfg(unix)]
fn create_symlink(target: &str, link: &std::path::Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn create_symlink(_target: &str, _link: &std::path::Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
