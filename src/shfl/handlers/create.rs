use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::{ShflError, ShflResult};
use crate::file_info::{DirInfo, FileInfo};
use crate::shfl::handle_table::HandleEntry;
use crate::shfl::session::{ShflSession, require_writable};
use crate::shfl::types::{Access, CreateReply, CreateRequest, CreateResult, GuestPath, IfExists, IfNew, Root};
use crate::shfl::utils::error_style::HostOp;
use crate::shfl::utils::metadata::MetadataConverter;
use crate::shfl::utils::path_resolver::{ResolveFlags, ResolvedPath};

fn parent_is_dir(path: &Path) -> bool {
    path.parent().and_then(|p| fs::metadata(p).ok()).is_some_and(|m| m.is_dir())
}

/// Result for an object that is not there.
fn not_found(path: &Path) -> CreateReply {
    let result = if parent_is_dir(path) {
        CreateResult::FileNotFound
    } else {
        CreateResult::PathNotFound
    };
    CreateReply::without_handle(result, None)
}

/// Turns an ordinary host outcome into a reply, anything else into an error.
fn outcome_or_error(session: &ShflSession, e: io::Error, resolved: &ResolvedPath, op: HostOp) -> ShflResult<CreateReply> {
    match session.host_error(e, resolved, op) {
        ShflError::FileNotFound => Ok(not_found(&resolved.path)),
        ShflError::PathNotFound => Ok(CreateReply::without_handle(CreateResult::PathNotFound, None)),
        ShflError::AlreadyExists => Ok(CreateReply::without_handle(CreateResult::FileExists, None)),
        other => Err(other),
    }
}

pub fn handle_create(
    session: &mut ShflSession,
    root: Root,
    path: &GuestPath,
    request: &CreateRequest,
) -> ShflResult<CreateReply> {
    let mapping = session.path_mapping(root)?;
    let mut request = request.clone();

    let mut flags = ResolveFlags::CHECK_ROOT_ESCAPE;
    if request.open_target_directory {
        flags |= ResolveFlags::PRESERVE_LAST;
    }
    let mut resolved = session.resolve(&mapping, path, flags)?;

    if request.open_target_directory {
        if !resolved.is_root() {
            resolved.path.pop();
        }
        request.directory = true;
        request.if_exists = IfExists::Open;
        request.if_new = IfNew::Fail;
    }

    info!("create: {:?} {:?}", resolved.path, request);

    if request.lookup {
        return match fs::symlink_metadata(&resolved.path) {
            Ok(metadata) => Ok(CreateReply::without_handle(
                CreateResult::FileExists,
                Some(MetadataConverter::to_obj_info(&metadata)),
            )),
            Err(e) => outcome_or_error(session, e, &resolved, HostOp::Other),
        };
    }

    let existing = fs::metadata(&resolved.path).ok();
    if existing.as_ref().is_some_and(|m| m.is_dir()) {
        request.directory = true;
    }

    let exists = existing.is_some();
    let modifies = if exists {
        matches!(request.if_exists, IfExists::Replace | IfExists::Overwrite)
    } else {
        request.if_new == IfNew::Create
    };
    let opens_for_write = !request.directory
        && (request.access.can_write() || request.append)
        && !(exists && request.if_exists == IfExists::Fail)
        && (exists || request.if_new == IfNew::Create);
    if modifies || opens_for_write {
        require_writable(&mapping)?;
    }

    if request.directory {
        create_dir(session, root, &resolved, &request, existing)
    } else {
        open_file(session, root, &resolved, &request, existing)
    }
}

fn open_file(
    session: &mut ShflSession,
    root: Root,
    resolved: &ResolvedPath,
    request: &CreateRequest,
    existing: Option<fs::Metadata>,
) -> ShflResult<CreateReply> {
    let path = &resolved.path;
    let mut options = OpenOptions::new();
    options.read(request.access != Access::Write);
    if request.access.can_write() || request.append {
        options.write(true);
    }

    let result = match (&existing, request.if_exists, request.if_new) {
        (Some(metadata), IfExists::Fail, _) => {
            debug!("create: {:?} exists and the guest asked to fail", path);
            return Ok(CreateReply::without_handle(
                CreateResult::FileExists,
                Some(MetadataConverter::to_obj_info(metadata)),
            ));
        }
        (Some(_), IfExists::Open, _) => CreateResult::FileExists,
        (Some(_), IfExists::Replace | IfExists::Overwrite, _) => {
            options.write(true).truncate(true);
            CreateResult::FileReplaced
        }
        (None, _, IfNew::Fail) => return Ok(not_found(path)),
        (None, _, IfNew::Create) => {
            options.write(true).create_new(true);
            #[cfg(unix)]
            if let Some(mode) = request.mode {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(mode & 0o7777);
            }
            CreateResult::FileCreated
        }
    };

    let info = match FileInfo::open(path.clone(), &options, request.access, request.append) {
        Ok(info) => info,
        Err(e) => {
            warn!("Failed to open {:?}: {}", path, e);
            return outcome_or_error(session, e, resolved, HostOp::OpenFile);
        }
    };

    if matches!(result, CreateResult::FileReplaced | CreateResult::FileCreated) && request.initial_size > 0 {
        info.file.set_len(request.initial_size)?;
    }

    let obj = MetadataConverter::to_obj_info(&info.file.metadata()?);
    let handle = session
        .server
        .handles()
        .alloc(session.state.id, root, HandleEntry::File(info))
        .ok_or(ShflError::OutOfResources)?;

    info!("create: {:?} -> {:?}, handle {}", path, result, handle);
    Ok(CreateReply {
        result,
        handle,
        info: Some(obj),
    })
}

fn create_dir(
    session: &mut ShflSession,
    root: Root,
    resolved: &ResolvedPath,
    request: &CreateRequest,
    existing: Option<fs::Metadata>,
) -> ShflResult<CreateReply> {
    let path = &resolved.path;

    let result = match &existing {
        Some(metadata) if !metadata.is_dir() => {
            return Err(session.host_error(io::Error::from(io::ErrorKind::NotADirectory), resolved, HostOp::OpenDir));
        }
        Some(metadata) if request.if_exists == IfExists::Fail => {
            return Ok(CreateReply::without_handle(
                CreateResult::FileExists,
                Some(MetadataConverter::to_obj_info(metadata)),
            ));
        }
        Some(_) => CreateResult::FileExists,
        None if request.if_new == IfNew::Fail => return Ok(not_found(path)),
        None => {
            let mut builder = fs::DirBuilder::new();
            #[cfg(unix)]
            if let Some(mode) = request.mode {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(mode & 0o7777);
            }
            if let Err(e) = builder.create(path) {
                warn!("Failed to create directory {:?}: {}", path, e);
                return outcome_or_error(session, e, resolved, HostOp::OpenDir);
            }
            CreateResult::FileCreated
        }
    };

    let dir = match DirInfo::open(path.clone()) {
        Ok(dir) => dir,
        Err(e) => return outcome_or_error(session, e, resolved, HostOp::OpenDir),
    };
    let obj = MetadataConverter::to_obj_info(&fs::metadata(path)?);
    let handle = session
        .server
        .handles()
        .alloc(session.state.id, root, HandleEntry::Dir(dir))
        .ok_or(ShflError::OutOfResources)?;

    info!("create: directory {:?} -> {:?}, handle {}", path, result, handle);
    Ok(CreateReply {
        result,
        handle,
        info: Some(obj),
    })
}
