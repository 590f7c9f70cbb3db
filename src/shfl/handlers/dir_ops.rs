use std::io;
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::{ShflError, ShflResult};
use crate::file_info::DirInfo;
use crate::shfl::handle_table::HandleKind;
use crate::shfl::session::ShflSession;
use crate::shfl::types::{DirEntryInfo, GuestPath, ListFlags, ListReply, Root, ShflHandle};
use crate::shfl::utils::metadata::MetadataConverter;
use crate::shfl::utils::path_resolver::{PathInfoFlags, ResolveFlags};

/// Fixed part of a formatted directory entry.
pub const ENTRY_HEADER_SIZE: u32 = 128;

/// Bytes a directory entry occupies in the guest buffer.
pub fn entry_size(name: &str, utf8: bool) -> u32 {
    let name_bytes = if utf8 {
        name.len() + 1
    } else {
        (name.encode_utf16().count() + 1) * 2
    };
    ENTRY_HEADER_SIZE + name_bytes as u32
}

/// Where a listing with a pattern looks, and what it matches.
struct SearchSpec {
    dir: PathBuf,
    pattern: Option<String>,
    case_insensitive: bool,
}

fn search_spec(session: &ShflSession, root: Root, pattern: &GuestPath) -> ShflResult<SearchSpec> {
    let mapping = session.path_mapping(root)?;
    let resolved = session.resolve(
        &mapping,
        pattern,
        ResolveFlags::CHECK_ROOT_ESCAPE | ResolveFlags::WILDCARD,
    )?;
    if resolved.flags.contains(PathInfoFlags::WILDCARD_IN_PREFIX) {
        return Err(ShflError::InvalidName);
    }

    let case_insensitive = !mapping.guest_case_sensitive;
    let Some(name) = resolved.file_name().map(str::to_string) else {
        return Ok(SearchSpec {
            dir: resolved.path,
            pattern: None,
            case_insensitive,
        });
    };
    let dir = resolved.path.parent().map(PathBuf::from).unwrap_or_else(|| resolved.path.clone());
    Ok(SearchSpec {
        dir,
        pattern: Some(name),
        case_insensitive,
    })
}

/// Next entry of the enumeration, with its information.
fn next_host_entry(dir: &mut DirInfo) -> Option<io::Result<DirEntryInfo>> {
    loop {
        let entry = match dir.next_entry()? {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read directory {:?}: {}", dir.path, e);
                return Some(Err(e));
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        match std::fs::symlink_metadata(entry.path()) {
            Ok(metadata) => {
                return Some(Ok(DirEntryInfo {
                    name,
                    info: MetadataConverter::to_obj_info(&metadata),
                }));
            }
            // Vanished between enumeration and stat.
            Err(e) => debug!("Skipping {:?}: {}", name, e),
        }
    }
}

/// Packs entries into one chunk of at most `buffer_size` bytes.
///
/// An entry that does not fit goes back to `pending`. A host error ends the
/// chunk early; it is only reported when nothing was packed yet.
fn fill_chunk(
    pending: &mut Option<DirEntryInfo>,
    mut next: impl FnMut() -> Option<io::Result<DirEntryInfo>>,
    utf8: bool,
    flags: ListFlags,
    buffer_size: u32,
) -> ShflResult<ListReply> {
    let mut entries = Vec::new();
    let mut used = 0u32;
    let mut exhausted = false;
    loop {
        let entry = match pending.take() {
            Some(entry) => entry,
            None => match next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) if entries.is_empty() => return Err(e.into()),
                Some(Err(_)) => break,
                None => {
                    exhausted = true;
                    break;
                }
            },
        };

        let size = entry_size(&entry.name, utf8);
        if used.saturating_add(size) > buffer_size {
            debug!("Entry {:?} does not fit, keeping it for the next call", entry.name);
            *pending = Some(entry);
            if entries.is_empty() {
                return Err(ShflError::BufferOverflow);
            }
            break;
        }

        used += size;
        entries.push(entry);
        if flags.contains(ListFlags::RETURN_ONE) {
            break;
        }
    }

    if entries.is_empty() {
        return Err(ShflError::NoMoreFiles);
    }
    Ok(ListReply {
        entries,
        bytes_used: used,
        complete: exhausted,
    })
}

pub fn handle_list(
    session: &mut ShflSession,
    root: Root,
    handle: ShflHandle,
    pattern: Option<&GuestPath>,
    flags: ListFlags,
    buffer_size: u32,
) -> ShflResult<ListReply> {
    info!("list handle: {}, flags: {:?}, buffer: {}", handle, flags, buffer_size);

    let (kind, _) = session.handle_mapping(root, handle)?;
    if kind != HandleKind::Dir {
        return Err(ShflError::InvalidHandle);
    }

    let search = match pattern {
        Some(pattern) => Some(search_spec(session, root, pattern)?),
        None => None,
    };
    let utf8 = session.state.utf8;

    session
        .server
        .handles()
        .with_dir(session.state.id, handle, |dir, _| -> ShflResult<ListReply> {
            match search {
                Some(spec) if !dir.has_search() || flags.contains(ListFlags::RESTART) => {
                    dir.start_search(spec.dir, spec.pattern, spec.case_insensitive)?;
                }
                _ if flags.contains(ListFlags::RESTART) => dir.rewind()?,
                _ => {}
            }

            let mut pending = dir.pending.take();
            let reply = fill_chunk(&mut pending, || next_host_entry(dir), utf8, flags, buffer_size);
            dir.pending = pending;
            if let Ok(reply) = &reply {
                debug!("Listed {} entries ({} bytes) from {:?}", reply.entries.len(), reply.bytes_used, dir.path);
            }
            reply
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> DirEntryInfo {
        let tmp = std::env::temp_dir();
        DirEntryInfo {
            name: name.to_string(),
            info: MetadataConverter::query_path(&tmp).unwrap(),
        }
    }

    #[test]
    fn host_errors_are_not_end_of_listing() {
        let mut pending = None;
        let err = fill_chunk(
            &mut pending,
            || Some(Err(io::Error::from(io::ErrorKind::PermissionDenied))),
            true,
            ListFlags::empty(),
            4096,
        )
        .unwrap_err();
        assert_eq!(err, ShflError::AccessDenied);

        let mut source = vec![
            Some(Err(io::Error::from(io::ErrorKind::PermissionDenied))),
            Some(Ok(named("a"))),
        ];
        let reply = fill_chunk(&mut pending, || source.pop().flatten(), true, ListFlags::empty(), 4096).unwrap();
        assert_eq!(reply.entries.len(), 1);
        assert!(!reply.complete);
    }

    #[test]
    fn entries_that_do_not_fit_are_kept() {
        let mut pending = None;
        let mut source = vec![named("second"), named("first")];
        let one = entry_size("first", true);

        let err = fill_chunk(&mut pending, || source.pop().map(Ok), true, ListFlags::empty(), one - 1).unwrap_err();
        assert_eq!(err, ShflError::BufferOverflow);
        assert_eq!(pending.as_ref().map(|e| e.name.as_str()), Some("first"));

        let reply = fill_chunk(&mut pending, || source.pop().map(Ok), true, ListFlags::empty(), one).unwrap();
        assert_eq!(reply.entries[0].name, "first");
        assert_eq!(reply.bytes_used, one);
        assert!(!reply.complete);

        let reply = fill_chunk(&mut pending, || source.pop().map(Ok), true, ListFlags::empty(), 4096).unwrap();
        assert_eq!(reply.entries[0].name, "second");
        assert!(reply.complete);
        assert_eq!(
            fill_chunk(&mut pending, || source.pop().map(Ok), true, ListFlags::empty(), 4096).unwrap_err(),
            ShflError::NoMoreFiles
        );
    }

    #[test]
    fn entry_sizes() {
        assert_eq!(entry_size("abc", true), 128 + 4);
        assert_eq!(entry_size("abc", false), 128 + 8);
        assert_eq!(entry_size("é", true), 128 + 3);
        assert_eq!(entry_size("é", false), 128 + 4);
    }
}
