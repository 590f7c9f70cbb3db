use std::fs::{self, File, FileTimes};
use std::io;
use std::path::Path;

use crate::shfl::types::{ObjInfo, ObjKind, SetObjInfo};

pub struct MetadataConverter;

impl MetadataConverter {
    pub fn to_obj_info(metadata: &fs::Metadata) -> ObjInfo {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            ObjKind::Symlink
        } else if file_type.is_dir() {
            ObjKind::Directory
        } else if file_type.is_file() {
            ObjKind::File
        } else {
            ObjKind::Other
        };

        #[cfg(unix)]
        let (mode, nlink, uid, gid, allocated, change_time) = {
            use std::os::unix::fs::MetadataExt;
            let ctime = std::time::UNIX_EPOCH
                .checked_add(std::time::Duration::new(
                    metadata.ctime().max(0) as u64,
                    metadata.ctime_nsec().clamp(0, 999_999_999) as u32,
                ));
            (
                metadata.mode(),
                metadata.nlink(),
                metadata.uid(),
                metadata.gid(),
                metadata.blocks() * 512,
                ctime,
            )
        };

        #[cfg(not(unix))]
        let (mode, nlink, uid, gid, allocated, change_time) = {
            let mut mode = match kind {
                ObjKind::Directory => 0o040755,
                ObjKind::Symlink => 0o120777,
                _ => 0o100644,
            };
            if metadata.permissions().readonly() {
                mode &= !0o222;
            }
            (mode, 1, 0, 0, metadata.len(), metadata.modified().ok())
        };

        ObjInfo {
            kind,
            size: metadata.len(),
            allocated,
            mode,
            nlink,
            uid,
            gid,
            access_time: metadata.accessed().ok(),
            modification_time: metadata.modified().ok(),
            change_time,
            birth_time: metadata.created().ok(),
        }
    }

    /// Information about `path` without following a final symlink.
    pub fn query_path(path: &Path) -> io::Result<ObjInfo> {
        fs::symlink_metadata(path).map(|m| Self::to_obj_info(&m))
    }

    /// Applies the settable fields of `info` to an open file.
    pub fn apply(file: &File, path: &Path, info: &SetObjInfo) -> io::Result<()> {
        if info.access_time.is_some() || info.modification_time.is_some() {
            let mut times = FileTimes::new();
            if let Some(t) = info.access_time {
                times = times.set_accessed(t);
            }
            if let Some(t) = info.modification_time {
                times = times.set_modified(t);
            }
            file.set_times(times)?;
        }

        if let Some(mode) = info.mode {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
            #[cfg(not(unix))]
            {
                let mut perms = fs::metadata(path)?.permissions();
                perms.set_readonly(mode & 0o222 == 0);
                fs::set_permissions(path, perms)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn regular_file_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        fs::write(&path, vec![7u8; 1000]).unwrap();

        let info = MetadataConverter::query_path(&path).unwrap();
        assert_eq!(info.kind, ObjKind::File);
        assert_eq!(info.size, 1000);
        assert!(info.modification_time.is_some());

        let info = MetadataConverter::query_path(dir.path()).unwrap();
        assert_eq!(info.kind, ObjKind::Directory);
    }

    #[test]
    fn apply_sets_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        fs::write(&path, b"x").unwrap();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();

        let when = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let update = SetObjInfo {
            modification_time: Some(when),
            ..Default::default()
        };
        MetadataConverter::apply(&file, &path, &update).unwrap();

        let info = MetadataConverter::query_path(&path).unwrap();
        assert_eq!(info.modification_time, Some(when));
    }
}
