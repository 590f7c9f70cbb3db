use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use bitflags::bitflags;
use log::{debug, warn};

use crate::error::{ShflError, ShflResult};
use crate::shfl::types::GuestPath;

use super::case_fold::{DirLister, HostDirLister, correct_case, has_wildcard};

bitflags! {
    /// Caller options for [`PathResolver::resolve_path`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveFlags: u32 {
        /// The last component may be a `*`/`?` pattern.
        const WILDCARD          = 0x01;
        /// Never case-correct the last component.
        const PRESERVE_LAST     = 0x02;
        const CHECK_ROOT_ESCAPE = 0x04;
    }

    /// What the resolver learned about the guest path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PathInfoFlags: u32 {
        const WILDCARD_IN_PREFIX = 0x01;
        const WILDCARD_IN_LAST   = 0x02;
        const TRAILING_DELIMITER = 0x04;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    /// Length in bytes of the mapping root prefix of `path`.
    pub root_len: usize,
    pub flags: PathInfoFlags,
}

impl ResolvedPath {
    /// Last component, if the path is below the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.path.as_os_str().len() <= self.root_len {
            return None;
        }
        self.path.file_name().and_then(|n| n.to_str())
    }

    pub fn is_root(&self) -> bool {
        self.path.as_os_str().len() <= self.root_len
    }

    pub fn has_trailing_delimiter(&self) -> bool {
        self.flags.contains(PathInfoFlags::TRAILING_DELIMITER)
    }
}

/// Turns guest paths into host paths below one mapping root.
pub struct PathResolver<'a> {
    root_dir: &'a Path,
    delimiter: char,
    utf8: bool,
    case_correction: bool,
}

impl<'a> PathResolver<'a> {
    pub fn new(root_dir: &'a Path, delimiter: char, utf8: bool) -> Self {
        Self {
            root_dir,
            delimiter,
            utf8,
            case_correction: false,
        }
    }

    /// Enables case correction, used when the host is case sensitive and
    /// the guest is not.
    pub fn with_case_correction(mut self, enabled: bool) -> Self {
        self.case_correction = enabled;
        self
    }

    pub fn resolve_path(&self, path: &GuestPath, flags: ResolveFlags) -> ShflResult<ResolvedPath> {
        self.resolve_path_with(path, flags, &HostDirLister)
    }

    pub fn resolve_path_with(
        &self,
        path: &GuestPath,
        flags: ResolveFlags,
        lister: &dyn DirLister,
    ) -> ShflResult<ResolvedPath> {
        let guest = self.decode(path)?;
        let (components, mut info) = self.split(&guest, flags)?;

        let mut stack: Vec<String> = Vec::with_capacity(components.len());
        let mut escaped = false;
        for component in components {
            match component {
                "." => {}
                ".." => {
                    if stack.pop().is_none() {
                        escaped = true;
                    }
                }
                other => stack.push(other.to_string()),
            }
        }

        if flags.contains(ResolveFlags::CHECK_ROOT_ESCAPE) && escaped {
            warn!("Path escapes the shared folder root: {:?}", guest);
            return Err(ShflError::InvalidName);
        }

        // The wildcard flags describe what survived the collapse.
        info.remove(PathInfoFlags::WILDCARD_IN_PREFIX | PathInfoFlags::WILDCARD_IN_LAST);
        if let Some((last, prefix)) = stack.split_last() {
            if prefix.iter().any(|c| has_wildcard(c)) {
                info.insert(PathInfoFlags::WILDCARD_IN_PREFIX);
            }
            if has_wildcard(last) {
                info.insert(PathInfoFlags::WILDCARD_IN_LAST);
            }
        }

        let mut resolved = self.root_dir.to_path_buf();
        resolved.extend(&stack);

        if self.case_correction && !stack.is_empty() && !lister.exists(&resolved) {
            let skip_last =
                flags.contains(ResolveFlags::PRESERVE_LAST) || info.contains(PathInfoFlags::WILDCARD_IN_LAST);
            let corrected = correct_case(self.root_dir, &stack, skip_last, lister);
            if corrected != stack {
                debug!("Case corrected {:?} to {:?}", stack, corrected);
                resolved = self.root_dir.to_path_buf();
                resolved.extend(&corrected);
            }
        }

        if flags.contains(ResolveFlags::CHECK_ROOT_ESCAPE) && !resolved.starts_with(self.root_dir) {
            warn!("Resolved path {:?} is outside of {:?}", resolved, self.root_dir);
            return Err(ShflError::InvalidName);
        }

        Ok(ResolvedPath {
            path: resolved,
            root_len: self.root_dir.as_os_str().len(),
            flags: info,
        })
    }

    fn decode(&self, path: &GuestPath) -> ShflResult<String> {
        let decoded = match path {
            GuestPath::Utf8(bytes) => {
                if !self.utf8 {
                    return Err(ShflError::InvalidParameter);
                }
                String::from_utf8(bytes.clone()).map_err(|_| ShflError::InvalidName)?
            }
            GuestPath::Utf16(units) => {
                if self.utf8 {
                    return Err(ShflError::InvalidParameter);
                }
                String::from_utf16(units).map_err(|_| ShflError::InvalidName)?
            }
        };
        let decoded = decoded.trim_end_matches('\0').to_string();

        #[cfg(target_os = "macos")]
        let decoded = {
            use unicode_normalization::UnicodeNormalization;
            decoded.nfd().collect::<String>()
        };

        Ok(decoded)
    }

    fn split<'g>(&self, guest: &'g str, flags: ResolveFlags) -> ShflResult<(Vec<&'g str>, PathInfoFlags)> {
        let mut info = PathInfoFlags::empty();
        let trimmed = guest.trim_start_matches(self.delimiter);
        if !trimmed.is_empty() && trimmed.ends_with(self.delimiter) {
            info.insert(PathInfoFlags::TRAILING_DELIMITER);
        }

        let components: Vec<&str> = trimmed.split(self.delimiter).filter(|c| !c.is_empty()).collect();
        let count = components.len();
        for (i, component) in components.iter().enumerate() {
            let last = i + 1 == count;
            self.check_component(component, last, flags)?;
        }

        Ok((components, info))
    }

    fn check_component(&self, component: &str, last: bool, flags: ResolveFlags) -> ShflResult<()> {
        if component.chars().any(|c| c.is_control()) {
            return Err(ShflError::InvalidName);
        }
        if self.delimiter != MAIN_SEPARATOR && component.contains(MAIN_SEPARATOR) {
            return Err(ShflError::InvalidName);
        }
        if has_wildcard(component) && !(last && flags.contains(ResolveFlags::WILDCARD)) && cfg!(windows) {
            return Err(ShflError::InvalidName);
        }
        if cfg!(windows) && component.contains(['<', '>', ':', '"', '|']) {
            return Err(ShflError::InvalidName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::io;

    use proptest::prelude::*;

    use super::*;

    fn resolve(delim: char, guest: &str, flags: ResolveFlags) -> ShflResult<ResolvedPath> {
        PathResolver::new(Path::new("/srv/share"), delim, true).resolve_path(&GuestPath::utf8(guest), flags)
    }

    #[test]
    fn joins_under_root() {
        let r = resolve('/', "/docs/a.txt", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap();
        assert_eq!(r.path, PathBuf::from("/srv/share/docs/a.txt"));
        assert_eq!(r.root_len, "/srv/share".len());
        assert_eq!(r.file_name(), Some("a.txt"));
    }

    #[test]
    fn empty_path_is_root() {
        let r = resolve('\\', "", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap();
        assert_eq!(r.path, PathBuf::from("/srv/share"));
        assert!(r.is_root());
        assert_eq!(r.file_name(), None);
    }

    #[test]
    fn backslash_delimiter_is_translated() {
        let r = resolve('\\', "\\dir\\sub\\f", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap();
        assert_eq!(r.path, PathBuf::from("/srv/share/dir/sub/f"));
    }

    #[cfg(unix)]
    #[test]
    fn host_separator_inside_component_is_rejected() {
        let err = resolve('\\', "\\dir\\a/b", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap_err();
        assert_eq!(err, ShflError::InvalidName);
    }

    #[test]
    fn dot_segments_collapse() {
        let r = resolve('/', "a/./b/../c", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap();
        assert_eq!(r.path, PathBuf::from("/srv/share/a/c"));
    }

    #[test]
    fn escaping_the_root_is_invalid_name() {
        let err = resolve('/', "../etc/passwd", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap_err();
        assert_eq!(err, ShflError::InvalidName);
        let err = resolve('/', "a/../../x", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap_err();
        assert_eq!(err, ShflError::InvalidName);
    }

    #[test]
    fn escape_allowed_without_check() {
        assert!(resolve('/', "../x", ResolveFlags::empty()).is_ok());
    }

    #[test]
    fn control_characters_are_rejected() {
        let err = resolve('/', "a\u{1}b", ResolveFlags::CHECK_ROOT_ESCAPE).unwrap_err();
        assert_eq!(err, ShflError::InvalidName);
    }

    #[test]
    fn encoding_must_match_session() {
        let utf16 = PathResolver::new(Path::new("/r"), '/', true).resolve_path(&GuestPath::utf16("x"), ResolveFlags::empty());
        assert_eq!(utf16.unwrap_err(), ShflError::InvalidParameter);

        let bad = PathResolver::new(Path::new("/r"), '/', true)
            .resolve_path(&GuestPath::Utf8(vec![0x66, 0xff]), ResolveFlags::empty());
        assert_eq!(bad.unwrap_err(), ShflError::InvalidName);

        let lone_surrogate = PathResolver::new(Path::new("/r"), '/', false)
            .resolve_path(&GuestPath::Utf16(vec![0xd800]), ResolveFlags::empty());
        assert_eq!(lone_surrogate.unwrap_err(), ShflError::InvalidName);

        let ok = PathResolver::new(Path::new("/r"), '\\', false)
            .resolve_path(&GuestPath::utf16("\\x\\y"), ResolveFlags::empty())
            .unwrap();
        assert_eq!(ok.path, PathBuf::from("/r/x/y"));
    }

    #[test]
    fn wildcards_and_trailing_delimiter_are_reported() {
        let r = resolve('/', "dir/*.txt", ResolveFlags::WILDCARD).unwrap();
        assert!(r.flags.contains(PathInfoFlags::WILDCARD_IN_LAST));
        assert!(!r.flags.contains(PathInfoFlags::WILDCARD_IN_PREFIX));

        let r = resolve('/', "dir/", ResolveFlags::empty()).unwrap();
        assert!(r.has_trailing_delimiter());
        assert_eq!(r.path, PathBuf::from("/srv/share/dir"));
    }

    struct OneDir(HashMap<PathBuf, Vec<&'static str>>);

    impl DirLister for OneDir {
        fn exists(&self, path: &Path) -> bool {
            self.0.contains_key(path) || self.0.values().flatten().any(|n| path.ends_with(n))
        }

        fn list(&self, dir: &Path) -> io::Result<Vec<OsString>> {
            self.0
                .get(dir)
                .map(|v| v.iter().map(OsString::from).collect())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn case_correction_uses_lister() {
        let mut dirs = HashMap::new();
        dirs.insert(PathBuf::from("/r"), vec!["Data"]);
        dirs.insert(PathBuf::from("/r/Data"), vec!["File.txt"]);
        let lister = OneDir(dirs);

        let resolver = PathResolver::new(Path::new("/r"), '/', true).with_case_correction(true);
        let r = resolver
            .resolve_path_with(&GuestPath::utf8("DATA/file.TXT"), ResolveFlags::CHECK_ROOT_ESCAPE, &lister)
            .unwrap();
        assert_eq!(r.path, PathBuf::from("/r/Data/File.txt"));

        let r = resolver
            .resolve_path_with(
                &GuestPath::utf8("data/new.txt"),
                ResolveFlags::CHECK_ROOT_ESCAPE | ResolveFlags::PRESERVE_LAST,
                &lister,
            )
            .unwrap();
        assert_eq!(r.path, PathBuf::from("/r/Data/new.txt"));
    }

    proptest! {
        #[test]
        fn checked_paths_never_leave_the_root(parts in proptest::collection::vec(
            prop_oneof![Just("..".to_string()), Just(".".to_string()), "[a-z]{1,6}"], 0..12)) {
            let guest = parts.join("/");
            if let Ok(r) = resolve('/', &guest, ResolveFlags::CHECK_ROOT_ESCAPE) {
                prop_assert!(r.path.starts_with("/srv/share"));
            }
        }
    }
}
