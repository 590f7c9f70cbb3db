//! Case-insensitive name handling on top of case-sensitive hosts.
//!
//! The correction walk only needs two capabilities of the host file system,
//! existence checks and directory enumeration, so it is written against the
//! [`DirLister`] trait and can be exercised without touching the disk.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// Host capabilities needed by [`correct_case`].
pub trait DirLister {
    fn exists(&self, path: &Path) -> bool;
    fn list(&self, dir: &Path) -> io::Result<Vec<OsString>>;
}

/// [`DirLister`] backed by the real host file system.
pub struct HostDirLister;

impl DirLister for HostDirLister {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<OsString>> {
        fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect()
    }
}

pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

pub fn has_wildcard(component: &str) -> bool {
    component.contains(['*', '?'])
}

fn join(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(components);
    path
}

/// Rewrites the missing components of `root/components...` to the spelling
/// found on the host.
///
/// The longest existing prefix is located by binary search; every following
/// component is replaced by the first directory entry that matches it
/// case-insensitively (an exact match wins). The walk stops at the first
/// component with no match and keeps whatever was corrected up to there.
/// With `skip_last` the final component is left alone.
pub fn correct_case(root: &Path, components: &[String], skip_last: bool, lister: &dyn DirLister) -> Vec<String> {
    let mut corrected = components.to_vec();
    let n = corrected.len();
    if n == 0 {
        return corrected;
    }

    // Existence of prefixes is monotonic, so bisect for the deepest one.
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if lister.exists(&join(root, &corrected[..mid])) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let end = if skip_last { n - 1 } else { n };
    for i in lo..end {
        let dir = join(root, &corrected[..i]);
        let names = match lister.list(&dir) {
            Ok(names) => names,
            Err(e) => {
                debug!("case correction: cannot list {:?}: {}", dir, e);
                break;
            }
        };

        let wanted = &corrected[i];
        let mut found = None;
        for name in names.iter().filter_map(|n| n.to_str()) {
            if name == wanted {
                found = Some(name.to_string());
                break;
            }
            if found.is_none() && eq_ignore_case(name, wanted) {
                found = Some(name.to_string());
            }
        }

        match found {
            Some(name) => corrected[i] = name,
            None => {
                debug!("case correction: no match for {:?} in {:?}", wanted, dir);
                break;
            }
        }
    }

    corrected
}

/// Matches `name` against a `*`/`?` pattern.
pub fn wildcard_match(pattern: &str, name: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let p = fold(pattern);
    let s = fold(name);

    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((sp, ss)) = star {
            pi = sp + 1;
            si = ss + 1;
            star = Some((sp, ss + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

fn swap_case(s: &str) -> String {
    s.chars()
        .flat_map(|c| {
            if c.is_lowercase() {
                c.to_uppercase().collect::<Vec<_>>()
            } else {
                c.to_lowercase().collect::<Vec<_>>()
            }
        })
        .collect()
}

#[cfg(unix)]
pub(crate) fn same_object(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
pub(crate) fn same_object(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

/// Whether the file system holding `folder` distinguishes names by case.
///
/// Looks up a case-swapped spelling of an existing name and compares the
/// objects. Falls back to the platform default when there is nothing to look at.
pub fn host_is_case_sensitive(folder: &Path) -> bool {
    let default = cfg!(not(any(windows, target_os = "macos")));

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(folder) {
        candidates.extend(entries.flatten().map(|e| e.path()).take(16));
    }
    candidates.push(folder.to_path_buf());

    for path in candidates {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let swapped = swap_case(name);
        if swapped == name {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        return match fs::symlink_metadata(path.with_file_name(&swapped)) {
            Ok(other) => !same_object(&meta, &other),
            Err(_) => true,
        };
    }

    default
}
