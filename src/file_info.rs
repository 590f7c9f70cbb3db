use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use log::{debug, info};

use crate::shfl::types::{Access, DirEntryInfo};
use crate::shfl::utils::case_fold::wildcard_match;

/// Payload of a file handle.
#[derive(Debug)]
pub struct FileInfo {
    pub file: File,
    pub path: PathBuf,
    /// Access the guest asked for, which may be narrower than the host open.
    pub access: Access,
    pub append: bool,
}

impl FileInfo {
    pub fn open(path: PathBuf, options: &OpenOptions, access: Access, append: bool) -> io::Result<Self> {
        let file = options.open(&path)?;

        info!("Opened file: {:?}, access: {:?}, append: {}", path, access, append);

        Ok(Self::from_file(file, path, access, append))
    }

    pub fn from_file(file: File, path: PathBuf, access: Access, append: bool) -> Self {
        Self {
            file,
            path,
            access,
            append,
        }
    }
}

/// Filtered enumeration started by a listing call that carried a pattern.
#[derive(Debug)]
struct DirSearch {
    dir: PathBuf,
    pattern: Option<String>,
    case_insensitive: bool,
    iter: fs::ReadDir,
}

/// Payload of a directory handle.
#[derive(Debug)]
pub struct DirInfo {
    pub path: PathBuf,
    iter: fs::ReadDir,
    search: Option<DirSearch>,
    /// Entry read from the host that did not fit into the previous reply.
    pub(crate) pending: Option<DirEntryInfo>,
}

impl DirInfo {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let iter = fs::read_dir(&path)?;

        info!("Opened directory: {:?}", path);

        Ok(Self {
            path,
            iter,
            search: None,
            pending: None,
        })
    }

    pub fn has_search(&self) -> bool {
        self.search.is_some()
    }

    /// Switches the handle to a filtered enumeration of `dir`.
    pub fn start_search(&mut self, dir: PathBuf, pattern: Option<String>, case_insensitive: bool) -> io::Result<()> {
        debug!("Starting search in {:?} for {:?}", dir, pattern);

        let iter = fs::read_dir(&dir)?;
        self.search = Some(DirSearch {
            dir,
            pattern,
            case_insensitive,
            iter,
        });
        self.pending = None;
        Ok(())
    }

    /// Restarts the active enumeration from the first entry.
    pub fn rewind(&mut self) -> io::Result<()> {
        match &mut self.search {
            Some(search) => search.iter = fs::read_dir(&search.dir)?,
            None => self.iter = fs::read_dir(&self.path)?,
        }
        self.pending = None;
        Ok(())
    }

    /// Next host entry of the active enumeration, honouring the search pattern.
    pub fn next_entry(&mut self) -> Option<io::Result<fs::DirEntry>> {
        let Some(search) = &mut self.search else {
            return self.iter.next();
        };

        loop {
            let entry = match search.iter.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let Some(pattern) = &search.pattern else {
                return Some(Ok(entry));
            };
            let name = entry.file_name();
            match name.to_str() {
                Some(name) if wildcard_match(pattern, name, search.case_insensitive) => {
                    return Some(Ok(entry));
                }
                _ => continue,
            }
        }
    }
}
