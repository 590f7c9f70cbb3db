use std::path::PathBuf;

use clap::Parser;

use crate::server::DEFAULT_MAX_READ_SIZE;
use crate::shfl::handle_table::MAX_HANDLES;
use crate::shfl::mappings::NewMapping;

/// Command line configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Shared folder, as NAME=PATH[,ro][,auto[=MOUNTPOINT]][,symlinks][,missing]
    #[arg(long = "share", value_name = "SHARE", value_parser = parse_share)]
    pub shares: Vec<NewMapping>,

    /// Guest path to look up after startup, as NAME:PATH
    #[arg(long, value_name = "LOOKUP", value_parser = parse_resolve)]
    pub resolve: Vec<ResolveTarget>,

    /// Map folders for a guest with case-insensitive names
    #[arg(long)]
    pub case_insensitive_guest: bool,

    /// Maximum number of open handles across all guests
    #[arg(long, default_value_t = MAX_HANDLES)]
    pub max_handles: usize,

    /// Maximum number of bytes returned by one read (in bytes)
    #[arg(long, default_value_t = DEFAULT_MAX_READ_SIZE)]
    pub max_read_size: u32,
}

/// A lookup requested with `--resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveTarget {
    pub share: String,
    pub path: String,
}

fn parse_share(value: &str) -> Result<NewMapping, String> {
    let mut parts = value.split(',');
    let head = parts.next().unwrap_or_default();
    let (name, path) = head
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {:?}", head))?;
    if name.is_empty() {
        return Err("share name is empty".to_string());
    }
    if path.is_empty() {
        return Err(format!("share {:?} has no host path", name));
    }

    let mut share = NewMapping::new(name, PathBuf::from(path));
    for option in parts {
        match option.split_once('=') {
            None if option == "ro" => share.writable = false,
            None if option == "rw" => share.writable = true,
            None if option == "auto" => share.auto_mount = true,
            None if option == "symlinks" => share.symlinks = true,
            None if option == "missing" => share.missing = true,
            Some(("auto", mount_point)) => {
                share.auto_mount = true;
                share.auto_mount_point = mount_point.to_string();
            }
            _ => return Err(format!("unknown share option {:?}", option)),
        }
    }

    if !share.missing && !share.host_path.is_dir() {
        return Err(format!("{:?} is not a directory", share.host_path));
    }
    Ok(share)
}

fn parse_resolve(value: &str) -> Result<ResolveTarget, String> {
    let (share, path) = value
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:PATH, got {:?}", value))?;
    Ok(ResolveTarget {
        share: share.to_string(),
        path: path.to_string(),
    })
}
