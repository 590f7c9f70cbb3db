//! Adjusts host failures to the conventions of the guest's operating system.
//!
//! A POSIX host reports `ENOENT` for both a missing file and a missing parent
//! directory, while Windows guests expect "path not found" for the latter.
//! The adjustments are expressed as a static rule table evaluated in order.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::ShflError;

use super::path_resolver::ResolvedPath;

/// Error conventions a guest expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStyle {
    Windows,
    Linux,
}

impl ErrorStyle {
    /// Conventions of the host operating system.
    pub const NATIVE: ErrorStyle = if cfg!(windows) {
        ErrorStyle::Windows
    } else {
        ErrorStyle::Linux
    };
}

impl Default for ErrorStyle {
    fn default() -> Self {
        Self::NATIVE
    }
}

/// Kind of host operation that produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    OpenFile,
    OpenDir,
    Other,
}

#[derive(Debug, Clone, Copy)]
enum Condition {
    /// The path had a trailing delimiter and its parent is a directory.
    TrailingDelimiterParentExists,
    /// The parent of the path is missing or not a directory.
    ParentNotDirectory,
    /// A directory open hit something that exists but is not a directory.
    DirOpenOnNonDir,
}

struct Rule {
    styles: &'static [ErrorStyle],
    from: &'static [ShflError],
    when: Condition,
    to: ShflError,
}

#[cfg(not(windows))]
static RULES: &[Rule] = &[
    Rule {
        styles: &[ErrorStyle::Windows],
        from: &[ShflError::FileNotFound, ShflError::PathNotFound, ShflError::NotADirectory],
        when: Condition::TrailingDelimiterParentExists,
        to: ShflError::InvalidName,
    },
    Rule {
        styles: &[ErrorStyle::Windows],
        from: &[ShflError::FileNotFound],
        when: Condition::ParentNotDirectory,
        to: ShflError::PathNotFound,
    },
    Rule {
        styles: &[ErrorStyle::Windows, ErrorStyle::Linux],
        from: &[ShflError::PathNotFound, ShflError::FileNotFound],
        when: Condition::DirOpenOnNonDir,
        to: ShflError::NotADirectory,
    },
];

#[cfg(windows)]
static RULES: &[Rule] = &[];

fn parent_is_dir(path: &Path) -> bool {
    path.parent().and_then(|p| fs::metadata(p).ok()).is_some_and(|m| m.is_dir())
}

fn holds(condition: Condition, path: &ResolvedPath, op: HostOp) -> bool {
    match condition {
        Condition::TrailingDelimiterParentExists => path.has_trailing_delimiter() && parent_is_dir(&path.path),
        Condition::ParentNotDirectory => !path.is_root() && !parent_is_dir(&path.path),
        Condition::DirOpenOnNonDir => {
            op == HostOp::OpenDir && fs::metadata(&path.path).is_ok_and(|m| !m.is_dir())
        }
    }
}

/// Rewrites `err` for a client using `style`.
pub fn adjust(style: ErrorStyle, err: ShflError, path: &ResolvedPath, op: HostOp) -> ShflError {
    for rule in RULES {
        if rule.styles.contains(&style) && rule.from.contains(&err) && holds(rule.when, path, op) {
            debug!("Error style {:?}: {:?} -> {:?} for {:?}", style, err, rule.to, path.path);
            return rule.to;
        }
    }
    err
}
