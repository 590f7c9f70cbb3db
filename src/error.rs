//! Status codes returned by the shared folders service.

use std::io;

/// Failure status of a shared folders call.
///
/// Ordinary outcomes of `create` (file not found, file exists) are not
/// reported through this type; they travel in [`crate::shfl::CreateResult`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShflError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid name")]
    InvalidName,
    #[error("share is write protected")]
    WriteProtect,
    #[error("access denied")]
    AccessDenied,
    #[error("file not found")]
    FileNotFound,
    #[error("path not found")]
    PathNotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("no more files")]
    NoMoreFiles,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("too much data")]
    TooMuchData,
    #[error("out of resources")]
    OutOfResources,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("incompatible configuration")]
    IncompatibleConfig,
    #[error("not implemented")]
    NotImplemented,
    #[error("host I/O error: {0:?}")]
    Io(io::ErrorKind),
}

pub type ShflResult<T> = Result<T, ShflError>;

impl From<io::Error> for ShflError {
    fn from(e: io::Error) -> Self {
        // ENOTDIR means some prefix of the path is not a directory.
        #[cfg(unix)]
        if e.raw_os_error() == Some(libc::ENOTDIR) {
            return ShflError::PathNotFound;
        }
        #[cfg(unix)]
        if e.raw_os_error() == Some(libc::EMFILE) || e.raw_os_error() == Some(libc::ENFILE) {
            return ShflError::TooManyOpenFiles;
        }

        match e.kind() {
            io::ErrorKind::NotFound => ShflError::FileNotFound,
            io::ErrorKind::PermissionDenied => ShflError::AccessDenied,
            io::ErrorKind::AlreadyExists => ShflError::AlreadyExists,
            io::ErrorKind::NotADirectory => ShflError::PathNotFound,
            io::ErrorKind::IsADirectory => ShflError::IsADirectory,
            io::ErrorKind::DirectoryNotEmpty => ShflError::DirNotEmpty,
            io::ErrorKind::ReadOnlyFilesystem => ShflError::WriteProtect,
            io::ErrorKind::InvalidInput => ShflError::InvalidParameter,
            io::ErrorKind::OutOfMemory => ShflError::OutOfResources,
            kind => ShflError::Io(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_status() {
        let e = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(ShflError::from(e), ShflError::FileNotFound);

        let e = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(ShflError::from(e), ShflError::AccessDenied);

        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(ShflError::from(e), ShflError::Io(io::ErrorKind::TimedOut));
    }

    #[cfg(unix)]
    #[test]
    fn enotdir_is_path_not_found() {
        let e = io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(ShflError::from(e), ShflError::PathNotFound);
    }
}
