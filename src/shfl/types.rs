use std::time::SystemTime;

use bitflags::bitflags;

/// Guest visible identifier of a mapped shared folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Root(pub u32);

impl std::fmt::Display for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "root#{}", self.0)
    }
}

/// Opaque handle of an open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShflHandle(pub u64);

impl ShflHandle {
    /// Never a valid handle.
    pub const NIL: ShflHandle = ShflHandle(u64::MAX);

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

impl std::fmt::Display for ShflHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a guest connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// A path as the guest sent it, before any transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestPath {
    Utf8(Vec<u8>),
    Utf16(Vec<u16>),
}

impl GuestPath {
    pub fn utf8(s: &str) -> Self {
        GuestPath::Utf8(s.as_bytes().to_vec())
    }

    pub fn utf16(s: &str) -> Self {
        GuestPath::Utf16(s.encode_utf16().collect())
    }
}

/// Access the guest asks for when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    None,
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn can_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// What `create` does when the object already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    #[default]
    Open,
    Fail,
    Replace,
    Overwrite,
}

/// What `create` does when the object does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfNew {
    Create,
    #[default]
    Fail,
}

/// Parameters of a create/open/lookup call.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Only report whether the object exists, never open it.
    pub lookup: bool,
    pub directory: bool,
    /// Open the directory that contains the path instead of the path itself.
    pub open_target_directory: bool,
    pub access: Access,
    pub append: bool,
    pub if_exists: IfExists,
    pub if_new: IfNew,
    /// Unix permission bits for newly created objects.
    pub mode: Option<u32>,
    /// Size applied when a file is replaced or overwritten.
    pub initial_size: u64,
}

/// Secondary outcome of `create`, distinct from the call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateResult {
    PathNotFound,
    FileNotFound,
    FileExists,
    FileCreated,
    FileReplaced,
}

#[derive(Debug, Clone)]
pub struct CreateReply {
    pub result: CreateResult,
    pub handle: ShflHandle,
    pub info: Option<ObjInfo>,
}

impl CreateReply {
    pub(crate) fn without_handle(result: CreateResult, info: Option<ObjInfo>) -> Self {
        Self {
            result,
            handle: ShflHandle::NIL,
            info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// File system object information reported back to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjInfo {
    pub kind: ObjKind,
    pub size: u64,
    pub allocated: u64,
    /// Unix mode including the file type bits.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub access_time: Option<SystemTime>,
    pub modification_time: Option<SystemTime>,
    pub change_time: Option<SystemTime>,
    pub birth_time: Option<SystemTime>,
}

/// Fields of [`ObjInfo`] the guest may change through `set_file_info`.
#[derive(Debug, Clone, Default)]
pub struct SetObjInfo {
    pub access_time: Option<SystemTime>,
    pub modification_time: Option<SystemTime>,
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub info: ObjInfo,
}

/// One chunk of a directory listing.
#[derive(Debug, Clone)]
pub struct ListReply {
    pub entries: Vec<DirEntryInfo>,
    pub bytes_used: u32,
    /// No entries are left after this chunk.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u32,
    pub serial: u32,
    pub max_component_len: u32,
    pub read_only: bool,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    Cancel,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const WAIT   = 0x01;
        const ENTIRE = 0x02;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ListFlags: u32 {
        const RESTART    = 0x01;
        const RETURN_ONE = 0x02;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RemoveFlags: u32 {
        const FILE    = 0x01;
        const DIR     = 0x02;
        const SYMLINK = 0x04;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RenameFlags: u32 {
        const FILE               = 0x01;
        const DIR                = 0x02;
        const REPLACE_IF_EXISTS  = 0x04;
    }
}
