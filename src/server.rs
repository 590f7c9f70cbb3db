use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::error::ShflResult;
use crate::shfl::handle_table::{HandleTable, MAX_HANDLES};
use crate::shfl::mappings::{MappingInfo, MappingList, MappingRef, MappingTable, NewMapping, RemoveOutcome};
use crate::shfl::notify::ChangeNotifier;
use crate::shfl::session::ShflSession;
use crate::shfl::types::{ClientId, Root};

/// Largest number of bytes a single read call returns by default.
pub const DEFAULT_MAX_READ_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub shares: Vec<NewMapping>,
    pub max_handles: usize,
    /// Reads asking for more are shortened to this many bytes.
    pub max_read_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shares: Vec::new(),
            max_handles: MAX_HANDLES,
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

/// Activity indicator updated by reads and writes.
#[derive(Debug, Default)]
pub struct StatusLed {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl StatusLed {
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// Shared state of the service, one per host process.
#[derive(Debug)]
pub struct FolderServer {
    mappings: Mutex<MappingTable>,
    handles: HandleTable,
    notifier: ChangeNotifier,
    led: Mutex<Option<Arc<StatusLed>>>,
    next_client: AtomicU32,
    max_read_size: u32,
    pub(crate) loading: AtomicBool,
}

impl Default for FolderServer {
    fn default() -> Self {
        Self::new(MAX_HANDLES)
    }
}

impl FolderServer {
    pub fn new(max_handles: usize) -> Self {
        Self {
            mappings: Mutex::new(MappingTable::new()),
            handles: HandleTable::new(max_handles),
            notifier: ChangeNotifier::new(),
            led: Mutex::new(None),
            next_client: AtomicU32::new(1),
            max_read_size: DEFAULT_MAX_READ_SIZE,
            loading: AtomicBool::new(false),
        }
    }

    /// Builds a server with every configured share added.
    pub fn with_config(config: &ServerConfig) -> ShflResult<Self> {
        let mut server = Self::new(config.max_handles);
        server.max_read_size = config.max_read_size.max(1);
        for share in &config.shares {
            server.add_mapping(share.clone())?;
        }
        Ok(server)
    }

    /// Opens a new guest connection.
    pub fn connect(self: &Arc<Self>) -> ShflSession {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
        info!("Client {:?} connected", id);
        ShflSession::new(self.clone(), id)
    }

    pub(crate) fn mappings(&self) -> MutexGuard<'_, MappingTable> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn add_mapping(&self, new: NewMapping) -> ShflResult<Root> {
        let root = self.mappings().add(new)?;
        self.notifier.notify_changed();
        Ok(root)
    }

    pub fn remove_mapping(&self, name: &str) -> ShflResult<RemoveOutcome> {
        let outcome = self.mappings().remove(name)?;
        if outcome == RemoveOutcome::StillInUse {
            warn!("Shared folder {:?} is still in use, removal deferred", name);
        }
        self.notifier.notify_changed();
        Ok(outcome)
    }

    pub fn lookup(&self, root: Root) -> Option<MappingRef> {
        self.mappings().lookup(root)
    }

    pub fn query_mappings(&self, only_auto_mounts: bool, capacity: usize) -> MappingList {
        self.mappings().query(only_auto_mounts, capacity)
    }

    pub fn query_map_name(&self, root: Root) -> ShflResult<String> {
        self.mappings().name(root)
    }

    pub fn query_map_info(&self, root: Root) -> ShflResult<MappingInfo> {
        self.mappings().info(root)
    }

    pub fn query_writable(&self, root: Root) -> ShflResult<bool> {
        self.mappings().writable(root)
    }

    pub fn query_symlinks_create(&self, root: Root) -> ShflResult<bool> {
        self.mappings().symlinks(root)
    }

    pub fn set_status_led(&self, led: Option<Arc<StatusLed>>) {
        *self.led.lock().unwrap_or_else(PoisonError::into_inner) = led;
    }

    pub(crate) fn led(&self) -> Option<Arc<StatusLed>> {
        self.led.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn max_read_size(&self) -> u32 {
        self.max_read_size
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShflError;

    #[test]
    fn mutations_bump_the_version() {
        let tmp = tempfile::tempdir().unwrap();
        let server = FolderServer::default();
        assert_eq!(server.notifier().version(), 1);

        server.add_mapping(NewMapping::new("a", tmp.path())).unwrap();
        assert_eq!(server.notifier().version(), 2);

        assert_eq!(server.remove_mapping("missing").unwrap_err(), ShflError::FileNotFound);
        assert_eq!(server.notifier().version(), 2);

        assert_eq!(server.remove_mapping("a").unwrap(), RemoveOutcome::Removed);
        assert_eq!(server.notifier().version(), 3);
    }

    #[test]
    fn config_shares_are_added_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            shares: vec![NewMapping::new("one", tmp.path()), NewMapping::new("two", tmp.path())],
            ..Default::default()
        };
        let server = FolderServer::with_config(&config).unwrap();
        assert_eq!(server.query_map_name(Root(1)).unwrap(), "two");
        assert!(server.query_writable(Root(0)).unwrap());
        assert!(!server.query_symlinks_create(Root(0)).unwrap());
        assert_eq!(server.query_map_info(Root(5)).unwrap_err(), ShflError::InvalidParameter);
        assert_eq!(server.max_read_size(), DEFAULT_MAX_READ_SIZE);
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let server = Arc::new(FolderServer::default());
        let a = server.connect();
        let b = server.connect();
        assert_ne!(a.id(), b.id());
    }
}
