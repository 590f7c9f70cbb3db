//! Mapping change notification.
//!
//! Every change of the mapping table bumps a version number and publishes it
//! on a broadcast channel. Guests that already know the current version park
//! a [`PendingWait`] until the next change or until they cancel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::error::{ShflError, ShflResult};
use crate::shfl::types::ClientId;

pub const MAX_WAITERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The version differs from the one the guest knew.
    Changed,
    /// State was restored since the guest last asked; it should re-query.
    TryAgain,
    /// The wait ended without an answer of its own.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReply {
    pub version: u32,
    pub status: WaitStatus,
}

#[derive(Debug, Default)]
struct SessionWaits {
    token: CancellationToken,
    cancel_next: bool,
}

#[derive(Debug)]
struct Shared {
    version: AtomicU32,
    waiters: AtomicUsize,
    sessions: Mutex<HashMap<ClientId, SessionWaits>>,
    tx: broadcast::Sender<u32>,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<ClientId, SessionWaits>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    shared: Arc<Shared>,
}

/// Answer to a wait request.
#[derive(Debug)]
pub enum WaitTicket {
    Ready(WaitReply),
    Pending(PendingWait),
}

/// A parked wait. Counts against [`MAX_WAITERS`] until it is dropped.
#[derive(Debug)]
pub struct PendingWait {
    shared: Arc<Shared>,
    rx: broadcast::Receiver<u32>,
    token: CancellationToken,
    client: ClientId,
}

impl PendingWait {
    /// Resolves on the next mapping change or when the session cancels its
    /// waits. The status is always [`WaitStatus::Cancelled`].
    pub async fn wait(mut self) -> WaitReply {
        let version = tokio::select! {
            _ = self.token.cancelled() => {
                debug!("Wait of client {:?} cancelled", self.client);
                self.shared.version.load(Ordering::SeqCst)
            }
            received = self.rx.recv() => match received {
                Ok(version) => version,
                Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => self.shared.version.load(Ordering::SeqCst),
            },
        };
        WaitReply {
            version,
            status: WaitStatus::Cancelled,
        }
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.shared.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                version: AtomicU32::new(1),
                waiters: AtomicUsize::new(0),
                sessions: Mutex::new(HashMap::new()),
                tx,
            }),
        }
    }

    pub fn version(&self) -> u32 {
        self.shared.version.load(Ordering::SeqCst)
    }

    pub fn waiter_count(&self) -> usize {
        self.shared.waiters.load(Ordering::SeqCst)
    }

    /// Receiver for the versions published by [`notify_changed`](Self::notify_changed).
    pub fn subscribe(&self) -> broadcast::Receiver<u32> {
        self.shared.tx.subscribe()
    }

    pub fn begin_wait(&self, client: ClientId, known_version: u32, restored: bool) -> ShflResult<WaitTicket> {
        let mut sessions = self.shared.sessions();
        // Subscribing under the lock orders us against notify_changed.
        let rx = self.shared.tx.subscribe();
        let current = self.shared.version.load(Ordering::SeqCst);

        if known_version != current {
            return Ok(WaitTicket::Ready(WaitReply {
                version: current,
                status: WaitStatus::Changed,
            }));
        }

        let waits = sessions.entry(client).or_default();
        if waits.cancel_next {
            waits.cancel_next = false;
            return Ok(WaitTicket::Ready(WaitReply {
                version: current,
                status: WaitStatus::Cancelled,
            }));
        }

        if restored {
            return Ok(WaitTicket::Ready(WaitReply {
                version: current,
                status: WaitStatus::TryAgain,
            }));
        }

        if self.shared.waiters.load(Ordering::SeqCst) >= MAX_WAITERS {
            warn!("Too many mapping change waiters, rejecting client {:?}", client);
            return Err(ShflError::OutOfResources);
        }
        self.shared.waiters.fetch_add(1, Ordering::SeqCst);

        debug!("Client {:?} waits for mapping changes after version {}", client, current);
        Ok(WaitTicket::Pending(PendingWait {
            shared: self.shared.clone(),
            rx,
            token: waits.token.clone(),
            client,
        }))
    }

    pub fn notify_changed(&self) -> u32 {
        let _sessions = self.shared.sessions();
        let version = self.shared.version.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        // No receivers is not an error here.
        let _ = self.shared.tx.send(version);
        info!("Mappings changed, version {}", version);
        version
    }

    /// Wakes every wait of `client` and makes its next wait return at once.
    pub fn cancel_waits(&self, client: ClientId) {
        let mut sessions = self.shared.sessions();
        let waits = sessions.entry(client).or_default();
        waits.token.cancel();
        waits.token = CancellationToken::new();
        waits.cancel_next = true;
        debug!("Cancelled mapping change waits of client {:?}", client);
    }

    pub fn disconnect(&self, client: ClientId) {
        if let Some(waits) = self.shared.sessions().remove(&client) {
            waits.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const C: ClientId = ClientId(7);

    fn pending(ticket: WaitTicket) -> PendingWait {
        match ticket {
            WaitTicket::Pending(p) => p,
            WaitTicket::Ready(r) => panic!("expected a pending wait, got {:?}", r),
        }
    }

    fn ready(ticket: WaitTicket) -> WaitReply {
        match ticket {
            WaitTicket::Ready(r) => r,
            WaitTicket::Pending(_) => panic!("expected an immediate answer"),
        }
    }

    #[test]
    fn stale_version_answers_immediately() {
        let n = ChangeNotifier::new();
        assert_eq!(n.version(), 1);
        let reply = ready(n.begin_wait(C, 0, false).unwrap());
        assert_eq!(reply, WaitReply { version: 1, status: WaitStatus::Changed });
    }

    #[test]
    fn restored_state_asks_to_try_again() {
        let n = ChangeNotifier::new();
        let reply = ready(n.begin_wait(C, 1, true).unwrap());
        assert_eq!(reply.status, WaitStatus::TryAgain);
    }

    #[tokio::test]
    async fn change_wakes_waiter_with_new_version() {
        let n = ChangeNotifier::new();
        let wait = pending(n.begin_wait(C, 1, false).unwrap());
        assert_eq!(n.waiter_count(), 1);

        let task = tokio::spawn(wait.wait());
        tokio::time::sleep(Duration::from_millis(10)).await;
        n.notify_changed();

        let reply = task.await.unwrap();
        assert_eq!(reply, WaitReply { version: 2, status: WaitStatus::Cancelled });
        assert_eq!(n.waiter_count(), 0);
    }

    #[tokio::test]
    async fn change_between_begin_and_await_is_not_lost() {
        let n = ChangeNotifier::new();
        let wait = pending(n.begin_wait(C, 1, false).unwrap());
        n.notify_changed();
        assert_eq!(wait.wait().await.version, 2);
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_and_sticks_for_next_wait() {
        let n = ChangeNotifier::new();
        let w1 = pending(n.begin_wait(C, 1, false).unwrap());
        let w2 = pending(n.begin_wait(C, 1, false).unwrap());
        let other = pending(n.begin_wait(ClientId(8), 1, false).unwrap());

        n.cancel_waits(C);
        assert_eq!(w1.wait().await, WaitReply { version: 1, status: WaitStatus::Cancelled });
        assert_eq!(w2.wait().await.status, WaitStatus::Cancelled);

        let reply = ready(n.begin_wait(C, 1, false).unwrap());
        assert_eq!(reply.status, WaitStatus::Cancelled);
        let again = pending(n.begin_wait(C, 1, false).unwrap());
        drop(again);

        n.notify_changed();
        assert_eq!(other.wait().await.version, 2);
    }

    #[test]
    fn waiters_are_bounded() {
        let n = ChangeNotifier::new();
        let held: Vec<_> = (0..MAX_WAITERS).map(|i| pending(n.begin_wait(ClientId(i as u32), 1, false).unwrap())).collect();
        assert_eq!(n.begin_wait(C, 1, false).unwrap_err(), ShflError::OutOfResources);
        drop(held);
        assert!(n.begin_wait(C, 1, false).is_ok());
    }
}
