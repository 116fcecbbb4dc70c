//! Hub-side map of live links, keyed by peer server id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Why a frame could not be queued on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSendError {
    /// The link's write buffer is full; the frame was dropped.
    Full,
    /// The link is closed.
    Closed,
}

struct LinkInner {
    id: u64,
    peer_addr: SocketAddr,
    peer_id: OnceLock<String>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Cheap, clonable handle to one hub-side connection.
///
/// Two handles are equal only if they refer to the same connection.
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<LinkInner>,
}

impl LinkHandle {
    /// Creates a handle and the receiver its connection task drains.
    pub fn new(peer_addr: SocketAddr, buffer: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            inner: Arc::new(LinkInner {
                id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                peer_id: OnceLock::new(),
                outbound: tx,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Server id this link was registered under, if any.
    pub fn peer_id(&self) -> Option<&str> {
        self.inner.peer_id.get().map(String::as_str)
    }

    /// Queues an encoded frame body without waiting.
    pub fn send_frame(&self, body: Vec<u8>) -> Result<(), LinkSendError> {
        if self.is_closed() {
            return Err(LinkSendError::Closed);
        }
        self.inner.outbound.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkSendError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkSendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        !self.is_closed() && !self.inner.outbound.is_closed()
    }

    /// Asks the owning connection task to close. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing link #{} ({})", self.inner.id, self.inner.peer_addr);
            self.inner.close_notify.notify_one();
        }
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.close_notify.notified().await;
    }

    pub fn same(&self, other: &LinkHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for LinkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for LinkHandle {}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("peer_id", &self.peer_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Thread-safe `serverId -> LinkHandle` map with last-writer-wins semantics.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    links: DashMap<String, LinkHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `peer_id`, closing any different handle that
    /// held the id. Returns the previous handle.
    pub fn register(&self, peer_id: &str, handle: LinkHandle) -> Option<LinkHandle> {
        let _ = handle.inner.peer_id.set(peer_id.to_string());
        let previous = self.links.insert(peer_id.to_string(), handle.clone());
        if let Some(previous) = &previous {
            if !previous.same(&handle) {
                info!(
                    "Replacing link #{} for '{}' with link #{}",
                    previous.id(),
                    peer_id,
                    handle.id()
                );
                previous.close();
            }
        }
        previous
    }

    pub fn find(&self, peer_id: &str) -> Option<LinkHandle> {
        self.links.get(peer_id).map(|entry| entry.value().clone())
    }

    /// True if `handle` is the link currently registered for `peer_id`.
    pub fn is_current(&self, peer_id: &str, handle: &LinkHandle) -> bool {
        self.links
            .get(peer_id)
            .map(|entry| entry.value().same(handle))
            .unwrap_or(false)
    }

    /// Removes `handle` only if it is still the registered link for its id.
    pub fn remove(&self, handle: &LinkHandle) -> bool {
        match handle.peer_id() {
            Some(peer_id) => self
                .links
                .remove_if(peer_id, |_, current| current.same(handle))
                .is_some(),
            None => false,
        }
    }

    /// Closes and removes every link.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.links.remove(&id) {
                handle.close();
            }
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (LinkHandle, mpsc::Receiver<Vec<u8>>) {
        LinkHandle::new("127.0.0.1:9000".parse().unwrap(), 4)
    }

    #[test]
    fn test_register_replaces_and_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        assert!(registry.register("paper-1", h1.clone()).is_none());
        let previous = registry.register("paper-1", h2.clone()).unwrap();

        assert_eq!(previous, h1);
        assert!(h1.is_closed());
        assert!(!h2.is_closed());
        assert_eq!(registry.find("paper-1"), Some(h2));
    }

    #[test]
    fn test_reregistering_same_handle_keeps_it_open() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx) = handle();
        registry.register("paper-1", h1.clone());
        registry.register("paper-1", h1.clone());
        assert!(!h1.is_closed());
    }

    #[test]
    fn test_remove_only_current_handle() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        registry.register("paper-1", h1.clone());
        registry.register("paper-1", h2.clone());

        assert!(!registry.remove(&h1));
        assert!(registry.is_current("paper-1", &h2));
        assert!(registry.remove(&h2));
        assert!(registry.find("paper-1").is_none());
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        registry.register("paper-1", h1.clone());
        registry.register("paper-2", h2.clone());
        assert_eq!(registry.peer_ids(), vec!["paper-1", "paper-2"]);

        registry.close_all();
        assert!(registry.is_empty());
        assert!(h1.is_closed() && h2.is_closed());
    }

    #[test]
    fn test_send_frame_reports_full_and_closed() {
        let (link, mut rx) = LinkHandle::new("127.0.0.1:9000".parse().unwrap(), 1);
        assert_eq!(link.send_frame(vec![1]), Ok(()));
        assert_eq!(link.send_frame(vec![2]), Err(LinkSendError::Full));
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        link.close();
        assert_eq!(link.send_frame(vec![3]), Err(LinkSendError::Closed));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (link, _rx) = handle();
        let waiter = link.clone();
        let task = tokio::spawn(async move { waiter.closed().await });
        link.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
