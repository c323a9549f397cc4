//! The multiplexing virtual socket.

use chashmap::CHashMap;
use futures::future::Either;
use futures::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::queue::{CircularQueue, ConnectError, ConnectableQueue, QueueClosed};
use crate::task::{Cancelled, Task};

/// Error returned by [VirtualSocket::send].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbox full")]
    OutboxFull,
    #[error("socket closed")]
    Closed,
}

/// A socket handle that shares one outbox with its multiplex siblings
/// while owning a private inbox.
///
/// Inbound buffers delivered by the transport adapter are copied into
/// every live inbox. [VirtualSocket::multiplex] derives a sibling with a
/// fresh inbox; [VirtualSocket::unlink] releases only this handle's inbox
/// and cascades into a full close once the last inbox is gone.
#[derive(Clone)]
pub struct VirtualSocket {
    shared: Arc<Shared>,
    inbox_id: u64,
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("inbox_id", &self.inbox_id)
            .field("inboxes", &self.shared.inboxes.len())
            .field("outbox", &self.shared.outbox)
            .finish()
    }
}

struct Shared {
    inboxes: CHashMap<u64, CircularQueue<Vec<u8>>>,
    next_inbox_id: AtomicU64,
    inbox_capacity: usize,
    outbox: ConnectableQueue<Vec<u8>>,
    closed: CircularQueue<()>,
}

impl Default for VirtualSocket {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl VirtualSocket {
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Creates a socket whose inboxes and outbox buffer up to `capacity`
    /// frames each.
    pub fn new(capacity: usize) -> Self {
        let inboxes = CHashMap::new();
        inboxes.insert(0, CircularQueue::new(capacity));
        Self {
            shared: Arc::new(Shared {
                inboxes,
                next_inbox_id: AtomicU64::new(1),
                inbox_capacity: capacity,
                outbox: ConnectableQueue::new(capacity),
                closed: CircularQueue::new(1),
            }),
            inbox_id: 0,
        }
    }

    /// Enqueues `bytes` for transmission. Never blocks.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        match self.shared.outbox.push(bytes) {
            Ok(true) => Ok(()),
            Ok(false) => Err(SendError::OutboxFull),
            Err(QueueClosed) => Err(SendError::Closed),
        }
    }

    /// Awaits the next inbound buffer on this handle's inbox for which
    /// `matches` returns true; buffers that do not match are discarded.
    /// Aborts with the task's reason once `task` resolves.
    pub async fn recv(
        &self,
        matches: impl Fn(&[u8]) -> bool,
        task: &Task,
    ) -> Result<Vec<u8>, Cancelled> {
        let inbox = match self.shared.inboxes.get(&self.inbox_id) {
            Some(inbox) => inbox.clone(),
            None => {
                return Err(Cancelled {
                    reason: "socket closed".to_string(),
                })
            }
        };
        let resolved = task.resolved();
        futures::pin_mut!(resolved);
        loop {
            if let Some(reason) = task.cancelled() {
                return Err(Cancelled { reason });
            }
            let take = inbox.take();
            futures::pin_mut!(take);
            match future::select(take, resolved.as_mut()).await {
                Either::Left((Ok(bytes), _)) => {
                    if matches(&bytes) {
                        return Ok(bytes);
                    }
                    tracing::trace!(len = bytes.len(), "discarding unmatched frame");
                }
                Either::Left((Err(QueueClosed), _)) => {
                    return Err(Cancelled {
                        reason: "socket closed".to_string(),
                    })
                }
                Either::Right((reason, _)) => return Err(Cancelled { reason }),
            }
        }
    }

    /// Derives a sibling handle with its own inbox and the shared outbox.
    pub fn multiplex(&self) -> VirtualSocket {
        let inbox_id = self.shared.next_inbox_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .inboxes
            .insert(inbox_id, CircularQueue::new(self.shared.inbox_capacity));
        VirtualSocket {
            shared: Arc::clone(&self.shared),
            inbox_id,
        }
    }

    /// Releases this handle's inbox. Closing the last inbox also closes
    /// the outbox and resolves [VirtualSocket::closed].
    pub fn unlink(&self) {
        if let Some(inbox) = self.shared.inboxes.remove(&self.inbox_id) {
            inbox.close();
        }
        if self.shared.inboxes.is_empty() {
            self.close_shared();
        }
    }

    /// Drops every inbox and the outbox at once. Used by transport
    /// adapters when the underlying connection goes away.
    pub fn unlink_all(&self) {
        self.shared.inboxes.retain(|_, inbox| {
            inbox.close();
            false
        });
        self.close_shared();
    }

    /// Resolves once the socket has been fully unlinked.
    pub async fn closed(&self) {
        match self.shared.closed.take_then_close().await {
            Ok(()) | Err(QueueClosed) => (),
        }
    }

    /// Copies `bytes` into every live inbox. Transport adapter inbound
    /// path.
    pub fn deliver(&self, bytes: &[u8]) {
        self.shared.inboxes.retain(|id, inbox| {
            match inbox.push(bytes.to_vec()) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(inbox = *id, "inbox full, dropping frame"),
                Err(QueueClosed) => tracing::debug!(inbox = *id, "inbox closed, dropping frame"),
            }
            true
        });
    }

    /// Routes outbound buffers through `sink`, draining anything buffered
    /// so far. Transport adapter outbound path; fails when a sink is
    /// already connected.
    pub fn connect_sink(
        &self,
        sink: impl FnMut(Vec<u8>) + Send + 'static,
    ) -> Result<(), ConnectError> {
        self.shared.outbox.connect_push(sink)
    }

    fn close_shared(&self) {
        self.shared.outbox.close();
        let _ = self.shared.closed.push(());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn multiplex_receives_copies() {
        let socket = VirtualSocket::new(8);
        let sibling = socket.multiplex();
        socket.deliver(b"frame");

        let task = Task::new();
        assert_eq!(
            socket.recv(|_| true, &task).await,
            Ok(b"frame".to_vec())
        );
        assert_eq!(
            sibling.recv(|_| true, &task).await,
            Ok(b"frame".to_vec())
        );
    }

    #[async_std::test]
    async fn unlink_leaves_siblings_functional() {
        let socket = VirtualSocket::new(8);
        let sibling = socket.multiplex();
        sibling.unlink();
        socket.deliver(b"frame");

        let task = Task::new();
        assert_eq!(
            socket.recv(|_| true, &task).await,
            Ok(b"frame".to_vec())
        );
        assert!(!socket.shared.outbox.is_closed());
    }

    #[async_std::test]
    async fn last_unlink_closes_outbox() {
        let socket = VirtualSocket::new(8);
        let sibling = socket.multiplex();
        socket.unlink();
        sibling.unlink();
        assert!(socket.shared.outbox.is_closed());
        socket.closed().await;
    }

    #[async_std::test]
    async fn recv_cancelled_by_task() {
        let socket = VirtualSocket::new(8);
        let task = Task::new();
        let task2 = task.clone();
        async_std::task::spawn(async move {
            async_std::task::sleep(std::time::Duration::from_millis(5)).await;
            task2.cancel("stop");
        });
        let result = socket.recv(|_| true, &task).await;
        assert_eq!(
            result,
            Err(Cancelled {
                reason: "stop".to_string()
            })
        );
    }

    #[async_std::test]
    async fn recv_skips_unmatched() {
        let socket = VirtualSocket::new(8);
        socket.deliver(b"skip");
        socket.deliver(b"keep");
        let task = Task::new();
        let result = socket.recv(|bytes| bytes == b"keep", &task).await;
        assert_eq!(result, Ok(b"keep".to_vec()));
    }

    #[async_std::test]
    async fn outbound_buffers_until_sink_connected() {
        let socket = VirtualSocket::new(8);
        socket.send(b"one".to_vec()).unwrap();
        socket.send(b"two".to_vec()).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        socket
            .connect_sink(move |bytes| seen2.lock().unwrap().push(bytes))
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }
}
