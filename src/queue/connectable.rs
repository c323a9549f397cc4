//! A circular queue that can be switched into push-through mode.

use std::sync::{Arc, Mutex};

use super::{CircularQueue, QueueClosed};

/// Error returned by [ConnectableQueue::connect_push].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("queue already connected")]
    AlreadyConnected,
    #[error("queue has parked waiters")]
    WaitersQueued,
    #[error(transparent)]
    Closed(#[from] QueueClosed),
}

type PushSink<T> = Box<dyn FnMut(T) + Send>;

/// [CircularQueue] extended with a push-through connector.
///
/// The queue starts out buffering. Once a sink is connected the buffered
/// values are drained into it in FIFO order and every later push delegates
/// to the sink synchronously, bypassing storage. Taking from a connected
/// queue is an error.
pub struct ConnectableQueue<T> {
    queue: CircularQueue<T>,
    sink: Arc<Mutex<Option<PushSink<T>>>>,
}

impl<T> Clone for ConnectableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<T> std::fmt::Debug for ConnectableQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectableQueue")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<T> ConnectableQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: CircularQueue::new(capacity),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Routes all pushes through `sink`, draining buffered values first.
    pub fn connect_push(&self, sink: impl FnMut(T) + Send + 'static) -> Result<(), ConnectError> {
        let mut guard = self.sink.lock().unwrap();
        if guard.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        if self.queue.is_closed() {
            return Err(ConnectError::Closed(QueueClosed));
        }
        if self.queue.has_waiters() {
            return Err(ConnectError::WaitersQueued);
        }
        let mut sink = Box::new(sink) as PushSink<T>;
        for value in self.queue.drain_now() {
            sink(value);
        }
        *guard = Some(sink);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn push(&self, value: T) -> Result<bool, QueueClosed> {
        let mut guard = self.sink.lock().unwrap();
        if let Some(sink) = guard.as_mut() {
            if self.queue.is_closed() {
                return Err(QueueClosed);
            }
            sink(value);
            return Ok(true);
        }
        self.queue.push(value)
    }

    /// Takes the oldest buffered value; forbidden once connected.
    pub async fn take(&self) -> Result<T, QueueClosed> {
        if self.is_connected() {
            return Err(QueueClosed);
        }
        self.queue.take().await
    }

    /// Flushes the buffered values; forbidden once connected.
    pub async fn flush(&self) -> Result<Vec<T>, QueueClosed> {
        if self.is_connected() {
            return Err(QueueClosed);
        }
        self.queue.flush().await
    }

    pub fn close(&self) {
        self.queue.close();
        self.sink.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        (seen, move |value| seen2.lock().unwrap().push(value))
    }

    #[async_std::test]
    async fn buffers_until_connected() {
        let queue = ConnectableQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let (seen, sink) = collector();
        queue.connect_push(sink).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        queue.push(3).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[async_std::test]
    async fn connect_twice_fails() {
        let queue = ConnectableQueue::<u32>::new(4);
        queue.connect_push(|_| {}).unwrap();
        match queue.connect_push(|_| {}) {
            Err(ConnectError::AlreadyConnected) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[async_std::test]
    async fn connect_with_waiters_fails() {
        let queue = ConnectableQueue::<u32>::new(4);
        let queue2 = queue.clone();
        let handle = async_std::task::spawn(async move { queue2.take().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        match queue.connect_push(|_| {}) {
            Err(ConnectError::WaitersQueued) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        queue.push(1).unwrap();
        assert_eq!(handle.await, Ok(1));
    }

    #[async_std::test]
    async fn take_forbidden_once_connected() {
        let queue = ConnectableQueue::<u32>::new(4);
        queue.connect_push(|_| {}).unwrap();
        assert_eq!(queue.take().await, Err(QueueClosed));
    }

    #[async_std::test]
    async fn close_is_terminal() {
        let queue = ConnectableQueue::new(4);
        queue.push(1).unwrap();
        queue.close();
        assert_eq!(queue.push(2), Err(QueueClosed));
        assert!(queue.connect_push(|_| {}).is_err());
    }
}
