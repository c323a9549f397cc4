//! A bounded FIFO with waiters that park until the next push.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Error raised by every interaction with a closed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Bounded FIFO supporting non-blocking push, asynchronous take, bulk
/// flush and a terminal close.
///
/// Consumers that find the queue empty park a waiter which is resolved
/// directly by the next push; values never pass through storage while a
/// waiter is queued. Closing the queue rejects every parked waiter and
/// makes all later operations fail with [QueueClosed].
///
/// ```rust
/// # use braid::CircularQueue;
/// # async_std::task::block_on(async {
/// let queue = CircularQueue::new(2);
/// assert_eq!(queue.push(1), Ok(true));
/// assert_eq!(queue.push(2), Ok(true));
/// assert_eq!(queue.push(3), Ok(false));
/// assert_eq!(queue.take().await, Ok(1));
/// # });
/// ```
#[derive(Debug)]
pub struct CircularQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for CircularQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    ring: Ring<T>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
}

#[derive(Debug)]
enum Waiter<T> {
    Take(futures::channel::oneshot::Sender<Result<T, QueueClosed>>),
    Flush(futures::channel::oneshot::Sender<Result<Vec<T>, QueueClosed>>),
    TakeThenClose(futures::channel::oneshot::Sender<Result<T, QueueClosed>>),
}

impl<T> CircularQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ring: Ring::with_capacity(capacity),
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Offers `value` to the queue.
    ///
    /// The oldest parked waiter receives the value directly; otherwise the
    /// value is stored if spare capacity exists. Returns `Ok(false)` when
    /// the buffer is full.
    pub fn push(&self, value: T) -> Result<bool, QueueClosed> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(QueueClosed);
        }

        let mut value = value;
        while let Some(waiter) = inner.waiters.pop_front() {
            // A waiter whose receiving future was dropped is skipped and the
            // value offered to the next one.
            match waiter {
                Waiter::Take(sender) => match sender.send(Ok(value)) {
                    Ok(()) => return Ok(true),
                    Err(Ok(returned)) => value = returned,
                    Err(Err(_)) => unreachable!(),
                },
                Waiter::Flush(sender) => match sender.send(Ok(vec![value])) {
                    Ok(()) => return Ok(true),
                    Err(Ok(mut returned)) => match returned.pop() {
                        Some(v) => value = v,
                        None => unreachable!(),
                    },
                    Err(Err(_)) => unreachable!(),
                },
                Waiter::TakeThenClose(sender) => match sender.send(Ok(value)) {
                    Ok(()) => {
                        Self::close_locked(&mut inner);
                        return Ok(true);
                    }
                    Err(Ok(returned)) => value = returned,
                    Err(Err(_)) => unreachable!(),
                },
            }
        }

        Ok(inner.ring.push(value))
    }

    /// Removes and returns the oldest value, waiting for the next push when
    /// the queue is empty.
    pub async fn take(&self) -> Result<T, QueueClosed> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueClosed);
            }
            if let Some(value) = inner.ring.pop() {
                return Ok(value);
            }
            let (sender, receiver) = futures::channel::oneshot::channel();
            inner.waiters.push_back(Waiter::Take(sender));
            receiver
        };
        receiver.await.unwrap_or(Err(QueueClosed))
    }

    /// Removes and returns every buffered value in FIFO order.
    ///
    /// When the queue is empty the returned future resolves with a
    /// one-element vec holding the next pushed value; later pushes are not
    /// batched in.
    pub async fn flush(&self) -> Result<Vec<T>, QueueClosed> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueClosed);
            }
            if !inner.ring.is_empty() {
                return Ok(inner.ring.drain());
            }
            let (sender, receiver) = futures::channel::oneshot::channel();
            inner.waiters.push_back(Waiter::Flush(sender));
            receiver
        };
        receiver.await.unwrap_or(Err(QueueClosed))
    }

    /// Like [CircularQueue::take], but atomically closes the queue when the
    /// value is handed over.
    pub async fn take_then_close(&self) -> Result<T, QueueClosed> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueClosed);
            }
            if let Some(value) = inner.ring.pop() {
                Self::close_locked(&mut inner);
                return Ok(value);
            }
            let (sender, receiver) = futures::channel::oneshot::channel();
            inner.waiters.push_back(Waiter::TakeThenClose(sender));
            receiver
        };
        receiver.await.unwrap_or(Err(QueueClosed))
    }

    /// Marks the queue terminal and rejects every parked waiter.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        Self::close_locked(&mut inner);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn close_locked(inner: &mut Inner<T>) {
        inner.closed = true;
        inner.ring.drain();
        for waiter in inner.waiters.drain(..) {
            match waiter {
                Waiter::Take(sender) | Waiter::TakeThenClose(sender) => {
                    let _ = sender.send(Err(QueueClosed));
                }
                Waiter::Flush(sender) => {
                    let _ = sender.send(Err(QueueClosed));
                }
            }
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.inner.lock().unwrap().waiters.is_empty()
    }

    /// Synchronously drains the buffered values without touching waiters.
    pub(crate) fn drain_now(&self) -> Vec<T> {
        self.inner.lock().unwrap().ring.drain()
    }
}

/// Fixed-capacity ring of `capacity + 1` slots with head/tail indices.
#[derive(Debug)]
struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || None);
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.slots.len() == self.head
    }

    fn push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.tail] = Some(value);
        self.tail = (self.tail + 1) % self.slots.len();
        true
    }

    fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        value
    }

    fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Some(value) = self.pop() {
            values.push(value);
        }
        values
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::*;

    #[async_std::test]
    async fn push_take_fifo() {
        let queue = CircularQueue::new(3);
        assert_eq!(queue.push(1), Ok(true));
        assert_eq!(queue.push(2), Ok(true));
        assert_eq!(queue.take().await, Ok(1));
        assert_eq!(queue.take().await, Ok(2));
    }

    #[async_std::test]
    async fn push_full() {
        let queue = CircularQueue::new(1);
        assert_eq!(queue.push(1), Ok(true));
        assert_eq!(queue.push(2), Ok(false));
        assert_eq!(queue.take().await, Ok(1));
        assert_eq!(queue.push(2), Ok(true));
    }

    #[async_std::test]
    async fn zero_capacity_stores_nothing() {
        let queue = CircularQueue::new(0);
        assert_eq!(queue.push(1), Ok(false));
        let queue2 = queue.clone();
        let handle = async_std::task::spawn(async move { queue2.take().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(queue.push(1), Ok(true));
        assert_eq!(handle.await, Ok(1));
    }

    #[async_std::test]
    async fn waiter_resolved_by_push() {
        let queue = CircularQueue::new(2);
        let queue2 = queue.clone();
        let handle = async_std::task::spawn(async move { queue2.take().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(queue.push(7), Ok(true));
        assert_eq!(handle.await, Ok(7));
    }

    #[async_std::test]
    async fn flush_buffered() {
        let queue = CircularQueue::new(3);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.flush().await, Ok(vec![1, 2, 3]));
        assert_eq!(queue.push(4), Ok(true));
        assert_eq!(queue.take().await, Ok(4));
    }

    #[async_std::test]
    async fn flush_empty_resolves_on_next_push() {
        let queue = CircularQueue::new(3);
        let queue2 = queue.clone();
        let handle = async_std::task::spawn(async move { queue2.flush().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(queue.push(1), Ok(true));
        assert_eq!(handle.await, Ok(vec![1]));
    }

    #[async_std::test]
    async fn take_then_close_terminal() {
        let queue = CircularQueue::new(1);
        queue.push(5).unwrap();
        assert_eq!(queue.take_then_close().await, Ok(5));
        assert_eq!(queue.push(6), Err(QueueClosed));
    }

    #[async_std::test]
    async fn close_rejects_waiters() {
        let queue = CircularQueue::<u32>::new(1);
        let queue2 = queue.clone();
        let handle = async_std::task::spawn(async move { queue2.take().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        queue.close();
        assert_eq!(handle.await, Err(QueueClosed));
        assert_eq!(queue.push(1), Err(QueueClosed));
        assert_eq!(queue.take().await, Err(QueueClosed));
        assert_eq!(queue.flush().await, Err(QueueClosed));
    }

    #[proptest]
    fn fifo_order_preserved(
        #[strategy(proptest::collection::vec(proptest::arbitrary::any::<u32>(), 0..32))]
        values: Vec<u32>,
    ) {
        async_std::task::block_on(async {
            let queue = CircularQueue::new(values.len());
            for value in &values {
                prop_assert_eq!(queue.push(*value), Ok(true));
            }
            let mut taken = Vec::new();
            for _ in 0..values.len() {
                taken.push(queue.take().await.unwrap());
            }
            prop_assert_eq!(taken, values);
            Ok(())
        })?;
    }

    #[proptest]
    fn push_never_exceeds_capacity(
        #[strategy(1usize..8)] capacity: usize,
        #[strategy(proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..32))]
        values: Vec<u8>,
    ) {
        let queue = CircularQueue::new(capacity);
        let mut accepted = 0usize;
        for value in values {
            if queue.push(value).unwrap() {
                accepted += 1;
            }
        }
        prop_assert!(accepted <= capacity);
    }
}
