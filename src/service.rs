//! The application-facing pair of bounded queues for one session.
//!
//! The internal queue is the pull side: the session's sender loop drains
//! it and a `None` ends the outbound stream. The external queue is the
//! push side: the receiver loop delivers decoded peer payloads into it.
//! A service is exclusively owned by its session task; the queues close
//! when that task resolves.

use std::sync::{Arc, Mutex};

use crate::queue::{CircularQueue, QueueClosed};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Once,
    Many,
}

#[derive(Debug, Default)]
struct OnceState {
    internal_loaded: bool,
    internal_taken: bool,
    external_loaded: bool,
    external_taken: bool,
}

type Validator<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

pub struct Service<I, E> {
    inner: Arc<Inner<I, E>>,
}

struct Inner<I, E> {
    internal: CircularQueue<Option<I>>,
    external: CircularQueue<E>,
    // Resolved when the external side has delivered; gates the terminal
    // pull of a once service so the exchange completes before teardown.
    settled: CircularQueue<()>,
    flavor: Flavor,
    state: Mutex<OnceState>,
    validator: Mutex<Option<Validator<E>>>,
}

impl<I, E> Clone for Service<I, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, E> std::fmt::Debug for Service<I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("flavor", &self.inner.flavor)
            .finish()
    }
}

impl<I, E> Service<I, E> {
    /// One-shot service: a single value each way, then terminal.
    pub fn once() -> Self {
        Self::build(Flavor::Once, 1, 1)
    }

    /// Capacity-configurable service.
    pub fn many(internal_capacity: usize, external_capacity: usize) -> Self {
        Self::build(Flavor::Many, internal_capacity, external_capacity)
    }

    fn build(flavor: Flavor, internal_capacity: usize, external_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                internal: CircularQueue::new(internal_capacity),
                external: CircularQueue::new(external_capacity),
                settled: CircularQueue::new(1),
                flavor,
                state: Mutex::new(OnceState::default()),
                validator: Mutex::new(None),
            }),
        }
    }

    /// Installs a boundary validator applied to decoded inbound values.
    pub fn set_validator(&self, validator: impl Fn(&E) -> bool + Send + Sync + 'static) {
        *self.inner.validator.lock().unwrap() = Some(Box::new(validator));
    }

    pub fn validate(&self, value: &E) -> bool {
        match &*self.inner.validator.lock().unwrap() {
            Some(validator) => validator(value),
            None => true,
        }
    }

    /// Loads the next outbound value; `None` ends the stream. Returns
    /// whether the value was accepted.
    pub fn load_internal(&self, value: Option<I>) -> bool {
        if self.inner.flavor == Flavor::Once {
            let mut state = self.inner.state.lock().unwrap();
            if state.internal_loaded {
                return false;
            }
            state.internal_loaded = true;
        }
        self.inner.internal.push(value).unwrap_or(false)
    }

    /// Pull side: the next outbound value, or `None` once the stream is
    /// over.
    pub async fn internal(&self) -> Option<I> {
        match self.inner.flavor {
            Flavor::Many => match self.inner.internal.take().await {
                Ok(value) => value,
                Err(QueueClosed) => None,
            },
            Flavor::Once => {
                let taken = self.inner.state.lock().unwrap().internal_taken;
                if taken {
                    // The single value is out; hold the stream open until
                    // the answering delivery lands, then end it.
                    let _ = self.inner.settled.take().await;
                    return None;
                }
                let value = self.inner.internal.take().await;
                self.inner.state.lock().unwrap().internal_taken = true;
                match value {
                    Ok(value) => value,
                    Err(QueueClosed) => None,
                }
            }
        }
    }

    /// Push side: delivers a decoded peer value. Returns whether it was
    /// accepted.
    pub fn external(&self, value: E) -> bool {
        if self.inner.flavor == Flavor::Once {
            let mut state = self.inner.state.lock().unwrap();
            if state.external_loaded {
                return false;
            }
            state.external_loaded = true;
        }
        let accepted = self.inner.external.push(value).unwrap_or(false);
        if accepted && self.inner.flavor == Flavor::Once {
            let _ = self.inner.settled.push(());
        }
        accepted
    }

    /// Takes the next delivered peer value.
    pub async fn take_external(&self) -> Result<E, QueueClosed> {
        if self.inner.flavor == Flavor::Once {
            {
                let state = self.inner.state.lock().unwrap();
                if state.external_taken {
                    return Err(QueueClosed);
                }
            }
            let value = self.inner.external.take().await?;
            self.inner.state.lock().unwrap().external_taken = true;
            return Ok(value);
        }
        self.inner.external.take().await
    }

    /// Closes both queues; every parked consumer is rejected.
    pub fn close(&self) {
        self.inner.internal.close();
        self.inner.external.close();
        self.inner.settled.close();
    }
}

impl<I, E> Service<I, E>
where
    I: Send + 'static,
    E: Send + 'static,
{
    /// Ties the service's lifetime to `task`: queues close when it
    /// resolves.
    pub fn close_on(&self, task: &Task) {
        let service = self.clone();
        let resolved = task.resolved();
        async_std::task::spawn(async move {
            resolved.await;
            service.close();
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn many_preserves_fifo() {
        let service = Service::<u32, u32>::many(4, 4);
        assert!(service.load_internal(Some(1)));
        assert!(service.load_internal(Some(2)));
        assert_eq!(service.internal().await, Some(1));
        assert_eq!(service.internal().await, Some(2));
    }

    #[async_std::test]
    async fn many_none_ends_stream() {
        let service = Service::<u32, u32>::many(4, 4);
        assert!(service.load_internal(None));
        assert_eq!(service.internal().await, None);
    }

    #[async_std::test]
    async fn many_full_rejects() {
        let service = Service::<u32, u32>::many(1, 1);
        assert!(service.load_internal(Some(1)));
        assert!(!service.load_internal(Some(2)));
    }

    #[async_std::test]
    async fn once_single_load() {
        let service = Service::<u32, u32>::once();
        assert!(service.load_internal(Some(1)));
        assert!(!service.load_internal(Some(2)));
        assert_eq!(service.internal().await, Some(1));
    }

    #[async_std::test]
    async fn once_terminal_pull_waits_for_exchange() {
        let service = Service::<u32, u32>::once();
        service.load_internal(Some(1));
        assert_eq!(service.internal().await, Some(1));

        let service2 = service.clone();
        let handle = async_std::task::spawn(async move { service2.internal().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        assert!(service.external(42));
        assert_eq!(handle.await, None);
        assert_eq!(service.take_external().await, Ok(42));
    }

    #[async_std::test]
    async fn once_external_single_delivery() {
        let service = Service::<u32, u32>::once();
        assert!(service.external(1));
        assert!(!service.external(2));
        assert_eq!(service.take_external().await, Ok(1));
        assert_eq!(service.take_external().await, Err(QueueClosed));
    }

    #[async_std::test]
    async fn close_rejects_consumers() {
        let service = Service::<u32, u32>::many(1, 1);
        let service2 = service.clone();
        let handle = async_std::task::spawn(async move { service2.take_external().await });
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        service.close();
        assert_eq!(handle.await, Err(QueueClosed));
        assert!(!service.load_internal(Some(1)));
    }

    #[async_std::test]
    async fn closes_with_task() {
        let service = Service::<u32, u32>::many(1, 1);
        let task = Task::new();
        service.close_on(&task);
        task.cancel("stop");
        async_std::task::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!service.external(1));
    }

    #[async_std::test]
    async fn validator_gates_external_values() {
        let service = Service::<u32, u32>::many(1, 1);
        service.set_validator(|value| *value < 10);
        assert!(service.validate(&5));
        assert!(!service.validate(&11));
    }
}
