//! Bounded FIFO queues with asynchronous take semantics.

mod circular;
mod connectable;

#[doc(inline)]
pub use circular::{CircularQueue, QueueClosed};

#[doc(inline)]
pub use connectable::{ConnectError, ConnectableQueue};
