//! Sockets: the multiplexing fan-out socket and transport adapters.
//!
//! A [VirtualSocket] fans one underlying transport out to many logical
//! consumers. Transport adapters bridge a concrete connection to a
//! socket: inbound binary messages are delivered into every live inbox,
//! outbound buffers drain through the socket's connectable outbox, and a
//! closing connection unlinks the socket entirely.

mod fanout;
pub mod memory;
pub mod tcp;
pub mod websocket;

#[doc(inline)]
pub use fanout::{SendError, VirtualSocket};
