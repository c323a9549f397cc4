//! Bidirectional RPC multiplexing many logical sessions over one
//! ordered, framed message transport.
//!
//! Either endpoint may initiate any route. Five interaction shapes are
//! built from the same session protocol: unary request/reply, sequenced
//! request/reply pairs, one-way streams, listen (one request, a stream
//! of replies) and duplex. Per-message acknowledgement, liveness
//! deadlines, cooperative cancellation and bounded buffering are part of
//! the runtime.
//!
//! The layers, bottom up: bounded queues ([CircularQueue]) with async
//! take, the cancellable [Task] lifetime token, the multiplexing
//! [VirtualSocket], the [frame] codec, the session [protocol] loops, the
//! [Service] pair of queues, the [Endpoint]/[Initiate] binding layer and
//! the typed route surface ([Router]).

pub mod codec;
mod config;
mod endpoint;
pub mod frame;
pub mod protocol;
mod queue;
mod route;
mod service;
pub mod socket;
mod task;

#[cfg(test)]
mod test_utils;

#[doc(inline)]
pub use codec::{Codec, JsonCodec};

#[doc(inline)]
pub use config::Config;

#[doc(inline)]
pub use endpoint::{Endpoint, Initiate};

#[doc(inline)]
pub use queue::{CircularQueue, ConnectError, ConnectableQueue, QueueClosed};

#[doc(inline)]
pub use route::{
    CallError, Channel, DuplexCapacity, DuplexHandle, ListenReplier, Listener, Peer, Route,
    RouteError, Router, SendChannelRoute, SendDuplexRoute, SendListenRoute, SendRoute,
    SendStreamRoute, StreamReceiver, StreamSender,
};

#[doc(inline)]
pub use service::Service;

#[doc(inline)]
pub use socket::{SendError, VirtualSocket};

#[doc(inline)]
pub use task::{Cancelled, PollStep, Raced, Task, TaskHandle, NO_DEADLINE};
