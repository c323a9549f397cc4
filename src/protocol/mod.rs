//! Session protocol: sequenced, acknowledged message streams over a
//! shared socket.
//!
//! A session is identified by `(key, nonce)` and runs two independent
//! halves: a sender loop ([stream::stream]) that emits MSG frames and
//! waits for the matching ACK before advancing, and a receiver loop
//! ([listen::listen]) that accepts contiguous steps, delivers payloads
//! and emits ACKs. [connect::connect] and [channel::channel] are the
//! initiator and responder halves of session establishment and teardown.

pub mod channel;
pub mod connect;
pub mod listen;
mod step;
pub mod stream;

use futures::future::BoxFuture;

use crate::frame::{FrameHeader, FramePattern};
use crate::socket::{SendError, VirtualSocket};
use crate::task::{Cancelled, Task};

#[doc(inline)]
pub use step::StepCounter;

/// Step carried by the session-opening SIG INIT.
pub const INIT_STEP: u32 = 0;

/// Identity of one session on the shared transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProto {
    pub key: u16,
    pub nonce: u16,
}

/// Pulls the next outbound payload; `None` ends the stream normally.
pub type Pull = Box<dyn FnMut() -> BoxFuture<'static, Option<Vec<u8>>> + Send>;

/// Delivers an inbound payload, or the reason the receiver stopped.
/// Returns whether the payload was accepted.
pub type Push = Box<dyn FnMut(Result<Vec<u8>, String>) -> BoxFuture<'static, bool> + Send>;

/// Produces the `(pull, push)` pair for a freshly accepted session.
pub type CreateHandle = Box<dyn FnMut(&Task) -> (Pull, Push) + Send>;

/// Awaits the next frame matching `pattern` whose payload satisfies
/// `body_ok`, cancellable through `task`.
pub(crate) async fn recv_frame(
    socket: &VirtualSocket,
    pattern: FramePattern,
    body_ok: impl Fn(&[u8]) -> bool,
    task: &Task,
) -> Result<(FrameHeader, Vec<u8>), Cancelled> {
    let bytes = socket
        .recv(
            |data| {
                pattern
                    .matches(data)
                    .map_or(false, |(_, body)| body_ok(body))
            },
            task,
        )
        .await?;
    let (header, body) = FrameHeader::parse(&bytes).expect("received frame was matched");
    Ok((header, body.to_vec()))
}

/// Emits one frame on the shared outbox.
pub(crate) fn send_frame(
    socket: &VirtualSocket,
    header: FrameHeader,
    payload: &[u8],
) -> Result<(), SendError> {
    socket.send(header.build(payload))
}
