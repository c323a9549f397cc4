//! TCP transport adapter with length-prefix framing.
//!
//! The protocol expects a message-framed transport. Over a raw byte
//! stream each frame is carried as a `u32` big-endian length prefix
//! followed by the frame bytes, reassembled on the way in.

use futures::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::VirtualSocket;

/// Frames larger than this are rejected as corrupt input.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Error receiving a length-prefixed frame.
#[derive(Debug, thiserror::Error)]
pub enum NextFrameError {
    #[error("failed to read from the transport")]
    Io(#[from] std::io::Error),
    #[error("frame length {length} exceeds limit")]
    Oversized { length: u32 },
    #[error("connection closed in the middle of a frame")]
    Truncated,
}

/// [Stream] of frames read directly off an [AsyncRead] transport.
///
/// `buffer` always holds exactly the bytes being assembled next: the
/// 4-byte length prefix between frames, the frame body once a prefix has
/// been decoded (`body_len` set). A zero read at a frame boundary is a
/// clean end of stream; anywhere else it is a truncation error.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct FrameStream<R> {
    #[pin]
    reader: R,
    buffer: Vec<u8>,
    filled: usize,
    body_len: Option<usize>,
}

impl<R> FrameStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: vec![0u8; 4],
            filled: 0,
            body_len: None,
        }
    }
}

impl<R: AsyncRead> Stream for FrameStream<R> {
    type Item = Result<Vec<u8>, NextFrameError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            while *this.filled < this.buffer.len() {
                let read = match futures::ready!(this
                    .reader
                    .as_mut()
                    .poll_read(cx, &mut this.buffer[*this.filled..]))
                {
                    Ok(read) => read,
                    Err(error) => return Poll::Ready(Some(Err(NextFrameError::Io(error)))),
                };
                if read == 0 {
                    let at_boundary = *this.filled == 0 && this.body_len.is_none();
                    return Poll::Ready(if at_boundary {
                        None
                    } else {
                        Some(Err(NextFrameError::Truncated))
                    });
                }
                *this.filled += read;
            }

            *this.filled = 0;
            if this.body_len.take().is_some() {
                let frame = std::mem::replace(this.buffer, vec![0u8; 4]);
                return Poll::Ready(Some(Ok(frame)));
            }

            let mut length_bytes = [0u8; 4];
            length_bytes.copy_from_slice(this.buffer);
            let length = u32::from_be_bytes(length_bytes);
            if length > MAX_FRAME_LEN {
                return Poll::Ready(Some(Err(NextFrameError::Oversized { length })));
            }
            if length == 0 {
                return Poll::Ready(Some(Ok(Vec::new())));
            }
            *this.body_len = Some(length as usize);
            *this.buffer = vec![0u8; length as usize];
        }
    }
}

fn length_prefixed(frame: &[u8]) -> Vec<u8> {
    use bytes::BufMut as _;

    let mut data = Vec::with_capacity(4 + frame.len());
    data.put_u32(frame.len() as u32);
    data.put_slice(frame);
    data
}

/// Drives `socket` over an established TCP connection until it closes.
pub async fn run(
    stream: async_std::net::TcpStream,
    socket: VirtualSocket,
) -> anyhow::Result<()> {
    let (reader, mut writer) = (stream.clone(), stream);

    let (sender, mut receiver) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    socket.connect_sink(move |bytes| {
        let _ = sender.unbounded_send(bytes);
    })?;

    let write_half = async_std::task::spawn(async move {
        while let Some(frame) = receiver.next().await {
            if let Err(error) = writer.write_all(&length_prefixed(&frame)).await {
                tracing::debug!(%error, "tcp send failed");
                break;
            }
        }
        let _ = writer.close().await;
    });

    let mut frames = FrameStream::new(reader);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => socket.deliver(&frame),
            Err(error) => {
                tracing::debug!(%error, "tcp receive failed");
                break;
            }
        }
    }

    socket.unlink_all();
    write_half.await;
    Ok(())
}
