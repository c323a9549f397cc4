//! Responder half: accepts sessions and runs them to completion.

use crate::frame::{self, FrameHeader, FramePattern, FrameType, Signal};
use crate::socket::VirtualSocket;
use crate::task::{Cancelled, Task};

use super::{
    listen::listen, recv_frame, send_frame, stream::stream, CreateHandle, SessionProto,
    StepCounter, INIT_STEP,
};

/// Accept loop for one route key.
///
/// Each iteration opens an accept slot: a fresh service handle and a
/// subtask whose deadline bounds the wait for the next SIG INIT. An
/// accepted session captures the nonce from the INIT frame header,
/// acknowledges the init step under that nonce and launches its receiver,
/// sender and TERM watcher. The slot dies alone on timeout; the loop
/// keeps accepting until `task` resolves.
pub async fn channel(
    socket: VirtualSocket,
    key: u16,
    task: Task,
    ack_ms: u64,
    silent_ms: u64,
    mut create_handle: CreateHandle,
) {
    let sig_pattern = FramePattern {
        frame_type: Some(FrameType::Sig),
        key: Some(key),
        nonce: None,
    };
    loop {
        if task.cancelled().is_some() {
            return;
        }

        let session_task = task.subtask();
        let (pull, push) = create_handle(&session_task);

        let init_task = session_task.subtask();
        init_task.deadline(silent_ms, "sig init");
        let init = recv_frame(
            &socket,
            sig_pattern,
            |body| matches!(frame::parse_signal(Some(INIT_STEP), body), Some((_, Signal::Init))),
            &init_task,
        )
        .await;

        let header = match init {
            Ok((header, _)) => {
                init_task.cleanup("sig init received");
                header
            }
            Err(Cancelled { reason }) => {
                tracing::debug!(key, %reason, "accept slot closed");
                session_task.cancel(reason);
                continue;
            }
        };

        let proto = SessionProto {
            key,
            nonce: header.nonce,
        };
        tracing::debug!(key, nonce = proto.nonce, "session accepted");

        let mut steps = StepCounter::new();
        let init_step = steps.claim();
        let recv_steps = steps.clone();

        // Per-consumer inboxes, armed before the init ACK invites traffic.
        let listen_socket = socket.multiplex();
        let stream_socket = socket.multiplex();
        let term_socket = socket.multiplex();

        let ack_header = FrameHeader {
            frame_type: FrameType::Ack,
            key,
            nonce: proto.nonce,
        };
        if let Err(error) = send_frame(&socket, ack_header, &frame::build_step(init_step, &[])) {
            tracing::debug!(key, nonce = proto.nonce, %error, "failed to ack init");
            session_task.cancel(format!("send failed: {}", error));
            listen_socket.unlink();
            stream_socket.unlink();
            term_socket.unlink();
            continue;
        }

        let listen_task = session_task.clone();
        let listen_socket2 = listen_socket.clone();
        let stream_socket2 = stream_socket.clone();
        let term_socket2 = term_socket.clone();
        async_std::task::spawn(async move {
            let mut recv_steps = recv_steps;
            let mut push = push;
            listen(
                &listen_socket2,
                proto,
                &listen_task,
                &mut recv_steps,
                silent_ms,
                &mut push,
            )
            .await;
        });

        let term_task = session_task.clone();
        async_std::task::spawn(async move {
            let term_pattern = FramePattern {
                frame_type: Some(FrameType::Sig),
                key: Some(proto.key),
                nonce: Some(proto.nonce),
            };
            let received = recv_frame(
                &term_socket2,
                term_pattern,
                |body| matches!(frame::parse_signal(None, body), Some((_, Signal::Term))),
                &term_task,
            )
            .await;
            if received.is_ok() {
                tracing::debug!(key = proto.key, nonce = proto.nonce, "session terminated by peer");
                term_task.cleanup("term received");
            }
            term_socket.unlink();
            listen_socket.unlink();
            stream_socket.unlink();
        });

        let stream_task = session_task.clone();
        async_std::task::spawn(async move {
            let mut steps = steps;
            let mut pull = pull;
            let result = stream(
                &stream_socket2,
                proto,
                &stream_task,
                &mut steps,
                ack_ms,
                &mut pull,
            )
            .await;
            if result.is_none() {
                stream_task.cleanup("channel stream finished");
            }
        });
    }
}
