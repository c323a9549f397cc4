//! Initiator half of session establishment and teardown.

use crate::frame::{self, FrameHeader, FramePattern, FrameType, Signal};
use crate::socket::VirtualSocket;
use crate::task::{Cancelled, Task};

use super::{
    listen::listen, recv_frame, send_frame, stream::stream, Pull, Push, SessionProto, StepCounter,
    INIT_STEP,
};

/// Opens a session on `socket` and runs both halves until the stream is
/// exhausted or the task resolves.
///
/// The ACK receive for the opening signal is reserved before SIG INIT is
/// emitted; a missing ACK cancels with `"timeout: sig init"`. Once the
/// supplied `pull` runs dry the task is cleaned up with
/// `"connect stream finished"` and a SIG TERM closes the session.
pub async fn connect(
    socket: VirtualSocket,
    proto: SessionProto,
    task: Task,
    ack_ms: u64,
    silent_ms: u64,
    mut pull: Pull,
    mut push: Push,
) {
    let mut steps = StepCounter::new();
    let init_step = steps.claim();
    debug_assert_eq!(init_step, INIT_STEP);

    // Receiver inbox, armed before INIT invites traffic.
    let listen_socket = socket.multiplex();

    let sig_task = task.subtask();
    sig_task.deadline(ack_ms, "sig init");
    let ack_pattern = FramePattern {
        frame_type: Some(FrameType::Ack),
        key: Some(proto.key),
        nonce: Some(proto.nonce),
    };
    let sig_ack = recv_frame(
        &socket,
        ack_pattern,
        move |body| frame::parse_step(Some(init_step), body).is_some(),
        &sig_task,
    );
    futures::pin_mut!(sig_ack);

    let sig_header = FrameHeader {
        frame_type: FrameType::Sig,
        key: proto.key,
        nonce: proto.nonce,
    };
    if let Err(error) = send_frame(&socket, sig_header, &frame::build_signal(init_step, Signal::Init))
    {
        task.cancel(format!("send failed: {}", error));
        listen_socket.unlink();
        socket.unlink();
        return;
    }
    tracing::debug!(key = proto.key, nonce = proto.nonce, "session init sent");

    match sig_ack.await {
        Ok(_) => sig_task.cleanup("sig init acked"),
        Err(Cancelled { reason }) => {
            tracing::debug!(key = proto.key, nonce = proto.nonce, %reason, "session init failed");
            task.cancel(reason);
            listen_socket.unlink();
            socket.unlink();
            return;
        }
    }

    // Receiver counter: an independent sibling advanced past the init step.
    let recv_steps = steps.clone();
    let listen_socket2 = listen_socket.clone();
    let listen_task = task.clone();
    let listen_handle = async_std::task::spawn(async move {
        let mut recv_steps = recv_steps;
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

    let stream_result = stream(&socket, proto, &task, &mut steps, ack_ms, &mut pull).await;
    if stream_result.is_none() {
        task.cleanup("connect stream finished");
        let term_step = steps.claim();
        if let Err(error) =
            send_frame(&socket, sig_header, &frame::build_signal(term_step, Signal::Term))
        {
            tracing::debug!(%error, "failed to send term");
        }
        tracing::debug!(key = proto.key, nonce = proto.nonce, "session terminated");
    }

    listen_socket.unlink();
    socket.unlink();
    listen_handle.await;
}
