//! Receiver half of a session: in-order delivery with per-step ACKs.

use crate::frame::{self, FrameHeader, FramePattern, FrameType};
use crate::socket::VirtualSocket;
use crate::task::{Cancelled, Task};

use super::{recv_frame, send_frame, Push, SessionProto, StepCounter};

/// Accepts MSG frames in ascending step order, pushes each payload to the
/// consumer and acknowledges it. A silent gap longer than `silent_ms`
/// fails the session.
///
/// The terminal reason is pushed to the consumer before the parent task
/// is cancelled.
pub async fn listen(
    socket: &VirtualSocket,
    proto: SessionProto,
    task: &Task,
    steps: &mut StepCounter,
    silent_ms: u64,
    push: &mut Push,
) -> Option<String> {
    let msg_pattern = FramePattern {
        frame_type: Some(FrameType::Msg),
        key: Some(proto.key),
        nonce: Some(proto.nonce),
    };
    loop {
        if let Some(reason) = task.cancelled() {
            return Some(reason);
        }
        let step = steps.claim();

        let msg_task = task.subtask();
        msg_task.deadline(silent_ms, "listen");
        let received = recv_frame(
            socket,
            msg_pattern,
            move |body| frame::parse_step(Some(step), body).is_some(),
            &msg_task,
        )
        .await;

        match received {
            Ok((_, payload)) => {
                msg_task.cleanup("message received");
                let body = match frame::parse_step(Some(step), &payload) {
                    Some((_, body)) => body.to_vec(),
                    None => continue,
                };
                if !push(Ok(body)).await {
                    tracing::debug!(key = proto.key, nonce = proto.nonce, step, "payload rejected by consumer");
                }
                let header = FrameHeader {
                    frame_type: FrameType::Ack,
                    key: proto.key,
                    nonce: proto.nonce,
                };
                if let Err(error) = send_frame(socket, header, &frame::build_step(step, &[])) {
                    let reason = format!("send failed: {}", error);
                    push(Err(reason.clone())).await;
                    task.cancel(reason.clone());
                    return Some(reason);
                }
                tracing::trace!(key = proto.key, nonce = proto.nonce, step, "message acknowledged");
            }
            Err(Cancelled { reason }) => {
                push(Err(reason.clone())).await;
                task.cancel(reason.clone());
                return Some(reason);
            }
        }
    }
}
