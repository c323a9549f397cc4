//! Sender half of a session: sequenced MSG frames, one ACK at a time.

use crate::frame::{self, FrameHeader, FramePattern, FrameType};
use crate::socket::VirtualSocket;
use crate::task::{Cancelled, Task};

use super::{recv_frame, send_frame, Pull, SessionProto, StepCounter};

/// Pulls payloads and emits them as step-branded MSG frames, waiting for
/// each step's ACK (under `ack_ms`) before the next pull.
///
/// Ends with `None` when `pull` is exhausted; otherwise cancels `task`
/// and returns the terminal reason.
pub async fn stream(
    socket: &VirtualSocket,
    proto: SessionProto,
    task: &Task,
    steps: &mut StepCounter,
    ack_ms: u64,
    pull: &mut Pull,
) -> Option<String> {
    let ack_pattern = FramePattern {
        frame_type: Some(FrameType::Ack),
        key: Some(proto.key),
        nonce: Some(proto.nonce),
    };
    loop {
        if let Some(reason) = task.cancelled() {
            return Some(reason);
        }
        let payload = match pull().await {
            Some(payload) => payload,
            None => return None,
        };
        let step = steps.claim();

        let ack_task = task.subtask();
        ack_task.deadline(ack_ms, "send ack");
        let ack = recv_frame(
            socket,
            ack_pattern,
            move |body| frame::parse_step(Some(step), body).is_some(),
            &ack_task,
        );
        futures::pin_mut!(ack);

        let header = FrameHeader {
            frame_type: FrameType::Msg,
            key: proto.key,
            nonce: proto.nonce,
        };
        if let Err(error) = send_frame(socket, header, &frame::build_step(step, &payload)) {
            let reason = format!("send failed: {}", error);
            task.cancel(reason.clone());
            return Some(reason);
        }
        tracing::trace!(key = proto.key, nonce = proto.nonce, step, "message sent");

        match ack.await {
            Ok(_) => ack_task.cleanup("ack received"),
            Err(Cancelled { reason }) => {
                task.cancel(reason.clone());
                return Some(reason);
            }
        }
    }
}
