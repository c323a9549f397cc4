//! Session establishment, acknowledgement and teardown against a
//! scripted peer speaking raw frames.

use std::sync::Arc;

use braid::frame::{self, FrameHeader, FrameType, Signal};
use braid::socket::memory;
use braid::{Config, Initiate, JsonCodec, Router, Service, Task, VirtualSocket};
use futures::prelude::*;

fn test_config() -> Config {
    Config {
        ack_deadline_ms: 150,
        client_silent_deadline_ms: 2_000,
        server_silent_deadline_ms: 5_000,
    }
}

fn send_ack(socket: &VirtualSocket, key: u16, nonce: u16, step: u32) {
    let header = FrameHeader {
        frame_type: FrameType::Ack,
        key,
        nonce,
    };
    socket
        .send(header.build(&frame::build_step(step, &[])))
        .unwrap();
}

fn frame_type_is(bytes: &[u8], frame_type: FrameType) -> bool {
    matches!(FrameHeader::parse(bytes), Some((header, _)) if header.frame_type == frame_type)
}

/// Asserts that nothing arrives on `socket` within `ms`.
async fn assert_silent(socket: &VirtualSocket, ms: u64) {
    let probe = Task::new();
    probe.deadline(ms, "probe");
    assert!(socket.recv(|_| true, &probe).await.is_err());
}

#[async_std::test]
async fn init_timeout_cancels_the_session() {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, server) = memory::pair(64);
    let initiate = Initiate::new(9, test_config(), Arc::new(JsonCodec), |_: &Task| {
        Service::<u32, u32>::once()
    });
    let session = Task::new();
    let service = initiate.start(&session, &client);
    assert!(service.load_internal(Some(1)));

    // The responder never acknowledges.
    assert_eq!(session.resolved().await, "timeout: sig init".to_string());

    // Exactly one SIG INIT was emitted, step 0, body [0x00].
    let task = Task::new();
    let bytes = server.recv(|_| true, &task).await.unwrap();
    let (header, payload) = FrameHeader::parse(&bytes).unwrap();
    assert_eq!(header.frame_type, FrameType::Sig);
    assert_eq!(header.key, 9);
    assert_eq!(
        frame::parse_signal(Some(0), payload),
        Some((0, Signal::Init))
    );
    assert_eq!(payload, &[0u8, 0, 0, 0, 0][..]);
    assert_silent(&server, 200).await;
}

#[async_std::test]
async fn missing_ack_cancels_the_stream() {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, server) = memory::pair(64);
    let initiate = Initiate::new(3, test_config(), Arc::new(JsonCodec), |_: &Task| {
        Service::<u32, u32>::many(4, 4)
    });
    let session = Task::new();
    let service = initiate.start(&session, &client);
    for val in [1u32, 2, 3] {
        assert!(service.load_internal(Some(val)));
    }

    let peer_task = Task::new();

    // Accept the session.
    let bytes = server
        .recv(|b| frame_type_is(b, FrameType::Sig), &peer_task)
        .await
        .unwrap();
    let (header, payload) = FrameHeader::parse(&bytes).unwrap();
    let (init_step, signal) = frame::parse_signal(None, payload).unwrap();
    assert_eq!(signal, Signal::Init);
    send_ack(&server, header.key, header.nonce, init_step);

    // Acknowledge the first two messages only.
    for expected_step in [1u32, 2] {
        let bytes = server
            .recv(|b| frame_type_is(b, FrameType::Msg), &peer_task)
            .await
            .unwrap();
        let (msg_header, payload) = FrameHeader::parse(&bytes).unwrap();
        let (step, _body) = frame::parse_step(None, payload).unwrap();
        assert_eq!(step, expected_step);
        send_ack(&server, msg_header.key, msg_header.nonce, step);
    }

    // The third message arrives but is never acknowledged.
    let bytes = server
        .recv(|b| frame_type_is(b, FrameType::Msg), &peer_task)
        .await
        .unwrap();
    let (_, payload) = FrameHeader::parse(&bytes).unwrap();
    let (step, _body) = frame::parse_step(None, payload).unwrap();
    assert_eq!(step, 3);

    assert_eq!(session.resolved().await, "timeout: send ack".to_string());
}

#[async_std::test]
async fn responder_delivers_in_order_and_ignores_wrong_steps() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let (client, server) = memory::pair(64);

    let (delivered, mut deliveries) = futures::channel::mpsc::unbounded();
    let server_router = Router::new(test_config());
    server_router.route_at(5)?.recv_stream::<u32, _, _>(8, move |receiver| {
        let delivered = delivered.clone();
        async move {
            while let Some(item) = receiver.next().await {
                delivered.unbounded_send(Some(item)).unwrap();
            }
            delivered.unbounded_send(None).unwrap();
        }
    });
    server_router.attach(&server)?;

    let key = 5u16;
    let nonce = 7u16;
    let task = Task::new();

    // Open the session.
    let sig_header = FrameHeader {
        frame_type: FrameType::Sig,
        key,
        nonce,
    };
    client
        .send(sig_header.build(&frame::build_signal(0, Signal::Init)))
        .unwrap();

    // Exactly one ACK for the init step, branded with our nonce.
    let bytes = client
        .recv(|b| frame_type_is(b, FrameType::Ack), &task)
        .await
        .unwrap();
    let (ack_header, payload) = FrameHeader::parse(&bytes).unwrap();
    assert_eq!(ack_header.nonce, nonce);
    assert!(frame::parse_step(Some(0), payload).is_some());
    assert_silent(&client, 200).await;

    let msg_header = FrameHeader {
        frame_type: FrameType::Msg,
        key,
        nonce,
    };

    // A message out of step order is neither delivered nor acknowledged.
    client
        .send(msg_header.build(&frame::build_step(5, b"99")))
        .unwrap();
    assert_silent(&client, 200).await;
    assert!(deliveries.try_next().is_err());

    // The expected steps flow and are acknowledged in order.
    for (step, body, value) in [(1u32, &b"10"[..], 10u32), (2, &b"20"[..], 20)] {
        client
            .send(msg_header.build(&frame::build_step(step, body)))
            .unwrap();
        let bytes = client
            .recv(|b| frame_type_is(b, FrameType::Ack), &task)
            .await
            .unwrap();
        let (_, payload) = FrameHeader::parse(&bytes).unwrap();
        assert!(frame::parse_step(Some(step), payload).is_some());
        assert_eq!(deliveries.next().await, Some(Some(value)));
    }

    // TERM closes the session and ends the consumer stream.
    client
        .send(sig_header.build(&frame::build_signal(3, Signal::Term)))
        .unwrap();
    assert_eq!(deliveries.next().await, Some(None));
    Ok(())
}
