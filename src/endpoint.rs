//! Binds services to protocol sessions through a codec.
//!
//! [Endpoint] accepts inbound sessions for one route key; [Initiate]
//! opens new ones. Both adapt a [Service] into the protocol's pull/push
//! pair: outbound values are encoded, inbound bytes are decoded,
//! validated and delivered. Decode failures are logged and the frame
//! dropped; a receiver shutdown reason is dropped silently.

use futures::prelude::*;
use std::sync::{Arc, Mutex};

use crate::codec::Codec;
use crate::config::Config;
use crate::protocol::{channel::channel, connect::connect, CreateHandle, Pull, Push, SessionProto};
use crate::service::Service;
use crate::socket::VirtualSocket;
use crate::task::Task;

/// Builds the protocol-facing `(pull, push)` pair for one service.
fn service_handle<I, E, C>(service: Service<I, E>, codec: Arc<C>) -> (Pull, Push)
where
    I: serde::Serialize + Send + 'static,
    E: serde::de::DeserializeOwned + Send + 'static,
    C: Codec,
{
    let pull_service = service.clone();
    let pull_codec = Arc::clone(&codec);
    let pull: Pull = Box::new(move || {
        let service = pull_service.clone();
        let codec = Arc::clone(&pull_codec);
        async move {
            let value = service.internal().await?;
            match codec.encode(&value) {
                Ok(bytes) => Some(bytes),
                Err(error) => {
                    tracing::warn!(%error, "failed to encode payload, ending stream");
                    None
                }
            }
        }
        .boxed()
    });

    let push: Push = Box::new(move |result| {
        let service = service.clone();
        let codec = Arc::clone(&codec);
        async move {
            match result {
                Err(reason) => {
                    tracing::trace!(%reason, "receiver closed");
                    true
                }
                Ok(bytes) => match codec.decode::<E>(&bytes) {
                    Err(error) => {
                        tracing::warn!(%error, "failed to decode payload, dropping frame");
                        true
                    }
                    Ok(value) => {
                        if !service.validate(&value) {
                            tracing::debug!("payload rejected by validator, dropping frame");
                            true
                        } else {
                            service.external(value)
                        }
                    }
                },
            }
        }
        .boxed()
    });

    (pull, push)
}

type ServiceFactory<I, E> = Arc<dyn Fn(&Task) -> Service<I, E> + Send + Sync>;

/// Accepts inbound sessions on one route key.
pub struct Endpoint<I, E, C> {
    key: u16,
    config: Config,
    codec: Arc<C>,
    factory: ServiceFactory<I, E>,
}

impl<I, E, C> Endpoint<I, E, C>
where
    I: serde::Serialize + Send + 'static,
    E: serde::de::DeserializeOwned + Send + 'static,
    C: Codec,
{
    /// `factory` builds a fresh [Service] per accepted session; it
    /// receives the session task so handler work can run under it.
    pub fn new(
        key: u16,
        config: Config,
        codec: Arc<C>,
        factory: impl Fn(&Task) -> Service<I, E> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            config,
            codec,
            factory: Arc::new(factory),
        }
    }

    /// Starts the accept loop on `socket`. The returned root task resolves
    /// with the socket and cancels every session beneath it.
    pub fn start(&self, socket: &VirtualSocket) -> Task {
        let task = Task::new();

        let closed_socket = socket.clone();
        let closed_task = task.clone();
        async_std::task::spawn(async move {
            closed_socket.closed().await;
            closed_task.cancel("socket closed");
        });

        let factory = Arc::clone(&self.factory);
        let codec = Arc::clone(&self.codec);
        let create: CreateHandle = Box::new(move |session_task: &Task| {
            let service = factory(session_task);
            service.close_on(session_task);
            service_handle(service, Arc::clone(&codec))
        });

        let channel_socket = socket.multiplex();
        let channel_task = task.clone();
        let key = self.key;
        let ack_ms = self.config.ack_deadline_ms;
        let silent_ms = self.config.client_silent_deadline_ms;
        async_std::task::spawn(async move {
            channel(channel_socket, key, channel_task, ack_ms, silent_ms, create).await;
        });

        task
    }
}

/// Opens sessions on one route key, one per [Initiate::start] call.
pub struct Initiate<I, E, C> {
    key: u16,
    config: Config,
    codec: Arc<C>,
    factory: ServiceFactory<I, E>,
    nonces: Mutex<u16>,
}

impl<I, E, C> Initiate<I, E, C>
where
    I: serde::Serialize + Send + 'static,
    E: serde::de::DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub fn new(
        key: u16,
        config: Config,
        codec: Arc<C>,
        factory: impl Fn(&Task) -> Service<I, E> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            config,
            codec,
            factory: Arc::new(factory),
            nonces: Mutex::new(1),
        }
    }

    /// Opens a session under `task` and returns its service handle for
    /// [Service::load_internal] / [Service::take_external].
    pub fn start(&self, task: &Task, socket: &VirtualSocket) -> Service<I, E> {
        let nonce = self.next_nonce();
        let service = (self.factory)(task);
        service.close_on(task);
        let (pull, push) = service_handle(service.clone(), Arc::clone(&self.codec));

        let session_socket = socket.multiplex();
        let proto = SessionProto {
            key: self.key,
            nonce,
        };
        let session_task = task.clone();
        let ack_ms = self.config.ack_deadline_ms;
        let silent_ms = self.config.server_silent_deadline_ms;
        async_std::task::spawn(async move {
            connect(session_socket, proto, session_task, ack_ms, silent_ms, pull, push).await;
        });

        service
    }

    /// Session nonces cycle through 1..=u16::MAX; 0 marks unassigned
    /// control traffic.
    fn next_nonce(&self) -> u16 {
        let mut next = self.nonces.lock().unwrap();
        let nonce = *next;
        *next = match next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        nonce
    }
}
