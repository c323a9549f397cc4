//! Typed route surface: keyed route registration and the five
//! interaction shapes.
//!
//! A [Router] issues stable keys and records which side of each route is
//! bound here. Responder-side binds install a per-session handler;
//! initiator-side binds return a typed opener. [Router::attach] wires
//! every bound responder onto a socket and returns a [Peer] for opening
//! outbound sessions.

use futures::future::Either;
use futures::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{Codec, JsonCodec};
use crate::config::Config;
use crate::endpoint::{Endpoint, Initiate};
use crate::queue::QueueClosed;
use crate::service::Service;
use crate::socket::VirtualSocket;
use crate::task::{Cancelled, Task};

/// Fatal configuration errors raised at bind or attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("duplicate route key {key}")]
    DuplicateKey { key: u16 },
    #[error("route {key} was issued but never bound")]
    Unbound { key: u16 },
    #[error("route {key} does not belong to this router")]
    ForeignRoute { key: u16 },
}

/// Errors surfaced by initiator-side route operations.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Failed to send")]
    SendFailed,
    #[error("Task cancelled: {reason}")]
    Cancelled { reason: String },
    #[error(transparent)]
    Route(#[from] RouteError),
}

static NEXT_ROUTER_ID: AtomicU64 = AtomicU64::new(0);

type Binder = Box<dyn Fn(&VirtualSocket) -> Task + Send + Sync>;

/// Issues route keys and collects responder bindings.
pub struct Router<C = JsonCodec> {
    inner: Arc<RouterInner<C>>,
}

impl<C> Clone for Router<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RouterInner<C> {
    id: u64,
    config: Config,
    codec: Arc<C>,
    next_key: Mutex<u16>,
    issued: Mutex<HashSet<u16>>,
    responders: Mutex<HashMap<u16, Binder>>,
    initiators: Mutex<HashSet<u16>>,
}

impl Router<JsonCodec> {
    pub fn new(config: Config) -> Self {
        Self::with_codec(config, JsonCodec)
    }
}

impl<C: Codec> Router<C> {
    pub fn with_codec(config: Config, codec: C) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                id: NEXT_ROUTER_ID.fetch_add(1, Ordering::Relaxed),
                config,
                codec: Arc::new(codec),
                next_key: Mutex::new(0),
                issued: Mutex::new(HashSet::new()),
                responders: Mutex::new(HashMap::new()),
                initiators: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Issues a route with the next free key.
    pub fn route(&self) -> Route<C> {
        let mut next = self.inner.next_key.lock().unwrap();
        let mut issued = self.inner.issued.lock().unwrap();
        let key = loop {
            let key = *next;
            *next = next.wrapping_add(1);
            if issued.insert(key) {
                break key;
            }
        };
        Route {
            router: self.clone(),
            key,
            config: None,
        }
    }

    /// Issues a route with an explicitly chosen key.
    pub fn route_at(&self, key: u16) -> Result<Route<C>, RouteError> {
        if !self.inner.issued.lock().unwrap().insert(key) {
            return Err(RouteError::DuplicateKey { key });
        }
        Ok(Route {
            router: self.clone(),
            key,
            config: None,
        })
    }

    /// Starts every bound responder on `socket` and returns a [Peer] for
    /// initiating sessions. Fails if any issued route was never bound.
    pub fn attach(&self, socket: &VirtualSocket) -> Result<Peer, RouteError> {
        {
            let issued = self.inner.issued.lock().unwrap();
            let responders = self.inner.responders.lock().unwrap();
            let initiators = self.inner.initiators.lock().unwrap();
            for key in issued.iter() {
                if !responders.contains_key(key) && !initiators.contains(key) {
                    return Err(RouteError::Unbound { key: *key });
                }
            }
        }

        let endpoints = self
            .inner
            .responders
            .lock()
            .unwrap()
            .values()
            .map(|binder| binder(socket))
            .collect();

        let task = Task::new();
        let closed_socket = socket.clone();
        let closed_task = task.clone();
        async_std::task::spawn(async move {
            closed_socket.closed().await;
            closed_task.cancel("socket closed");
        });

        Ok(Peer {
            socket: socket.clone(),
            task,
            router_id: self.inner.id,
            endpoints,
        })
    }
}

/// One attached connection: the root of every session opened through it.
pub struct Peer {
    socket: VirtualSocket,
    task: Task,
    router_id: u64,
    endpoints: Vec<Task>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("router_id", &self.router_id).finish()
    }
}

impl Peer {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Cancels every session and responder running on this connection.
    pub fn detach(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.task.cancel(reason.clone());
        for endpoint in &self.endpoints {
            endpoint.cancel(reason.clone());
        }
    }

    fn check(&self, router_id: u64, key: u16) -> Result<(), RouteError> {
        if self.router_id != router_id {
            return Err(RouteError::ForeignRoute { key });
        }
        Ok(())
    }
}

/// An issued, not yet bound route. Binding consumes the route, so a
/// route can be bound exactly once.
pub struct Route<C = JsonCodec> {
    router: Router<C>,
    key: u16,
    config: Option<Config>,
}

impl<C> std::fmt::Debug for Route<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("key", &self.key).finish()
    }
}

/// Capacities of the two directions of a duplex route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexCapacity {
    pub send: usize,
    pub recv: usize,
}

impl<C: Codec> Route<C> {
    pub fn key(&self) -> u16 {
        self.key
    }

    /// Overrides the router's deadlines for this route.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    fn effective_config(&self) -> Config {
        self.config
            .clone()
            .unwrap_or_else(|| self.router.inner.config.clone())
    }

    fn register_initiator(&self) {
        self.router.inner.initiators.lock().unwrap().insert(self.key);
    }

    fn register_responder(&self, binder: Binder) {
        self.router
            .inner
            .responders
            .lock()
            .unwrap()
            .insert(self.key, binder);
    }

    /// Unary initiator: one message, one reply.
    pub fn send<Req, Rep>(self) -> SendRoute<Req, Rep, C>
    where
        Req: Serialize + Send + 'static,
        Rep: DeserializeOwned + Send + 'static,
    {
        self.register_initiator();
        let initiate = Initiate::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            |_: &Task| Service::once(),
        );
        SendRoute {
            initiate: Arc::new(initiate),
            router_id: self.router.inner.id,
            key: self.key,
        }
    }

    /// Unary responder: `handler` answers each request.
    pub fn recv<Req, Rep, H, Fut>(self, handler: H)
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Rep> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint = Endpoint::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| {
                let service = Service::<Rep, Req>::once();
                let worker = service.clone();
                let handler = Arc::clone(&handler);
                async_std::task::spawn(async move {
                    if let Ok(request) = worker.take_external().await {
                        let reply = handler(request).await;
                        if !worker.load_internal(Some(reply)) {
                            tracing::warn!("reply discarded, session closed");
                        }
                    }
                });
                service
            },
        );
        let endpoint = Arc::new(endpoint);
        self.register_responder(Box::new(move |socket| endpoint.start(socket)));
    }

    /// Sequenced request/reply pairs; at most `capacity` in flight.
    pub fn send_channel<Req, Rep>(self, capacity: usize) -> SendChannelRoute<Req, Rep, C>
    where
        Req: Serialize + Send + 'static,
        Rep: DeserializeOwned + Send + 'static,
    {
        self.register_initiator();
        let initiate = Initiate::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| Service::many(capacity, capacity),
        );
        SendChannelRoute {
            initiate: Arc::new(initiate),
            capacity,
            router_id: self.router.inner.id,
            key: self.key,
        }
    }

    /// Channel responder: `handler` answers each message in series.
    pub fn recv_channel<Req, Rep, H, Fut>(self, capacity: usize, handler: H)
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Rep> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint = Endpoint::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| {
                let service = Service::<Rep, Req>::many(capacity, capacity);
                let worker = service.clone();
                let handler = Arc::clone(&handler);
                async_std::task::spawn(async move {
                    while let Ok(request) = worker.take_external().await {
                        let reply = handler(request).await;
                        if !worker.load_internal(Some(reply)) {
                            tracing::warn!("reply discarded, stopping channel worker");
                            break;
                        }
                    }
                });
                service
            },
        );
        let endpoint = Arc::new(endpoint);
        self.register_responder(Box::new(move |socket| endpoint.start(socket)));
    }

    /// One-way stream initiator; `capacity` bounds the outbound buffer.
    pub fn send_stream<T>(self, capacity: usize) -> SendStreamRoute<T, C>
    where
        T: Serialize + Send + 'static,
    {
        self.register_initiator();
        let initiate = Initiate::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| Service::many(capacity, 0),
        );
        SendStreamRoute {
            initiate: Arc::new(initiate),
            router_id: self.router.inner.id,
            key: self.key,
        }
    }

    /// One-way stream responder: `handler` consumes each session's items.
    pub fn recv_stream<T, H, Fut>(self, capacity: usize, handler: H)
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(StreamReceiver<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint = Endpoint::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |session_task: &Task| {
                let service = Service::<(), T>::many(0, capacity);
                let receiver = StreamReceiver {
                    service: service.clone(),
                    task: session_task.clone(),
                };
                let handler = Arc::clone(&handler);
                async_std::task::spawn(async move {
                    handler(receiver).await;
                });
                service
            },
        );
        let endpoint = Arc::new(endpoint);
        self.register_responder(Box::new(move |socket| endpoint.start(socket)));
    }

    /// Listen initiator: one request, a stream of replies buffered up to
    /// `buffer`.
    pub fn send_listen<Req, Item>(self, buffer: usize) -> SendListenRoute<Req, Item, C>
    where
        Req: Serialize + Send + 'static,
        Item: DeserializeOwned + Send + 'static,
    {
        self.register_initiator();
        let initiate = Initiate::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| Service::many(1, buffer),
        );
        SendListenRoute {
            initiate: Arc::new(initiate),
            router_id: self.router.inner.id,
            key: self.key,
        }
    }

    /// Listen responder: `handler` answers one request with a stream of
    /// items; the reply stream ends when it returns.
    pub fn recv_listen<Req, Item, H, Fut>(self, buffer: usize, handler: H)
    where
        Req: DeserializeOwned + Send + 'static,
        Item: Serialize + Send + 'static,
        H: Fn(Req, ListenReplier<Item, Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint = Endpoint::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| {
                let service = Service::<Item, Req>::many(buffer, 1);
                let worker = service.clone();
                let handler = Arc::clone(&handler);
                async_std::task::spawn(async move {
                    if let Ok(request) = worker.take_external().await {
                        let replier = ListenReplier {
                            service: worker.clone(),
                        };
                        handler(request, replier).await;
                        worker.load_internal(None);
                    }
                });
                service
            },
        );
        let endpoint = Arc::new(endpoint);
        self.register_responder(Box::new(move |socket| endpoint.start(socket)));
    }

    /// Duplex initiator: independent streams both ways.
    pub fn send_duplex<Out, In>(self, capacity: DuplexCapacity) -> SendDuplexRoute<Out, In, C>
    where
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
    {
        self.register_initiator();
        let initiate = Initiate::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |_: &Task| Service::many(capacity.send, capacity.recv),
        );
        SendDuplexRoute {
            initiate: Arc::new(initiate),
            router_id: self.router.inner.id,
            key: self.key,
        }
    }

    /// Duplex responder: `handler` drives its own side of the session.
    pub fn recv_duplex<In, Out, H, Fut>(self, capacity: DuplexCapacity, handler: H)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        H: Fn(DuplexHandle<Out, In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let endpoint = Endpoint::new(
            self.key,
            self.effective_config(),
            Arc::clone(&self.router.inner.codec),
            move |session_task: &Task| {
                let service = Service::<Out, In>::many(capacity.send, capacity.recv);
                let peer = DuplexHandle {
                    service: service.clone(),
                    task: session_task.clone(),
                };
                let handler = Arc::clone(&handler);
                async_std::task::spawn(async move {
                    handler(peer).await;
                });
                service
            },
        );
        let endpoint = Arc::new(endpoint);
        self.register_responder(Box::new(move |socket| endpoint.start(socket)));
    }
}

async fn race_take<I, E>(service: &Service<I, E>, task: &Task) -> Result<E, Cancelled> {
    let take = service.take_external();
    let resolved = task.resolved();
    futures::pin_mut!(take);
    futures::pin_mut!(resolved);
    match future::select(take, resolved).await {
        Either::Left((Ok(value), _)) => Ok(value),
        Either::Left((Err(QueueClosed), _)) => Err(Cancelled {
            reason: task
                .cancelled()
                .unwrap_or_else(|| "service closed".to_string()),
        }),
        Either::Right((reason, _)) => Err(Cancelled { reason }),
    }
}

/// Unary initiator surface.
pub struct SendRoute<Req, Rep, C = JsonCodec> {
    initiate: Arc<Initiate<Req, Rep, C>>,
    router_id: u64,
    key: u16,
}

impl<Req, Rep, C> SendRoute<Req, Rep, C>
where
    Req: Serialize + Send + 'static,
    Rep: DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub async fn call(&self, peer: &Peer, request: Req) -> Result<Rep, CallError> {
        peer.check(self.router_id, self.key)?;
        let session = peer.task.subtask();
        let service = self.initiate.start(&session, &peer.socket);
        if !service.load_internal(Some(request)) {
            session.cancel("send failed");
            return Err(CallError::SendFailed);
        }
        match race_take(&service, &session).await {
            Ok(reply) => Ok(reply),
            Err(Cancelled { reason }) => Err(CallError::Cancelled { reason }),
        }
    }
}

/// Channel initiator surface.
pub struct SendChannelRoute<Req, Rep, C = JsonCodec> {
    initiate: Arc<Initiate<Req, Rep, C>>,
    capacity: usize,
    router_id: u64,
    key: u16,
}

impl<Req, Rep, C> SendChannelRoute<Req, Rep, C>
where
    Req: Serialize + Send + 'static,
    Rep: DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub fn open(&self, peer: &Peer) -> Result<Channel<Req, Rep>, CallError> {
        peer.check(self.router_id, self.key)?;
        let task = peer.task.subtask();
        let service = self.initiate.start(&task, &peer.socket);
        Ok(Channel {
            service,
            task,
            capacity: self.capacity,
            pending: AtomicUsize::new(0),
        })
    }
}

/// One open channel session: sequenced pairs, at most `capacity` of them
/// awaiting replies.
pub struct Channel<Req, Rep> {
    service: Service<Req, Rep>,
    task: Task,
    capacity: usize,
    pending: AtomicUsize,
}

impl<Req, Rep> Channel<Req, Rep> {
    /// Admits `request` while fewer than `capacity` exchanges are in
    /// flight; returns false otherwise.
    pub fn send(&self, request: Req) -> bool {
        let admitted = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                if pending < self.capacity {
                    Some(pending + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !admitted {
            return false;
        }
        if !self.service.load_internal(Some(request)) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// The next reply, in send order.
    pub async fn reply(&self) -> Result<Rep, Cancelled> {
        let result = race_take(&self.service, &self.task).await;
        if result.is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Ends the outbound stream; the session closes after the last reply.
    pub fn finish(&self) -> bool {
        self.service.load_internal(None)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// One-way stream initiator surface.
pub struct SendStreamRoute<T, C = JsonCodec> {
    initiate: Arc<Initiate<T, (), C>>,
    router_id: u64,
    key: u16,
}

impl<T, C> SendStreamRoute<T, C>
where
    T: Serialize + Send + 'static,
    C: Codec,
{
    pub fn open(&self, peer: &Peer) -> Result<StreamSender<T>, CallError> {
        peer.check(self.router_id, self.key)?;
        let task = peer.task.subtask();
        let service = self.initiate.start(&task, &peer.socket);
        Ok(StreamSender { service, task })
    }
}

/// Sender half of a one-way stream session.
pub struct StreamSender<T> {
    service: Service<T, ()>,
    task: Task,
}

impl<T> StreamSender<T> {
    pub fn send(&self, item: T) -> bool {
        self.service.load_internal(Some(item))
    }

    pub fn finish(&self) -> bool {
        self.service.load_internal(None)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// Receiver handle passed to [Route::recv_stream] handlers.
pub struct StreamReceiver<T> {
    service: Service<(), T>,
    task: Task,
}

impl<T> StreamReceiver<T> {
    /// The next item, or `None` once the session is over.
    pub async fn next(&self) -> Option<T> {
        race_take(&self.service, &self.task).await.ok()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// Listen initiator surface.
pub struct SendListenRoute<Req, Item, C = JsonCodec> {
    initiate: Arc<Initiate<Req, Item, C>>,
    router_id: u64,
    key: u16,
}

impl<Req, Item, C> SendListenRoute<Req, Item, C>
where
    Req: Serialize + Send + 'static,
    Item: DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub fn open(&self, peer: &Peer, request: Req) -> Result<Listener<Req, Item>, CallError> {
        peer.check(self.router_id, self.key)?;
        let task = peer.task.subtask();
        let service = self.initiate.start(&task, &peer.socket);
        if !service.load_internal(Some(request)) {
            task.cancel("send failed");
            return Err(CallError::SendFailed);
        }
        Ok(Listener { service, task })
    }
}

/// Reply stream of one listen session.
pub struct Listener<Req, Item> {
    service: Service<Req, Item>,
    task: Task,
}

impl<Req, Item> Listener<Req, Item> {
    /// The next reply, or `None` once the session is over.
    pub async fn next(&self) -> Option<Item> {
        race_take(&self.service, &self.task).await.ok()
    }

    pub fn stop(&self) {
        self.task.cancel("listener stopped");
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// Reply handle passed to [Route::recv_listen] handlers.
pub struct ListenReplier<Item, Req> {
    service: Service<Item, Req>,
}

impl<Item, Req> ListenReplier<Item, Req> {
    pub fn send(&self, item: Item) -> bool {
        self.service.load_internal(Some(item))
    }
}

/// Duplex initiator surface.
pub struct SendDuplexRoute<Out, In, C = JsonCodec> {
    initiate: Arc<Initiate<Out, In, C>>,
    router_id: u64,
    key: u16,
}

impl<Out, In, C> SendDuplexRoute<Out, In, C>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub fn open(&self, peer: &Peer) -> Result<DuplexHandle<Out, In>, CallError> {
        peer.check(self.router_id, self.key)?;
        let task = peer.task.subtask();
        let service = self.initiate.start(&task, &peer.socket);
        Ok(DuplexHandle { service, task })
    }
}

/// One side of a duplex session: independent send and receive streams.
pub struct DuplexHandle<Out, In> {
    service: Service<Out, In>,
    task: Task,
}

impl<Out, In> DuplexHandle<Out, In> {
    pub fn send(&self, item: Out) -> bool {
        self.service.load_internal(Some(item))
    }

    /// The next inbound item, or `None` once the session is over.
    pub async fn next(&self) -> Option<In> {
        race_take(&self.service, &self.task).await.ok()
    }

    pub fn finish(&self) -> bool {
        self.service.load_internal(None)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }
}
