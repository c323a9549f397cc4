//! WebSocket transport adapter.
//!
//! Binary messages carry protocol frames; text messages are ignored.
//! When the connection closes or fails the socket is fully unlinked.

use async_tungstenite::tungstenite::Message as WsMessage;
use async_tungstenite::WebSocketStream;
use futures::io::{AsyncRead, AsyncWrite};
use futures::prelude::*;

use super::VirtualSocket;

/// Drives `socket` over an established WebSocket connection until the
/// connection goes away.
pub async fn run<S>(ws: WebSocketStream<S>, socket: VirtualSocket) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (sender, mut receiver) = futures::channel::mpsc::unbounded::<WsMessage>();

    let outbound = sender.clone();
    socket.connect_sink(move |bytes| {
        let _ = outbound.unbounded_send(WsMessage::Binary(bytes));
    })?;

    let writer = async_std::task::spawn(async move {
        while let Some(message) = receiver.next().await {
            if let Err(error) = ws_sink.send(message).await {
                tracing::debug!(%error, "websocket send failed");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(WsMessage::Binary(data)) => socket.deliver(&data),
            Ok(WsMessage::Text(_)) => tracing::trace!("ignoring text message"),
            Ok(WsMessage::Ping(data)) => {
                let _ = sender.unbounded_send(WsMessage::Pong(data));
            }
            Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) => break,
            Err(error) => {
                tracing::debug!(%error, "websocket receive failed");
                break;
            }
        }
    }

    socket.unlink_all();
    drop(sender);
    writer.await;
    Ok(())
}

/// Connects to `url` and drives `socket` over the connection.
pub async fn connect(url: &str, socket: VirtualSocket) -> anyhow::Result<()> {
    let (ws, _response) = async_tungstenite::async_std::connect_async(url).await?;
    run(ws, socket).await
}

/// Accepts a WebSocket handshake on `stream` and drives `socket` over it.
pub async fn accept(
    stream: async_std::net::TcpStream,
    socket: VirtualSocket,
) -> anyhow::Result<()> {
    let ws = async_tungstenite::accept_async(stream).await?;
    run(ws, socket).await
}
