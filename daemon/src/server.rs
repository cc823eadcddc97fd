//! TCP and WebSocket listeners

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use mps_engine::{ByteSink, ByteSource, EngineContext, serve_connection, split_stream};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Accept raw TCP tunnels
pub async fn run_tcp(bind: SocketAddr, ctx: Arc<EngineContext>, limit: Arc<Semaphore>) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("APF listener on {}", bind);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
            warn!("Connection limit reached, refusing {}", addr);
            continue;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let (source, sink) = split_stream(stream);
            serve_connection(ctx, addr.to_string(), source, sink).await;
            drop(permit);
        });
    }
}

/// Accept tunnels carried in WebSocket binary messages
pub async fn run_ws(bind: SocketAddr, ctx: Arc<EngineContext>, limit: Arc<Semaphore>) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("WebSocket listener on {}", bind);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
            warn!("Connection limit reached, refusing {}", addr);
            continue;
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WS accept error from {}: {}", addr, e);
                    return;
                }
            };
            let (tx, rx) = ws.split();
            serve_connection(ctx, addr.to_string(), WsSource { rx }, WsSink { tx }).await;
            drop(permit);
        });
    }
}

/// Binary messages of a WebSocket as a byte stream
pub struct WsSource<S> {
    rx: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> ByteSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        while let Some(msg) = self.rx.next().await {
            match msg.map_err(io::Error::other)? {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Close(_) => return Ok(None),
                Message::Text(_) => debug!("Ignoring text message"),
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Frames sent as WebSocket binary messages
pub struct WsSink<S> {
    tx: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> ByteSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(Message::Binary(data))
            .await
            .map_err(io::Error::other)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.close().await.map_err(io::Error::other)
    }
}
