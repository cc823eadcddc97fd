//! Connection worker
//!
//! One task per physical connection. Frames are processed strictly in
//! arrival order; identity lookups run on their own task and their results
//! come back tagged with the generation they were started for.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::directory::{Directory, DirectoryError};
use crate::events::EventBus;
use crate::handle::ConnectionHandle;
use crate::handshake::{AuthOutcome, AuthRejection, IdentityBinder};
use crate::metrics::METRICS;
use crate::registry::ConnectionRegistry;
use crate::session::{CloseReason, Progress, Session};
use crate::transport::{ByteSink, ByteSource};

/// Shared state for every connection served by one engine
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub binder: Arc<IdentityBinder>,
    pub registry: Arc<ConnectionRegistry>,
    next_conn_id: AtomicU64,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        directory: Arc<dyn Directory>,
        events: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let binder = IdentityBinder::new(directory, Arc::clone(&events), Arc::clone(&config));
        let registry = ConnectionRegistry::new(events, config.publish_delay);
        Arc::new(Self {
            config,
            binder: Arc::new(binder),
            registry,
            next_conn_id: AtomicU64::new(1),
        })
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

type LookupResult = (u64, Result<AuthOutcome, DirectoryError>);

/// Serve one connection until it closes, returning why it closed
pub async fn serve_connection<S, K>(
    ctx: Arc<EngineContext>,
    peer: String,
    mut source: S,
    sink: K,
) -> CloseReason
where
    S: ByteSource,
    K: ByteSink + 'static,
{
    let conn_id = ctx.next_conn_id();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(Session::new(conn_id, Arc::clone(&ctx.config), out_tx));

    METRICS.active_connections.inc();
    info!(conn = conn_id, "Connection from {}", peer);

    let writer = tokio::spawn(write_loop(conn_id, out_rx, sink));
    let (lookup_tx, mut lookup_rx) = mpsc::unbounded_channel::<LookupResult>();
    let mut registered: Option<String> = None;

    let idle_timeout = ctx.config.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        let progress = tokio::select! {
            _ = &mut idle => break CloseReason::IdleTimeout,

            read = source.recv() => match read {
                Ok(Some(bytes)) => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    handle.with_session(|s| s.feed(&bytes))
                }
                Ok(None) => break CloseReason::TransportClosed,
                Err(e) => {
                    debug!(conn = conn_id, "Read failed: {}", e);
                    break CloseReason::Fatal(e.into());
                }
            },

            Some((generation, result)) = lookup_rx.recv() => {
                let outcome = result.unwrap_or_else(|e| {
                    error!(conn = conn_id, "Device provisioning failed: {}", e);
                    AuthOutcome::Rejected(AuthRejection::ProvisioningFailed(e.to_string()))
                });
                let Some(progress) = handle.with_session(|s| s.complete_auth(generation, outcome)) else {
                    continue;
                };
                if registered.is_none() {
                    if let Some(binding) = handle.binding() {
                        ctx.registry.register(&binding, handle.clone());
                        registered = Some(binding.device_key);
                    }
                }
                progress
            }
        };

        match progress {
            Progress::Continue => {}
            Progress::Authenticate(attempt) => {
                let binder = Arc::clone(&ctx.binder);
                let lookup_tx = lookup_tx.clone();
                tokio::spawn(async move {
                    let result = binder.bind(&attempt).await;
                    // The connection may be gone by now
                    let _ = lookup_tx.send((attempt.generation, result));
                });
            }
            Progress::Close(reason) => break reason,
        }
    };

    handle.with_session(|s| s.shutdown());
    if let Some(device_key) = registered {
        ctx.registry.unregister(&device_key, conn_id);
    }
    if let Err(e) = writer.await {
        warn!(conn = conn_id, "Writer task failed: {}", e);
    }

    METRICS.active_connections.dec();
    info!(conn = conn_id, "Connection from {} closed: {:?}", peer, reason);
    reason
}

/// Forward queued frames to the transport until the session lets go
async fn write_loop<K: ByteSink>(conn_id: u64, mut rx: mpsc::UnboundedReceiver<Bytes>, mut sink: K) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = sink.send(bytes).await {
            debug!(conn = conn_id, "Write failed: {}", e);
            break;
        }
    }
    if let Err(e) = sink.shutdown().await {
        debug!(conn = conn_id, "Shutdown failed: {}", e);
    }
}
