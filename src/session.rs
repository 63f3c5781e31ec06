//! HTTP/2 session lifecycle.
//!
//! Each accepted connection runs one session task: it drives the `h2`
//! server connection, spawns a dispatch task per incoming stream, and runs
//! the keepalive ping loop. The server requests closure through a
//! `SessionHandle`: graceful close drains in-flight streams behind a
//! GOAWAY, destroy resets them with RST_STREAM CANCEL.

use crate::metrics::{KEEPALIVE_TIMEOUTS, SESSIONS_ACTIVE};
use crate::server::{ServerInner, handle_stream};
use bytes::Bytes;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// How a session should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// GOAWAY, then drain in-flight streams.
    Graceful,
    /// Abrupt GOAWAY; in-flight streams are reset with CANCEL.
    Destroy,
}

/// Server-side handle to a live session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) id: u64,
    close: Arc<watch::Sender<Option<CloseMode>>>,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> (Self, watch::Receiver<Option<CloseMode>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                id,
                close: Arc::new(tx),
            },
            rx,
        )
    }

    /// Request closure. Destroy overrides a pending graceful close; a
    /// graceful request never downgrades a destroy.
    pub(crate) fn close(&self, mode: CloseMode) {
        self.close.send_if_modified(|current| match (*current, mode) {
            (None, mode) => {
                *current = Some(mode);
                true
            }
            (Some(CloseMode::Graceful), CloseMode::Destroy) => {
                *current = Some(CloseMode::Destroy);
                true
            }
            _ => false,
        });
    }
}

/// Drive one HTTP/2 session to completion.
pub(crate) async fn run_session<T>(
    inner: Arc<ServerInner>,
    io: T,
    handle: SessionHandle,
    mut close_rx: watch::Receiver<Option<CloseMode>>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = handle.id;
    let mut builder = h2::server::Builder::new();
    if let Some(size) = inner.options.max_frame_size {
        // h2 rejects values outside the protocol's legal range.
        builder.max_frame_size(size.clamp(16_384, 16_777_215));
    }
    if let Some(streams) = inner.options.max_concurrent_streams {
        builder.max_concurrent_streams(streams);
    }

    let mut conn = match builder.handshake::<_, Bytes>(io).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(session = session_id, "HTTP/2 handshake failed: {}", e);
            inner.remove_session(session_id);
            SESSIONS_ACTIVE.decrement();
            return;
        }
    };

    let keepalive = conn.ping_pong().map(|ping_pong| {
        tokio::spawn(keepalive_loop(
            ping_pong,
            inner.options.keepalive_time,
            inner.options.keepalive_timeout,
            handle.clone(),
        ))
    });

    loop {
        tokio::select! {
            accepted = conn.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    tokio::spawn(handle_stream(inner.clone(), request, respond));
                }
                Some(Err(e)) => {
                    tracing::debug!(session = session_id, "session error: {}", e);
                    break;
                }
                None => break,
            },
            changed = close_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match *close_rx.borrow_and_update() {
                    Some(CloseMode::Graceful) => conn.graceful_shutdown(),
                    Some(CloseMode::Destroy) => {
                        conn.abrupt_shutdown(h2::Reason::CANCEL);
                        break;
                    }
                    None => {}
                }
            }
        }
    }

    // Keep driving the connection so in-flight streams finish (or observe
    // their reset).
    if let Err(e) = poll_fn(|cx| conn.poll_closed(cx)).await {
        tracing::debug!(session = session_id, "session closed with error: {}", e);
    }

    if let Some(task) = keepalive {
        task.abort();
    }
    inner.remove_session(session_id);
    SESSIONS_ACTIVE.decrement();
    tracing::debug!(session = session_id, "session closed");
}

/// Periodic keepalive: ping every `interval`; a pong that does not arrive
/// within `timeout` destroys the session.
async fn keepalive_loop(
    mut ping_pong: h2::PingPong,
    interval: Duration,
    timeout: Duration,
    handle: SessionHandle,
) {
    loop {
        tokio::time::sleep(interval).await;
        match tokio::time::timeout(timeout, ping_pong.ping(h2::Ping::opaque())).await {
            Ok(Ok(_pong)) => {}
            Ok(Err(e)) => {
                tracing::debug!(session = handle.id, "keepalive ping failed: {}", e);
                return;
            }
            Err(_) => {
                tracing::info!(
                    session = handle.id,
                    "keepalive ping timed out, destroying session"
                );
                KEEPALIVE_TIMEOUTS.increment();
                handle.close(CloseMode::Destroy);
                return;
            }
        }
    }
}
