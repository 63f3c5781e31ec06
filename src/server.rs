//! The gRPC server: listener binding, stream dispatch, and shutdown.
//!
//! Lifecycle: Unbound -> Bound (one or more listeners) -> Started ->
//! ShuttingDown -> Closed. Services may be added only before start. Each
//! listener gets an accept loop task; each connection a session task; each
//! stream a dispatch task that runs the registered handler under the call's
//! deadline and the server's forced-shutdown signal.

use crate::call::{
    CancelHandle, CancelReason, ServerCall, receive_request_metadata, respond_trailers_only,
};
use crate::compression::CompressionFilter;
use crate::credentials::{CredentialsError, ServerCredentials};
use crate::logging;
use crate::metrics::{CALLS_DISPATCHED, CALLS_FAILED, SESSIONS_ACCEPTED, SESSIONS_ACTIVE};
use crate::options::ServerOptions;
use crate::resolver::{ListenTarget, TargetError, parse_target};
use crate::service::{HandlerRegistry, ServiceDefinition};
use crate::session::{CloseMode, SessionHandle, run_session};
use crate::status::Status;
use bytes::Bytes;
use futures::FutureExt;
use h2::RecvStream;
use h2::server::SendResponse;
use http::Request;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Errors surfaced by server lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("server is not bound to any listening address")]
    NotBound,
    #[error("server is already started")]
    AlreadyStarted,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("method {0:?} is already registered")]
    DuplicateMethod(String),
    #[error("services cannot be added once the server has started")]
    ServicesFrozen,
}

enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

struct BoundListener {
    socket: Option<ListenerSocket>,
    tls: Option<TlsAcceptor>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shutting_down: bool,
    listeners: Vec<BoundListener>,
    accept_tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct ServerInner {
    pub(crate) options: ServerOptions,
    registry: RwLock<HandlerRegistry>,
    lifecycle: Mutex<Lifecycle>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_session_id: AtomicU64,
    force: CancelHandle,
}

impl ServerInner {
    fn new_session(&self) -> (SessionHandle, tokio::sync::watch::Receiver<Option<CloseMode>>) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = SessionHandle::new(id);
        self.sessions.lock().unwrap().insert(id, handle.clone());
        (handle, rx)
    }

    pub(crate) fn remove_session(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }
}

/// A gRPC server.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with the given options.
    pub fn new(options: ServerOptions) -> Self {
        logging::init();
        Self {
            inner: Arc::new(ServerInner {
                options,
                registry: RwLock::new(HandlerRegistry::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
                sessions: Mutex::new(HashMap::new()),
                session_tasks: Mutex::new(Vec::new()),
                next_session_id: AtomicU64::new(0),
                force: CancelHandle::new(),
            }),
        }
    }

    /// Register a service's methods. Fails after `start`, and on any
    /// duplicate method path.
    pub fn add_service(&self, service: ServiceDefinition) -> Result<(), ServerError> {
        if self.inner.lifecycle.lock().unwrap().started {
            return Err(ServerError::ServicesFrozen);
        }
        let mut registry = self.inner.registry.write().unwrap();
        let mut incoming = HashSet::new();
        for (path, _) in &service.methods {
            if registry.contains(path) || !incoming.insert(path.clone()) {
                return Err(ServerError::DuplicateMethod(path.clone()));
            }
        }
        for (path, method) in service.methods {
            registry.register(&path, method);
        }
        Ok(())
    }

    /// Bind a listener for `target`. Additive: a server may listen on any
    /// number of addresses. Returns the actual bound port (0 for Unix
    /// sockets).
    pub async fn bind(
        &self,
        target: &str,
        creds: ServerCredentials,
    ) -> Result<u16, ServerError> {
        {
            let lifecycle = self.inner.lifecycle.lock().unwrap();
            if lifecycle.shutting_down {
                return Err(ServerError::ShuttingDown);
            }
            if lifecycle.started {
                return Err(ServerError::AlreadyStarted);
            }
        }

        let tls = creds.server_config()?.map(TlsAcceptor::from);
        let (socket, port) = match parse_target(target, creds.is_secure())? {
            ListenTarget::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port)).await?;
                let port = listener.local_addr()?.port();
                (ListenerSocket::Tcp(listener), port)
            }
            ListenTarget::Unix { path } => (ListenerSocket::Unix(UnixListener::bind(&path)?), 0),
        };

        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.shutting_down {
            return Err(ServerError::ShuttingDown);
        }
        lifecycle.listeners.push(BoundListener {
            socket: Some(socket),
            tls,
        });
        tracing::info!(address = target, port, "listener bound");
        Ok(port)
    }

    /// Start serving. Fails when not bound, already started, or shutting
    /// down. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if lifecycle.shutting_down {
            return Err(ServerError::ShuttingDown);
        }
        if lifecycle.started {
            return Err(ServerError::AlreadyStarted);
        }
        if lifecycle.listeners.is_empty()
            || lifecycle.listeners.iter().any(|l| l.socket.is_none())
        {
            return Err(ServerError::NotBound);
        }

        let mut tasks = Vec::with_capacity(lifecycle.listeners.len());
        for bound in &mut lifecycle.listeners {
            let tls = bound.tls.clone();
            let inner = self.inner.clone();
            let task = match bound.socket.take() {
                Some(ListenerSocket::Tcp(listener)) => {
                    tokio::spawn(accept_loop_tcp(inner, listener, tls))
                }
                Some(ListenerSocket::Unix(listener)) => {
                    tokio::spawn(accept_loop_unix(inner, listener, tls))
                }
                None => continue,
            };
            tasks.push(task);
        }
        lifecycle.accept_tasks = tasks;
        lifecycle.started = true;
        tracing::info!("server started");
        Ok(())
    }

    /// Graceful shutdown: stop accepting, ask every live session to drain,
    /// and resolve once all of them have closed. Idempotent with itself and
    /// with `force_shutdown`; resolves immediately when nothing is open.
    pub async fn shutdown(&self) {
        let accept_tasks = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            lifecycle.started = false;
            lifecycle.shutting_down = true;
            lifecycle.listeners.clear();
            std::mem::take(&mut lifecycle.accept_tasks)
        };
        // The accept tasks own the listener sockets; await them so the
        // listeners are closed by the time shutdown resolves.
        for task in accept_tasks {
            task.abort();
            let _ = task.await;
        }

        let handles: Vec<SessionHandle> =
            self.inner.sessions.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.close(CloseMode::Graceful);
        }

        let tasks = std::mem::take(&mut *self.inner.session_tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("server shut down");
    }

    /// Forced shutdown: close listeners and destroy every live session,
    /// resetting in-flight streams with CANCEL. Pending handlers observe
    /// cancellation with the "cancelled" reason.
    pub fn force_shutdown(&self) {
        let accept_tasks = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            lifecycle.started = false;
            lifecycle.shutting_down = true;
            lifecycle.listeners.clear();
            std::mem::take(&mut lifecycle.accept_tasks)
        };
        for task in accept_tasks {
            task.abort();
        }

        self.inner.force.cancel(CancelReason::Cancelled);

        let handles: Vec<SessionHandle> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.close(CloseMode::Destroy);
        }
        tracing::info!("server force shut down");
    }
}

async fn accept_loop_tcp(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(peer = %peer, "accepted connection");
                launch_session(&inner, stream, tls.clone());
            }
            Err(e) => {
                tracing::error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_loop_unix(
    inner: Arc<ServerInner>,
    listener: UnixListener,
    tls: Option<TlsAcceptor>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tracing::debug!("accepted unix connection");
                launch_session(&inner, stream, tls.clone());
            }
            Err(e) => {
                tracing::error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn launch_session<T>(inner: &Arc<ServerInner>, io: T, tls: Option<TlsAcceptor>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    SESSIONS_ACCEPTED.increment();
    SESSIONS_ACTIVE.increment();
    let (handle, close_rx) = inner.new_session();
    let session_id = handle.id;
    let task_inner = inner.clone();
    let task = tokio::spawn(async move {
        match tls {
            Some(acceptor) => match acceptor.accept(io).await {
                Ok(tls_stream) => run_session(task_inner, tls_stream, handle, close_rx).await,
                Err(e) => {
                    tracing::debug!(session = session_id, "TLS handshake failed: {}", e);
                    task_inner.remove_session(session_id);
                    SESSIONS_ACTIVE.decrement();
                }
            },
            None => run_session(task_inner, io, handle, close_rx).await,
        }
    });
    inner.session_tasks.lock().unwrap().push(task);
}

/// Dispatch one incoming HTTP/2 stream.
pub(crate) async fn handle_stream(
    inner: Arc<ServerInner>,
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
) {
    CALLS_DISPATCHED.increment();
    let (parts, recv) = request.into_parts();

    // An invalid content-type is an HTTP-level rejection with no gRPC
    // trailers.
    let content_type_ok = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/grpc"));
    if !content_type_ok {
        if let Ok(response) = http::Response::builder()
            .status(http::StatusCode::UNSUPPORTED_MEDIA_TYPE)
            .body(())
        {
            let _ = respond.send_response(response, true);
        }
        return;
    }

    let path = parts.uri.path().to_string();
    let method = { inner.registry.read().unwrap().lookup(&path) };
    let Some(method) = method else {
        CALLS_FAILED.increment();
        respond_trailers_only(
            &mut respond,
            &Status::unimplemented(format!("The server does not implement the method {}", path)),
        );
        return;
    };

    let mut compression = CompressionFilter::new();
    let (metadata, deadline) = match receive_request_metadata(&parts.headers, &mut compression) {
        Ok(parsed) => parsed,
        Err(status) => {
            CALLS_FAILED.increment();
            respond_trailers_only(&mut respond, &status);
            return;
        }
    };

    let call = ServerCall::new(
        path,
        metadata,
        deadline,
        compression,
        recv,
        respond,
        &inner.options,
    );
    let responder = call.responder.clone();
    let cancel = call.cancel.clone();
    let force = inner.force.clone();

    enum Outcome {
        Completed,
        Panicked,
        DeadlineFired,
        ForcedShutdown,
    }

    // Resolve the race first: when a non-handler branch wins, the select
    // expression drops the handler future (releasing any sink lock it
    // holds) before trailers are emitted below.
    let outcome = {
        let handler = std::panic::AssertUnwindSafe((method.dispatch)(call)).catch_unwind();
        let deadline_timer = async move {
            match deadline {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = handler => match result {
                Ok(()) => Outcome::Completed,
                Err(_) => Outcome::Panicked,
            },
            _ = deadline_timer => Outcome::DeadlineFired,
            _ = force.cancelled() => Outcome::ForcedShutdown,
        }
    };

    match outcome {
        Outcome::Completed => {}
        Outcome::Panicked => {
            CALLS_FAILED.increment();
            if let Err(e) = responder.fail(Status::internal("Internal server error")).await {
                tracing::debug!("failed to report handler panic: {}", e);
            }
        }
        Outcome::DeadlineFired => {
            CALLS_FAILED.increment();
            // Cancel first so writers spawned by the handler stop holding
            // the sink, then emit the deadline status.
            cancel.cancel(CancelReason::Deadline);
            if let Err(e) = responder.fail(Status::deadline_exceeded("Deadline exceeded")).await {
                tracing::debug!("failed to report deadline: {}", e);
            }
        }
        Outcome::ForcedShutdown => {
            cancel.cancel(CancelReason::Cancelled);
        }
    }
}
