//! The four call shapes.
//!
//! Each registered method is erased into a dispatch function that drives a
//! `ServerCall` through the shape's protocol: the unary read prelude, the
//! readable and writable halves, and the terminal status. Deserialization
//! advances strictly one frame at a time so messages reach user code in
//! wire order.

use crate::call::{CallReceiver, CallResponder, CancelHandle, CancelReason, ServerCall};
use crate::metadata::Metadata;
use crate::metrics::CALLS_FAILED;
use crate::service::{BoxFuture, DeserializeFn, DispatchFn, SerializeFn};
use crate::status::Status;
use std::future::Future;
use std::sync::Arc;

/// A successful unary-shaped response: the message plus optional trailing
/// metadata installed on the final status.
#[derive(Debug)]
pub struct MethodResponse<T> {
    pub message: T,
    pub trailers: Option<Metadata>,
}

impl<T> MethodResponse<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            trailers: None,
        }
    }

    pub fn with_trailers(message: T, trailers: Metadata) -> Self {
        Self {
            message,
            trailers: Some(trailers),
        }
    }
}

impl<T> From<T> for MethodResponse<T> {
    fn from(message: T) -> Self {
        Self::new(message)
    }
}

/// Per-call context handed to every handler.
#[derive(Clone)]
pub struct CallContext {
    metadata: Metadata,
    path: String,
    cancel: CancelHandle,
    responder: CallResponder,
}

impl CallContext {
    /// Request metadata, after transport headers have been stripped.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The method path of this call.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the call has been cancelled by the peer, a deadline, or
    /// server shutdown.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation reason, once cancelled.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel.reason()
    }

    /// Resolve when the call is cancelled. Handlers that observe this
    /// should stop producing.
    pub async fn cancelled(&self) -> CancelReason {
        self.cancel.cancelled().await
    }

    /// Send the response headers with custom metadata. Headers go out at
    /// most once; later calls are no-ops.
    pub async fn send_metadata(&self, metadata: Metadata) -> Result<(), Status> {
        self.responder.send_metadata(&metadata).await
    }
}

/// Readable half of a client-streaming or bidi call.
pub struct RequestStream<Req> {
    receiver: CallReceiver,
    deserialize: DeserializeFn<Req>,
    finished: bool,
}

impl<Req> RequestStream<Req> {
    /// The next request message, in wire order, or None at end of stream.
    /// A deserialization failure yields INTERNAL and discards everything
    /// still buffered behind it.
    pub async fn next(&mut self) -> Option<Result<Req, Status>> {
        if self.finished {
            return None;
        }
        match self.receiver.next_message().await {
            None => {
                self.finished = true;
                None
            }
            Some(Ok(raw)) => match (self.deserialize)(&raw) {
                Ok(message) => Some(Ok(message)),
                Err(e) => {
                    self.finished = true;
                    self.receiver.discard_pending();
                    Some(Err(Status::internal(format!(
                        "Error deserializing request: {}",
                        e
                    ))))
                }
            },
            Some(Err(status)) => {
                self.finished = true;
                Some(Err(status))
            }
        }
    }
}

/// Writable half of a server-streaming or bidi call. Writes wait for
/// transport capacity, so a slow peer backpressures the handler.
pub struct ServerWriter<Res> {
    responder: CallResponder,
    serialize: SerializeFn<Res>,
}

impl<Res> Clone for ServerWriter<Res> {
    fn clone(&self) -> Self {
        Self {
            responder: self.responder.clone(),
            serialize: self.serialize.clone(),
        }
    }
}

impl<Res> ServerWriter<Res> {
    /// Serialize, frame, and send one response message.
    pub async fn send(&mut self, message: &Res) -> Result<(), Status> {
        let raw = (self.serialize)(message)
            .map_err(|e| Status::internal(format!("Error serializing message: {}", e)))?;
        self.responder.send_serialized(&raw).await
    }
}

fn split_call(call: ServerCall) -> (CallContext, CallReceiver, CallResponder) {
    let responder = call.responder.clone();
    let context = CallContext {
        metadata: call.metadata,
        path: call.path,
        cancel: call.cancel,
        responder: call.responder,
    };
    (context, call.receiver, responder)
}

async fn finish_with_error(responder: &CallResponder, status: Status) {
    CALLS_FAILED.increment();
    if let Err(e) = responder.fail(status).await {
        tracing::debug!("failed to send error status: {}", e);
    }
}

async fn send_unary_response<Res>(
    responder: &CallResponder,
    serialize: &SerializeFn<Res>,
    response: MethodResponse<Res>,
) {
    let raw = match (serialize)(&response.message) {
        Ok(raw) => raw,
        Err(e) => {
            finish_with_error(
                responder,
                Status::internal(format!("Error serializing message: {}", e)),
            )
            .await;
            return;
        }
    };
    if let Err(status) = responder.finish_unary(&raw, response.trailers).await {
        finish_with_error(responder, status).await;
    }
}

/// Build the dispatch function for a unary method.
pub(crate) fn unary<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + Sync + 'static,
    F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MethodResponse<Res>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |call: ServerCall| -> BoxFuture<'static, ()> {
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let (context, mut receiver, responder) = split_call(call);
            let raw = match receiver.receive_unary_message().await {
                Ok(raw) => raw,
                Err(status) => {
                    finish_with_error(&responder, status).await;
                    return;
                }
            };
            let request = match (deserialize)(&raw) {
                Ok(request) => request,
                Err(e) => {
                    finish_with_error(
                        &responder,
                        Status::internal(format!("Error deserializing request: {}", e)),
                    )
                    .await;
                    return;
                }
            };
            match handler(request, context).await {
                Ok(response) => send_unary_response(&responder, &serialize, response).await,
                Err(status) => finish_with_error(&responder, status).await,
            }
        })
    })
}

/// Build the dispatch function for a client-streaming method.
pub(crate) fn client_streaming<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + Sync + 'static,
    F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MethodResponse<Res>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |call: ServerCall| -> BoxFuture<'static, ()> {
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let (context, receiver, responder) = split_call(call);
            let stream = RequestStream {
                receiver,
                deserialize,
                finished: false,
            };
            match handler(stream, context).await {
                Ok(response) => send_unary_response(&responder, &serialize, response).await,
                Err(status) => finish_with_error(&responder, status).await,
            }
        })
    })
}

/// Build the dispatch function for a server-streaming method. The handler's
/// Ok value is the trailing metadata for the final status.
pub(crate) fn server_streaming<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + Sync + 'static,
    F: Fn(Req, ServerWriter<Res>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Metadata>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |call: ServerCall| -> BoxFuture<'static, ()> {
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let (context, mut receiver, responder) = split_call(call);
            let raw = match receiver.receive_unary_message().await {
                Ok(raw) => raw,
                Err(status) => {
                    finish_with_error(&responder, status).await;
                    return;
                }
            };
            let request = match (deserialize)(&raw) {
                Ok(request) => request,
                Err(e) => {
                    finish_with_error(
                        &responder,
                        Status::internal(format!("Error deserializing request: {}", e)),
                    )
                    .await;
                    return;
                }
            };
            let writer = ServerWriter {
                responder: responder.clone(),
                serialize,
            };
            match handler(request, writer, context).await {
                Ok(trailers) => {
                    if let Err(e) = responder.end_stream(trailers).await {
                        tracing::debug!("failed to complete stream: {}", e);
                    }
                }
                Err(status) => finish_with_error(&responder, status).await,
            }
        })
    })
}

/// Build the dispatch function for a bidi-streaming method: readable and
/// writable concurrently, with no unary prelude.
pub(crate) fn bidi_streaming<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + Sync + 'static,
    F: Fn(RequestStream<Req>, ServerWriter<Res>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Metadata>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |call: ServerCall| -> BoxFuture<'static, ()> {
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let (context, receiver, responder) = split_call(call);
            let stream = RequestStream {
                receiver,
                deserialize,
                finished: false,
            };
            let writer = ServerWriter {
                responder: responder.clone(),
                serialize,
            };
            match handler(stream, writer, context).await {
                Ok(trailers) => {
                    if let Err(e) = responder.end_stream(trailers).await {
                        tracing::debug!("failed to complete stream: {}", e);
                    }
                }
                Err(status) => finish_with_error(&responder, status).await,
            }
        })
    })
}

/// Synthetic handler for a method descriptor registered without an
/// implementation.
pub(crate) fn unimplemented(path: String) -> DispatchFn {
    Arc::new(move |call: ServerCall| -> BoxFuture<'static, ()> {
        let path = path.clone();
        Box::pin(async move {
            let (_context, _receiver, responder) = split_call(call);
            finish_with_error(
                &responder,
                Status::unimplemented(format!(
                    "The server does not implement the method {}",
                    path
                )),
            )
            .await;
        })
    })
}
