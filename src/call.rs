//! Per-stream call state.
//!
//! A `ServerCall` owns one HTTP/2 stream. The receive half pulls DATA
//! through the stream decoder and the compression filter; the send half
//! (`CallSink`) lives behind a shared mutex so the deadline and shutdown
//! paths can emit trailers while a handler future is being torn down.
//! Cancellation is a one-shot signal, not a back-pointer: peer RST_STREAM,
//! deadline expiry, and forced shutdown all converge on the same
//! `CancelHandle`.

use crate::compression::{CompressionFilter, GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER};
use crate::frame::{FramedMessage, StreamDecoder};
use crate::metadata::Metadata;
use crate::options::ServerOptions;
use crate::status::{Status, encode_grpc_message};
use bytes::Bytes;
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Response};
use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

pub(crate) const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
const GRPC_STATUS_HEADER: HeaderName = HeaderName::from_static("grpc-status");
const GRPC_MESSAGE_HEADER: HeaderName = HeaderName::from_static("grpc-message");
const GRPC_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/grpc+proto");

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Peer reset or server shutdown.
    Cancelled,
    /// The call's deadline fired.
    Deadline,
}

impl CancelReason {
    /// The reason string delivered to user code.
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Cancelled => "cancelled",
            CancelReason::Deadline => "deadline",
        }
    }
}

/// One-shot cancellation signal shared by every half of a call.
#[derive(Debug, Clone)]
pub(crate) struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Record the cancellation. The first reason wins.
    pub(crate) fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    /// Resolve once the call is cancelled.
    pub(crate) async fn cancelled(&self) -> CancelReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CancelReason::Cancelled;
            }
        }
    }
}

/// Parse a `grpc-timeout` header value: one to eight digits followed by a
/// unit (H, M, S, m, u, n), truncated to whole milliseconds.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let millis = match unit {
        "H" => amount.checked_mul(3_600_000)?,
        "M" => amount.checked_mul(60_000)?,
        "S" => amount.checked_mul(1_000)?,
        "m" => amount,
        "u" => amount / 1_000,
        "n" => amount / 1_000_000,
        _ => return None,
    };
    Some(Duration::from_millis(millis))
}

/// Convert request headers to call metadata: run the compression filter,
/// extract the deadline, and strip the transport-level headers. An invalid
/// `grpc-timeout` aborts the call with OUT_OF_RANGE.
pub(crate) fn receive_request_metadata(
    headers: &HeaderMap,
    filter: &mut CompressionFilter,
) -> Result<(Metadata, Option<Duration>), Status> {
    let mut metadata = Metadata::from_http2_headers(headers);
    filter.receive_metadata(&mut metadata)?;
    let deadline = match metadata.get_text(GRPC_TIMEOUT_HEADER) {
        Some(raw) => {
            Some(parse_timeout(raw).ok_or_else(|| Status::out_of_range("Invalid deadline"))?)
        }
        None => None,
    };
    metadata.remove(GRPC_TIMEOUT_HEADER);
    metadata.remove("content-type");
    Ok((metadata, deadline))
}

fn h2_error_status(error: &h2::Error, cancel: &CancelHandle) -> Status {
    if error.is_reset() || error.is_io() || error.is_go_away() {
        cancel.cancel(CancelReason::Cancelled);
        Status::cancelled("Call cancelled")
    } else {
        Status::internal(format!("HTTP/2 stream error: {}", error))
    }
}

/// Send half of a call. Response headers are sent at most once and trailers
/// exactly once per completed stream.
pub(crate) struct CallSink {
    respond: SendResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
    compression: CompressionFilter,
    status: Status,
    cancel: CancelHandle,
    metadata_sent: bool,
    trailers_sent: bool,
}

impl CallSink {
    fn new(respond: SendResponse<Bytes>, compression: CompressionFilter, cancel: CancelHandle) -> Self {
        Self {
            respond,
            send: None,
            compression,
            status: Status::ok(),
            cancel,
            metadata_sent: false,
            trailers_sent: false,
        }
    }

    fn terminated(&self) -> bool {
        self.trailers_sent || self.cancel.is_cancelled()
    }

    pub(crate) fn compression_write(&self, raw: &[u8]) -> Result<Bytes, Status> {
        self.compression.write_message(raw, true)
    }

    pub(crate) fn set_status_metadata(&mut self, metadata: Metadata) {
        if self.status.metadata().is_none() {
            self.status = self.status.clone().with_metadata(metadata);
        }
    }

    /// Send the response headers. Idempotent; a no-op once the call has
    /// terminated.
    pub(crate) fn send_metadata(&mut self, custom: Option<&Metadata>) -> Result<(), Status> {
        if self.metadata_sent || self.terminated() {
            return Ok(());
        }
        let mut response = Response::new(());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, GRPC_CONTENT_TYPE);
        if let Ok(value) = HeaderValue::from_str(self.compression.send_encoding().name()) {
            headers.insert(GRPC_ENCODING_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.compression.accept_list()) {
            headers.insert(GRPC_ACCEPT_ENCODING_HEADER, value);
        }
        if let Some(metadata) = custom {
            for (name, value) in metadata.to_http2_headers().iter() {
                headers.append(name, value.clone());
            }
        }
        match self.respond.send_response(response, false) {
            Ok(stream) => {
                self.send = Some(stream);
                self.metadata_sent = true;
                Ok(())
            }
            Err(e) => Err(self.note_h2_error(e)),
        }
    }

    /// Write one framed message, waiting for transport capacity. A no-op
    /// once the call has terminated.
    pub(crate) async fn write_frame(&mut self, frame: Bytes) -> Result<(), Status> {
        if self.terminated() {
            return Ok(());
        }
        self.send_metadata(None)?;
        let cancel = self.cancel.clone();
        let Some(send) = self.send.as_mut() else {
            return Ok(());
        };

        let mut data = frame;
        let mut failure: Option<h2::Error> = None;
        while !data.is_empty() {
            send.reserve_capacity(data.len());
            let granted = tokio::select! {
                capacity = poll_fn(|cx| send.poll_capacity(cx)) => match capacity {
                    Some(Ok(n)) => n,
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => {
                        // Stream closed while waiting for the window.
                        cancel.cancel(CancelReason::Cancelled);
                        return Ok(());
                    }
                },
                _ = cancel.cancelled() => return Ok(()),
            };
            if granted == 0 {
                continue;
            }
            let chunk = data.split_to(granted.min(data.len()));
            if let Err(e) = send.send_data(chunk, false) {
                failure = Some(e);
                break;
            }
        }

        match failure {
            Some(e) => Err(self.note_h2_error(e)),
            None => Ok(()),
        }
    }

    /// Complete the stream with the current status. A no-op once cancelled.
    pub(crate) fn end_call(&mut self) -> Result<(), Status> {
        if self.terminated() {
            return Ok(());
        }
        self.emit_trailers()
    }

    /// Terminal error path: record the status and emit trailers. Only the
    /// first terminal status wins; later failures are dropped silently.
    pub(crate) fn fail_call(&mut self, status: Status) -> Result<(), Status> {
        if self.trailers_sent {
            return Ok(());
        }
        self.status = status;
        self.emit_trailers()
    }

    fn emit_trailers(&mut self) -> Result<(), Status> {
        self.trailers_sent = true;
        if !self.metadata_sent {
            // Nothing was written on this stream: the status rides in the
            // response headers (trailers-only).
            self.metadata_sent = true;
            let mut response = Response::new(());
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, GRPC_CONTENT_TYPE);
            append_status_headers(headers, &self.status);
            return match self.respond.send_response(response, true) {
                Ok(_) => Ok(()),
                Err(e) => Err(self.note_h2_error(e)),
            };
        }
        let Some(send) = self.send.as_mut() else {
            return Ok(());
        };
        let mut trailers = HeaderMap::new();
        append_status_headers(&mut trailers, &self.status);
        match send.send_trailers(trailers) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.note_h2_error(e)),
        }
    }

    /// A transport error means no further frames can be sent; resets mark
    /// the call cancelled.
    fn note_h2_error(&mut self, error: h2::Error) -> Status {
        self.trailers_sent = true;
        h2_error_status(&error, &self.cancel)
    }
}

fn append_status_headers(headers: &mut HeaderMap, status: &Status) {
    if let Ok(value) = HeaderValue::from_str(&status.code().as_u32().to_string()) {
        headers.insert(GRPC_STATUS_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&encode_grpc_message(status.details())) {
        headers.insert(GRPC_MESSAGE_HEADER, value);
    }
    if let Some(metadata) = status.metadata() {
        for (name, value) in metadata.to_http2_headers().iter() {
            headers.append(name, value.clone());
        }
    }
}

/// Send a status on a stream that never produced a `CallSink` (unknown
/// method, invalid metadata).
pub(crate) fn respond_trailers_only(respond: &mut SendResponse<Bytes>, status: &Status) {
    let mut response = Response::new(());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, GRPC_CONTENT_TYPE);
    append_status_headers(headers, status);
    if let Err(e) = respond.send_response(response, true) {
        tracing::debug!("failed to send trailers-only response: {}", e);
    }
}

/// Receive half of a call: DATA chunks through the stream decoder and the
/// compression read path, strictly one frame at a time, in wire order.
pub(crate) struct CallReceiver {
    recv: RecvStream,
    decoder: StreamDecoder,
    pending: VecDeque<FramedMessage>,
    compression: CompressionFilter,
    max_receive: Option<usize>,
    cancel: CancelHandle,
}

impl CallReceiver {
    fn new(
        recv: RecvStream,
        compression: CompressionFilter,
        max_receive: Option<usize>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            recv,
            decoder: StreamDecoder::new(),
            pending: VecDeque::new(),
            compression,
            max_receive,
            cancel,
        }
    }

    async fn next_frame(&mut self) -> Option<Result<FramedMessage, Status>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            match self.recv.data().await {
                Some(Ok(chunk)) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.pending.extend(self.decoder.write(&chunk));
                }
                Some(Err(e)) => return Some(Err(h2_error_status(&e, &self.cancel))),
                None => return None,
            }
        }
    }

    /// Next decoded message on a streaming call, or None at end of stream.
    pub(crate) async fn next_message(&mut self) -> Option<Result<Bytes, Status>> {
        let frame = match self.next_frame().await? {
            Ok(frame) => frame,
            Err(status) => return Some(Err(status)),
        };
        if let Err(status) = self.check_receive_size(frame.message_length()) {
            return Some(Err(status));
        }
        Some(self.compression.read_message(&frame))
    }

    /// Accumulate the whole request body and yield the single message of a
    /// unary or server-streaming call.
    pub(crate) async fn receive_unary_message(&mut self) -> Result<Bytes, Status> {
        loop {
            match self.recv.data().await {
                Some(Ok(chunk)) => {
                    let _ = self.recv.flow_control().release_capacity(chunk.len());
                    self.pending.extend(self.decoder.write(&chunk));
                }
                Some(Err(e)) => return Err(h2_error_status(&e, &self.cancel)),
                None => break,
            }
        }
        let frame = self
            .pending
            .pop_front()
            .ok_or_else(|| Status::internal("Incomplete request message"))?;
        self.pending.clear();
        self.check_receive_size(frame.message_length())?;
        self.compression.read_message(&frame)
    }

    fn check_receive_size(&self, length: usize) -> Result<(), Status> {
        match self.max_receive {
            Some(limit) if length > limit => Err(Status::resource_exhausted(format!(
                "Received message larger than max ({} vs. {})",
                length, limit
            ))),
            _ => Ok(()),
        }
    }

    /// Drop frames buffered behind a failed message.
    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }
}

/// Clonable send-side handle used by handlers, the deadline path, and the
/// shutdown path.
#[derive(Clone)]
pub(crate) struct CallResponder {
    sink: Arc<Mutex<CallSink>>,
    cancel: CancelHandle,
    max_send: Option<usize>,
}

impl CallResponder {
    pub(crate) async fn send_metadata(&self, custom: &Metadata) -> Result<(), Status> {
        self.sink.lock().await.send_metadata(Some(custom))
    }

    /// Frame and write one serialized message.
    pub(crate) async fn send_serialized(&self, raw: &[u8]) -> Result<(), Status> {
        self.check_send_size(raw.len())?;
        let mut sink = self.sink.lock().await;
        let framed = sink.compression_write(raw)?;
        sink.send_metadata(None)?;
        sink.write_frame(framed).await
    }

    /// Write the single response of a unary-response call and complete the
    /// stream, installing optional trailing metadata on the final status.
    pub(crate) async fn finish_unary(
        &self,
        raw: &[u8],
        trailers: Option<Metadata>,
    ) -> Result<(), Status> {
        self.check_send_size(raw.len())?;
        let mut sink = self.sink.lock().await;
        if let Some(metadata) = trailers {
            sink.set_status_metadata(metadata);
        }
        let framed = sink.compression_write(raw)?;
        sink.send_metadata(None)?;
        sink.write_frame(framed).await?;
        sink.end_call()
    }

    /// Complete a streaming response with an OK status.
    pub(crate) async fn end_stream(&self, trailers: Option<Metadata>) -> Result<(), Status> {
        let mut sink = self.sink.lock().await;
        if let Some(metadata) = trailers {
            sink.set_status_metadata(metadata);
        }
        sink.end_call()
    }

    /// Terminate with an error status.
    pub(crate) async fn fail(&self, status: Status) -> Result<(), Status> {
        self.sink.lock().await.fail_call(status)
    }

    pub(crate) fn check_send_size(&self, length: usize) -> Result<(), Status> {
        match self.max_send {
            Some(limit) if length > limit => Err(Status::resource_exhausted(format!(
                "Sent message larger than max ({} vs. {})",
                length, limit
            ))),
            _ => Ok(()),
        }
    }
}

/// All per-stream state, assembled at dispatch time.
pub(crate) struct ServerCall {
    pub(crate) path: String,
    pub(crate) metadata: Metadata,
    pub(crate) deadline: Option<Duration>,
    pub(crate) receiver: CallReceiver,
    pub(crate) responder: CallResponder,
    pub(crate) cancel: CancelHandle,
}

impl ServerCall {
    pub(crate) fn new(
        path: String,
        metadata: Metadata,
        deadline: Option<Duration>,
        compression: CompressionFilter,
        recv: RecvStream,
        respond: SendResponse<Bytes>,
        options: &ServerOptions,
    ) -> Self {
        let cancel = CancelHandle::new();
        let receiver = CallReceiver::new(
            recv,
            compression.clone(),
            options.max_receive_message_length,
            cancel.clone(),
        );
        let sink = CallSink::new(respond, compression, cancel.clone());
        let responder = CallResponder {
            sink: Arc::new(Mutex::new(sink)),
            cancel: cancel.clone(),
            max_send: options.max_send_message_length,
        };
        Self {
            path,
            metadata,
            deadline,
            receiver,
            responder,
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_parse_timeout_units() {
        assert_eq!(parse_timeout("1H"), Some(Duration::from_millis(3_600_000)));
        assert_eq!(parse_timeout("2M"), Some(Duration::from_millis(120_000)));
        assert_eq!(parse_timeout("30S"), Some(Duration::from_millis(30_000)));
        assert_eq!(parse_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_timeout("5000u"), Some(Duration::from_millis(5)));
        assert_eq!(parse_timeout("7000000n"), Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_parse_timeout_truncates_sub_millisecond() {
        assert_eq!(parse_timeout("1500u"), Some(Duration::from_millis(1)));
        assert_eq!(parse_timeout("999u"), Some(Duration::from_millis(0)));
        assert_eq!(parse_timeout("1n"), Some(Duration::from_millis(0)));
    }

    #[test]
    fn test_parse_timeout_digit_limit() {
        assert_eq!(parse_timeout("99999999S"), Some(Duration::from_millis(99_999_999_000)));
        assert_eq!(parse_timeout("999999999S"), None);
    }

    #[test]
    fn test_parse_timeout_invalid() {
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("S"), None);
        assert_eq!(parse_timeout("Infinity"), None);
        assert_eq!(parse_timeout("10x"), None);
        assert_eq!(parse_timeout("10s"), None);
        assert_eq!(parse_timeout("-5S"), None);
        assert_eq!(parse_timeout("1.5S"), None);
    }

    #[test]
    fn test_cancel_reason_strings() {
        assert_eq!(CancelReason::Cancelled.as_str(), "cancelled");
        assert_eq!(CancelReason::Deadline.as_str(), "deadline");
    }

    #[test]
    fn test_cancel_handle_first_reason_wins() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());

        handle.cancel(CancelReason::Deadline);
        handle.cancel(CancelReason::Cancelled);

        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), Some(CancelReason::Deadline));
    }

    #[tokio::test]
    async fn test_cancel_handle_wakes_waiters() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        handle.cancel(CancelReason::Cancelled);

        assert_eq!(task.await.unwrap(), CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_handle_resolved_when_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel(CancelReason::Deadline);
        assert_eq!(handle.cancelled().await, CancelReason::Deadline);
    }

    #[test]
    fn test_receive_request_metadata_extracts_deadline() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-timeout", HeaderValue::from_static("100m"));
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        headers.insert("x-custom", HeaderValue::from_static("value"));

        let mut filter = CompressionFilter::new();
        let (metadata, deadline) = receive_request_metadata(&headers, &mut filter).unwrap();

        assert_eq!(deadline, Some(Duration::from_millis(100)));
        assert!(!metadata.contains_key(GRPC_TIMEOUT_HEADER));
        assert!(!metadata.contains_key("content-type"));
        assert_eq!(metadata.get_text("x-custom"), Some("value"));
    }

    #[test]
    fn test_receive_request_metadata_invalid_deadline() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-timeout", HeaderValue::from_static("Infinity"));

        let mut filter = CompressionFilter::new();
        let err = receive_request_metadata(&headers, &mut filter).unwrap_err();
        assert_eq!(err.code(), Code::OutOfRange);
        assert_eq!(err.details(), "Invalid deadline");
    }

    #[test]
    fn test_receive_request_metadata_strips_encoding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-encoding", HeaderValue::from_static("gzip"));
        headers.insert("grpc-accept-encoding", HeaderValue::from_static("identity,gzip"));

        let mut filter = CompressionFilter::new();
        let (metadata, deadline) = receive_request_metadata(&headers, &mut filter).unwrap();

        assert_eq!(deadline, None);
        assert!(metadata.is_empty());
        assert_eq!(filter.receive_encoding(), crate::compression::Encoding::Gzip);
    }

    #[test]
    fn test_receive_request_metadata_no_deadline() {
        let headers = HeaderMap::new();
        let mut filter = CompressionFilter::new();
        let (metadata, deadline) = receive_request_metadata(&headers, &mut filter).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(deadline, None);
    }
}
