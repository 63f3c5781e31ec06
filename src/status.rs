//! gRPC status codes.

use crate::metadata::Metadata;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt;

/// gRPC status codes, carried on the wire in the `grpc-status` trailer.
/// The numeric values are stable protocol constants, distinct from HTTP
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// Every code with its canonical name, indexed by wire value.
const CODES: [(Code, &str); 17] = [
    (Code::Ok, "OK"),
    (Code::Cancelled, "CANCELLED"),
    (Code::Unknown, "UNKNOWN"),
    (Code::InvalidArgument, "INVALID_ARGUMENT"),
    (Code::DeadlineExceeded, "DEADLINE_EXCEEDED"),
    (Code::NotFound, "NOT_FOUND"),
    (Code::AlreadyExists, "ALREADY_EXISTS"),
    (Code::PermissionDenied, "PERMISSION_DENIED"),
    (Code::ResourceExhausted, "RESOURCE_EXHAUSTED"),
    (Code::FailedPrecondition, "FAILED_PRECONDITION"),
    (Code::Aborted, "ABORTED"),
    (Code::OutOfRange, "OUT_OF_RANGE"),
    (Code::Unimplemented, "UNIMPLEMENTED"),
    (Code::Internal, "INTERNAL"),
    (Code::Unavailable, "UNAVAILABLE"),
    (Code::DataLoss, "DATA_LOSS"),
    (Code::Unauthenticated, "UNAUTHENTICATED"),
];

impl Code {
    /// Map a wire value to a code. Values outside the defined range
    /// collapse to `Unknown`, the treatment for unrecognized statuses.
    pub fn from_u32(value: u32) -> Self {
        match CODES.get(value as usize) {
            Some((code, _)) => *code,
            None => Code::Unknown,
        }
    }

    /// The wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// The canonical SCREAMING_SNAKE_CASE name of this code.
    pub fn name(self) -> &'static str {
        CODES[self as usize].1
    }

    /// Check if this is a successful status.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bytes escaped in `grpc-message` trailer values: controls, DEL, and the
/// escape character itself. Non-ASCII bytes are always percent-encoded.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Percent-encode a status message for the `grpc-message` trailer.
pub(crate) fn encode_grpc_message(message: &str) -> String {
    utf8_percent_encode(message, GRPC_MESSAGE_ESCAPES).to_string()
}

/// Decode a `grpc-message` trailer value. Tolerant of malformed escapes.
pub(crate) fn decode_grpc_message(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Final status of an RPC: a code, human-readable details, and optional
/// trailing metadata carried alongside the status in the trailers.
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    details: String,
    metadata: Option<Metadata>,
}

impl Status {
    /// Create a new status.
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            metadata: None,
        }
    }

    /// Create an OK status.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "OK")
    }

    /// Attach trailing metadata to this status.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the status details.
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Get the trailing metadata, if any.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Option<Metadata> {
        &mut self.metadata
    }

    /// Check if this is a successful status.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Create a cancelled status.
    pub fn cancelled(details: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, details)
    }

    /// Create an unknown error status.
    pub fn unknown(details: impl Into<String>) -> Self {
        Self::new(Code::Unknown, details)
    }

    /// Create an invalid argument status.
    pub fn invalid_argument(details: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, details)
    }

    /// Create a deadline exceeded status.
    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, details)
    }

    /// Create a resource exhausted status.
    pub fn resource_exhausted(details: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, details)
    }

    /// Create an out of range status.
    pub fn out_of_range(details: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, details)
    }

    /// Create an unimplemented status.
    pub fn unimplemented(details: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, details)
    }

    /// Create an internal error status.
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    /// Create an unavailable status.
    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, details)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.details)
    }
}

impl std::error::Error for Status {}
