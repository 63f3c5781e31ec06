//! Server configuration options.
//!
//! Options form a fixed, enumerated set addressed by their `grpc.`-prefixed
//! wire names. Unknown keys are a construction error, and `-1` means "no
//! limit" for the size settings.

use std::time::Duration;
use thiserror::Error;

/// Default receive-side message size limit (4 MiB, the gRPC default).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Default keepalive ping interval (2 hours).
pub const DEFAULT_KEEPALIVE_TIME_MS: u64 = 7_200_000;

/// Default keepalive ping timeout (20 seconds).
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 20_000;

const MAX_CONCURRENT_STREAMS_KEY: &str = "grpc.max_concurrent_streams";
const MAX_FRAME_SIZE_KEY: &str = "grpc.http2.max_frame_size";
const KEEPALIVE_TIME_KEY: &str = "grpc.keepalive_time_ms";
const KEEPALIVE_TIMEOUT_KEY: &str = "grpc.keepalive_timeout_ms";
const MAX_SEND_MESSAGE_LENGTH_KEY: &str = "grpc.max_send_message_length";
const MAX_RECEIVE_MESSAGE_LENGTH_KEY: &str = "grpc.max_receive_message_length";

/// Errors from parsing option pairs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("unknown server option {0:?}")]
    UnknownOption(String),
    #[error("invalid value {value} for server option {key:?}")]
    InvalidValue { key: String, value: i64 },
}

/// Parsed server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// HTTP/2 SETTINGS_MAX_CONCURRENT_STREAMS. None uses the transport default.
    pub max_concurrent_streams: Option<u32>,
    /// HTTP/2 SETTINGS_MAX_FRAME_SIZE. None uses the HTTP/2 default.
    pub max_frame_size: Option<u32>,
    /// Interval between keepalive pings on an idle session.
    pub keepalive_time: Duration,
    /// How long to wait for a keepalive pong before destroying the session.
    pub keepalive_timeout: Duration,
    /// Largest serialized message the server will send. None is unlimited.
    pub max_send_message_length: Option<usize>,
    /// Largest declared message length the server will accept. None is unlimited.
    pub max_receive_message_length: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
            max_frame_size: None,
            keepalive_time: Duration::from_millis(DEFAULT_KEEPALIVE_TIME_MS),
            keepalive_timeout: Duration::from_millis(DEFAULT_KEEPALIVE_TIMEOUT_MS),
            max_send_message_length: None,
            max_receive_message_length: Some(DEFAULT_MAX_RECEIVE_MESSAGE_LENGTH),
        }
    }
}

impl ServerOptions {
    /// Build options from `grpc.`-prefixed key/value pairs.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                MAX_CONCURRENT_STREAMS_KEY => {
                    options.max_concurrent_streams = Some(positive_u32(&key, value)?);
                }
                MAX_FRAME_SIZE_KEY => {
                    options.max_frame_size = Some(positive_u32(&key, value)?);
                }
                KEEPALIVE_TIME_KEY => {
                    options.keepalive_time = Duration::from_millis(non_negative(&key, value)?);
                }
                KEEPALIVE_TIMEOUT_KEY => {
                    options.keepalive_timeout = Duration::from_millis(non_negative(&key, value)?);
                }
                MAX_SEND_MESSAGE_LENGTH_KEY => {
                    options.max_send_message_length = size_limit(&key, value)?;
                }
                MAX_RECEIVE_MESSAGE_LENGTH_KEY => {
                    options.max_receive_message_length = size_limit(&key, value)?;
                }
                _ => return Err(OptionsError::UnknownOption(key)),
            }
        }
        Ok(options)
    }
}

fn positive_u32(key: &str, value: i64) -> Result<u32, OptionsError> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| OptionsError::InvalidValue {
            key: key.to_string(),
            value,
        })
}

fn non_negative(key: &str, value: i64) -> Result<u64, OptionsError> {
    u64::try_from(value).map_err(|_| OptionsError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Size limits accept `-1` for "no limit".
fn size_limit(key: &str, value: i64) -> Result<Option<usize>, OptionsError> {
    if value == -1 {
        return Ok(None);
    }
    usize::try_from(value)
        .map(Some)
        .map_err(|_| OptionsError::InvalidValue {
            key: key.to_string(),
            value,
        })
}
