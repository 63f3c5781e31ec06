//! grpc-server - a pure-runtime gRPC server core.
//!
//! This crate implements the server half of gRPC-over-HTTP/2 on top of the
//! `h2` transport: stream dispatch to registered service methods, the
//! length-prefixed message framing and trailer protocol, per-call lifecycle
//! (deadlines, cancellation, compression, metadata), and orderly or forced
//! shutdown of listeners and sessions.
//!
//! # Architecture
//!
//! gRPC messages are framed as:
//! - 1 byte: compressed flag (0 = uncompressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload (typically protobuf)
//!
//! This crate handles the framing and call layer. Protobuf encoding and
//! decoding is left to the application, which supplies opaque serializer
//! and deserializer callbacks at method registration time.
//!
//! # Example
//!
//! ```ignore
//! use grpc_server::{Server, ServerCredentials, ServerOptions, ServiceBuilder};
//!
//! let server = Server::new(ServerOptions::default());
//! server.add_service(
//!     ServiceBuilder::new("echo.EchoService")
//!         .unary("Echo", deserializer, serializer, |req, _ctx| async move {
//!             Ok(grpc_server::MethodResponse::new(req))
//!         })
//!         .build(),
//! )?;
//! let port = server.bind("127.0.0.1:0", ServerCredentials::insecure()).await?;
//! server.start()?;
//! ```

mod call;
mod compression;
mod credentials;
mod frame;
mod handlers;
mod logging;
mod metadata;
mod metrics;
mod options;
mod resolver;
mod server;
mod service;
mod session;
mod status;

pub use call::{CancelReason, parse_timeout};
pub use compression::{CompressionFilter, Encoding};
pub use credentials::{CredentialsError, KeyCertPair, ServerCredentials};
pub use frame::{FRAME_HEADER_SIZE, FramedMessage, StreamDecoder, encode_frame};
pub use handlers::{CallContext, MethodResponse, RequestStream, ServerWriter};
pub use logging::init as init_logging;
pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use options::{OptionsError, ServerOptions};
pub use resolver::{ListenTarget, TargetError, parse_target};
pub use server::{Server, ServerError};
pub use service::{DeserializeFn, MethodKind, SerializeFn, ServiceBuilder, ServiceDefinition};
pub use status::{Code, Status};
