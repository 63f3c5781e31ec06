//! Service definitions and the handler registry.
//!
//! A service is a named bundle of method descriptors. Each method carries
//! opaque serializer and deserializer callbacks plus its call shape, and is
//! erased into a dispatch function at registration. The registry maps exact
//! method paths to handlers and is frozen once the server starts.

use crate::call::ServerCall;
use crate::handlers::{self, CallContext, MethodResponse, RequestStream, ServerWriter};
use crate::metadata::Metadata;
use crate::status::Status;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque message serializer supplied by the application.
pub type SerializeFn<T> =
    Arc<dyn Fn(&T) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Opaque message deserializer supplied by the application.
pub type DeserializeFn<T> =
    Arc<dyn Fn(&[u8]) -> Result<T, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

pub(crate) type DispatchFn = Arc<dyn Fn(ServerCall) -> BoxFuture<'static, ()> + Send + Sync>;

/// The four call shapes, derived from the request/response stream flags of
/// a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ClientStream,
    ServerStream,
    Bidi,
}

impl MethodKind {
    /// Derive the shape from the descriptor's two streaming flags.
    pub fn from_stream_flags(request_stream: bool, response_stream: bool) -> Self {
        match (request_stream, response_stream) {
            (false, false) => MethodKind::Unary,
            (true, false) => MethodKind::ClientStream,
            (false, true) => MethodKind::ServerStream,
            (true, true) => MethodKind::Bidi,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredMethod {
    pub(crate) kind: MethodKind,
    pub(crate) dispatch: DispatchFn,
}

/// Map from exact method path to handler.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    methods: HashMap<String, RegisteredMethod>,
}

impl HandlerRegistry {
    /// Register a handler. Returns false (without mutating) when the path
    /// is already present.
    pub(crate) fn register(&mut self, path: &str, method: RegisteredMethod) -> bool {
        if self.methods.contains_key(path) {
            return false;
        }
        self.methods.insert(path.to_string(), method);
        true
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.methods.contains_key(path)
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<RegisteredMethod> {
        self.methods.get(path).cloned()
    }
}

/// A built service, ready to add to a server.
pub struct ServiceDefinition {
    pub(crate) methods: Vec<(String, RegisteredMethod)>,
}

impl ServiceDefinition {
    /// The method paths this service registers.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(path, _)| path.as_str())
    }
}

/// Builder assembling a service's methods under `/<service>/<method>` paths.
pub struct ServiceBuilder {
    service: String,
    methods: Vec<(String, RegisteredMethod)>,
}

impl ServiceBuilder {
    /// Start a service named e.g. `pkg.Service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: Vec::new(),
        }
    }

    fn method_path(&self, method: &str) -> String {
        format!("/{}/{}", self.service, method)
    }

    /// Register a unary method.
    pub fn unary<Req, Res, F, Fut>(
        mut self,
        method: &str,
        deserialize: DeserializeFn<Req>,
        serialize: SerializeFn<Res>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + Sync + 'static,
        F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResponse<Res>, Status>> + Send + 'static,
    {
        let path = self.method_path(method);
        self.methods.push((
            path,
            RegisteredMethod {
                kind: MethodKind::Unary,
                dispatch: handlers::unary(deserialize, serialize, handler),
            },
        ));
        self
    }

    /// Register a client-streaming method.
    pub fn client_streaming<Req, Res, F, Fut>(
        mut self,
        method: &str,
        deserialize: DeserializeFn<Req>,
        serialize: SerializeFn<Res>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + Sync + 'static,
        F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResponse<Res>, Status>> + Send + 'static,
    {
        let path = self.method_path(method);
        self.methods.push((
            path,
            RegisteredMethod {
                kind: MethodKind::ClientStream,
                dispatch: handlers::client_streaming(deserialize, serialize, handler),
            },
        ));
        self
    }

    /// Register a server-streaming method.
    pub fn server_streaming<Req, Res, F, Fut>(
        mut self,
        method: &str,
        deserialize: DeserializeFn<Req>,
        serialize: SerializeFn<Res>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + Sync + 'static,
        F: Fn(Req, ServerWriter<Res>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Metadata>, Status>> + Send + 'static,
    {
        let path = self.method_path(method);
        self.methods.push((
            path,
            RegisteredMethod {
                kind: MethodKind::ServerStream,
                dispatch: handlers::server_streaming(deserialize, serialize, handler),
            },
        ));
        self
    }

    /// Register a bidi-streaming method.
    pub fn bidi_streaming<Req, Res, F, Fut>(
        mut self,
        method: &str,
        deserialize: DeserializeFn<Req>,
        serialize: SerializeFn<Res>,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Res: Send + Sync + 'static,
        F: Fn(RequestStream<Req>, ServerWriter<Res>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Metadata>, Status>> + Send + 'static,
    {
        let path = self.method_path(method);
        self.methods.push((
            path,
            RegisteredMethod {
                kind: MethodKind::Bidi,
                dispatch: handlers::bidi_streaming(deserialize, serialize, handler),
            },
        ));
        self
    }

    /// Register a method descriptor without an implementation. Calls to it
    /// fail with UNIMPLEMENTED.
    pub fn unimplemented_method(mut self, method: &str, kind: MethodKind) -> Self {
        let path = self.method_path(method);
        self.methods.push((
            path.clone(),
            RegisteredMethod {
                kind,
                dispatch: handlers::unimplemented(path),
            },
        ));
        self
    }

    pub fn build(self) -> ServiceDefinition {
        ServiceDefinition {
            methods: self.methods,
        }
    }
}
