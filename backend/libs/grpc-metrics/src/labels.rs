//! Label codec and per-family label builders
//!
//! Every metric family declares its label keys exactly once here. Call
//! sites never assemble label slices by hand; they build one of the
//! `*Labels` structs and hand it to the owning [`Monitor`](crate::Monitor),
//! which produces the value slice in declaration order.

use std::fmt;
use std::net::SocketAddr;
use tonic::{Code, Request, Status};

/// Value used when a service/method pair cannot be parsed
pub const UNKNOWN: &str = "unknown";

/// Value used when the remote peer cannot be resolved
pub const NO_PEER: &str = "none";

pub(crate) const PEER_LABEL: &str = "peer";
pub(crate) const REQUEST_LABELS: &[&str] = &["service", "handler", "code", "type"];
pub(crate) const MESSAGE_LABELS: &[&str] = &["service", "handler"];
pub(crate) const RPC_LABELS: &[&str] = &["service", "handler", "fail_fast"];
pub(crate) const CONN_LABELS: &[&str] = &["remote_addr", "local_addr"];
pub(crate) const DIALER_LABELS: &[&str] = &["address"];

/// Every code of the gRPC status space, success first
pub const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

/// Split a fully-qualified method name (`/package.Service/Method`)
/// into `(service, method)`.
///
/// Names without a `/` separator, or with an empty service or method
/// part, yield `("unknown", "unknown")`.
pub fn split(full_method: &str) -> (&str, &str) {
    let name = full_method.strip_prefix('/').unwrap_or(full_method);
    match name.rsplit_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => (service, method),
        _ => (UNKNOWN, UNKNOWN),
    }
}

/// Call shape derived from the streaming flags of a method descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl CallShape {
    /// Classify a method from its streaming flags
    pub fn classify(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => CallShape::Unary,
            (false, true) => CallShape::ServerStream,
            (true, false) => CallShape::ClientStream,
            (true, true) => CallShape::BidiStream,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallShape::Unary => "unary",
            CallShape::ClientStream => "client_stream",
            CallShape::ServerStream => "server_stream",
            CallShape::BidiStream => "bidirectional_stream",
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical label value for a status code
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Maps an error onto the gRPC status space
pub trait GrpcCode {
    fn grpc_code(&self) -> Code;
}

impl GrpcCode for Status {
    fn grpc_code(&self) -> Code {
        self.code()
    }
}

impl GrpcCode for Code {
    fn grpc_code(&self) -> Code {
        *self
    }
}

impl GrpcCode for Box<dyn std::error::Error + Send + Sync> {
    fn grpc_code(&self) -> Code {
        self.downcast_ref::<Status>()
            .map(Status::code)
            .unwrap_or(Code::Unknown)
    }
}

/// Outcome code of a completed call, `Code::Ok` on success
pub fn code_of<T, E: GrpcCode>(result: &Result<T, E>) -> Code {
    match result {
        Ok(_) => Code::Ok,
        Err(err) => err.grpc_code(),
    }
}

/// Which side of the transport a family set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    pub fn from_is_client(is_client: bool) -> Self {
        if is_client {
            Role::Client
        } else {
            Role::Server
        }
    }
}

/// Per-call metadata handed to the interceptors
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Fully-qualified method name, e.g. `/demo.Echo/Say`
    pub method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    /// Remote address of the call, when the transport exposes one
    pub peer: Option<SocketAddr>,
    /// `false` when the caller asked to wait for a ready connection
    pub fail_fast: bool,
}

impl CallInfo {
    pub fn unary(method: impl Into<String>) -> Self {
        Self::streaming(method, false, false)
    }

    pub fn streaming(
        method: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
    ) -> Self {
        Self {
            method: method.into(),
            client_streaming,
            server_streaming,
            peer: None,
            fail_fast: true,
        }
    }

    /// Build call metadata for an incoming tonic request, resolving the
    /// peer from the connection info tonic attaches to the request
    pub fn from_request<T>(method: impl Into<String>, request: &Request<T>) -> Self {
        let mut info = Self::unary(method);
        info.peer = request.remote_addr();
        info
    }

    pub fn with_shape(mut self, client_streaming: bool, server_streaming: bool) -> Self {
        self.client_streaming = client_streaming;
        self.server_streaming = server_streaming;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn shape(&self) -> CallShape {
        CallShape::classify(self.client_streaming, self.server_streaming)
    }

    /// Resolved peer label value, `"none"` when unresolvable
    pub fn peer_value(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| NO_PEER.to_string())
    }
}

/// Labels of the request-level families: requests_total, errors_total
/// and request_duration_seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLabels {
    pub service: String,
    pub handler: String,
    pub code: Code,
    pub shape: CallShape,
    pub peer: String,
}

impl RequestLabels {
    pub fn new(call: &CallInfo, code: Code) -> Self {
        let (service, handler) = split(&call.method);
        Self {
            service: service.to_string(),
            handler: handler.to_string(),
            code,
            shape: call.shape(),
            peer: call.peer_value(),
        }
    }

    pub(crate) fn values(&self, track_peers: bool) -> Vec<&str> {
        let mut values = vec![
            self.service.as_str(),
            self.handler.as_str(),
            code_label(self.code),
            self.shape.as_str(),
        ];
        if track_peers {
            values.push(self.peer.as_str());
        }
        values
    }
}

/// Labels of the message-level families, fixed for a stream's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLabels {
    pub service: String,
    pub handler: String,
    pub peer: String,
}

impl MessageLabels {
    pub fn new(call: &CallInfo) -> Self {
        let (service, handler) = split(&call.method);
        Self {
            service: service.to_string(),
            handler: handler.to_string(),
            peer: call.peer_value(),
        }
    }

    pub(crate) fn values(&self, track_peers: bool) -> Vec<&str> {
        let mut values = vec![self.service.as_str(), self.handler.as_str()];
        if track_peers {
            values.push(self.peer.as_str());
        }
        values
    }
}

/// Labels of the in-flight gauge, resolved once when an RPC is tagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcLabels {
    pub service: String,
    pub handler: String,
    pub fail_fast: bool,
}

impl RpcLabels {
    pub fn new(full_method: &str, fail_fast: bool) -> Self {
        let (service, handler) = split(full_method);
        Self {
            service: service.to_string(),
            handler: handler.to_string(),
            fail_fast,
        }
    }

    pub(crate) fn values(&self) -> [&str; 3] {
        let fail_fast = if self.fail_fast { "true" } else { "false" };
        [self.service.as_str(), self.handler.as_str(), fail_fast]
    }
}

/// Labels of the connections gauge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnLabels {
    pub remote_addr: String,
    pub local_addr: String,
}

impl ConnLabels {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr: remote_addr.to_string(),
            local_addr: local_addr.to_string(),
        }
    }

    pub(crate) fn values(&self) -> [&str; 2] {
        [self.remote_addr.as_str(), self.local_addr.as_str()]
    }
}

/// Label keys for a family, with `peer` appended when tracked
pub(crate) fn label_names(base: &[&'static str], track_peers: bool) -> Vec<&'static str> {
    let mut names = base.to_vec();
    if track_peers {
        names.push(PEER_LABEL);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_full_method() {
        assert_eq!(split("/demo.Echo/Say"), ("demo.Echo", "Say"));
        assert_eq!(split("/pkg.sub.Svc/Method"), ("pkg.sub.Svc", "Method"));
        assert_eq!(split("pkg.Svc/Method"), ("pkg.Svc", "Method"));
    }

    #[test]
    fn test_split_without_separator() {
        assert_eq!(split("garbage"), ("unknown", "unknown"));
        assert_eq!(split(""), ("unknown", "unknown"));
        assert_eq!(split("/Method"), ("unknown", "unknown"));
    }

    #[test]
    fn test_split_empty_parts() {
        assert_eq!(split("/svc/"), ("unknown", "unknown"));
        assert_eq!(split("//M"), ("unknown", "unknown"));
        assert_eq!(split("/a/b/c"), ("a/b", "c"));
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(CallShape::classify(false, false), CallShape::Unary);
        assert_eq!(CallShape::classify(false, true), CallShape::ServerStream);
        assert_eq!(CallShape::classify(true, false), CallShape::ClientStream);
        assert_eq!(CallShape::classify(true, true), CallShape::BidiStream);
        assert_eq!(CallShape::BidiStream.to_string(), "bidirectional_stream");
    }

    #[test]
    fn test_code_labels() {
        assert_eq!(code_label(Code::Ok), "OK");
        assert_eq!(code_label(Code::Cancelled), "Canceled");
        assert_eq!(code_label(Code::Unauthenticated), "Unauthenticated");
        assert_eq!(ALL_CODES.len(), 17);
    }

    #[test]
    fn test_code_of_results() {
        let ok: Result<(), Status> = Ok(());
        let err: Result<(), Status> = Err(Status::not_found("missing"));
        assert_eq!(code_of(&ok), Code::Ok);
        assert_eq!(code_of(&err), Code::NotFound);

        let boxed: Box<dyn std::error::Error + Send + Sync> = "io failure".into();
        assert_eq!(boxed.grpc_code(), Code::Unknown);
        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(Status::unavailable("down"));
        assert_eq!(boxed.grpc_code(), Code::Unavailable);
    }

    #[test]
    fn test_request_labels_peer_slot() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let call = CallInfo::unary("/demo.Echo/Say").with_peer(peer);
        let labels = RequestLabels::new(&call, Code::Ok);

        assert_eq!(labels.values(false), vec!["demo.Echo", "Say", "OK", "unary"]);
        assert_eq!(
            labels.values(true),
            vec!["demo.Echo", "Say", "OK", "unary", "10.0.0.1:5000"]
        );
    }

    #[test]
    fn test_unresolved_peer_is_none() {
        let call = CallInfo::unary("/demo.Echo/Say");
        assert_eq!(call.peer_value(), "none");

        let request = Request::new(());
        let call = CallInfo::from_request("/demo.Echo/Say", &request);
        assert_eq!(call.peer_value(), "none");
    }

    #[test]
    fn test_label_names_append_peer() {
        assert_eq!(label_names(MESSAGE_LABELS, false), vec!["service", "handler"]);
        assert_eq!(
            label_names(MESSAGE_LABELS, true),
            vec!["service", "handler", "peer"]
        );
    }
}
