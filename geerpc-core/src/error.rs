use std::fmt;
use std::io;
use std::time::Duration;

/// All error types produced by the RPC library.
///
/// Per-request errors (unknown service/method, handler failures, handle
/// timeouts) travel inside response frames and never tear down a
/// connection; framing and I/O errors are terminal for the connection
/// that raised them.
#[derive(Debug)]
pub enum RpcError {
    /// The client session was closed by the user, or the receive loop
    /// tore it down after a connection failure.
    Shutdown,

    /// Dial plus option handshake did not finish within the connect timeout.
    ConnectTimeout(Duration),

    /// The option preamble carried an unexpected magic number.
    InvalidMagic(u32),

    /// The option preamble named a codec this build does not know.
    InvalidCodec(String),

    /// A service/method string without a `.` separator.
    MalformedMethod(String),

    /// No service registered under this name.
    UnknownService(String),

    /// The service exists but has no such method.
    UnknownMethod(String),

    /// A second registration under an already-taken service name.
    ServiceAlreadyDefined(String),

    /// Server-side method execution exceeded the negotiated handle timeout.
    HandleTimeout(Duration),

    /// Error text carried back from the server in a response header.
    Remote(String),

    /// The response body for a completed call could not be decoded.
    ReadBody(String),

    /// An endpoint string that is not of the form `tcp@host:port`.
    InvalidEndpoint(String),

    /// Discovery or registry failure.
    Discovery(String),

    /// A serialization or deserialization failure in the codec plumbing.
    Codec(String),

    /// An I/O error (socket read/write, dial, ...).
    Io(io::Error),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Shutdown => write!(f, "connection is shut down"),
            RpcError::ConnectTimeout(limit) => {
                write!(f, "connect timeout: expect within {limit:?}")
            }
            RpcError::InvalidMagic(magic) => write!(f, "invalid magic number {magic:#x}"),
            RpcError::InvalidCodec(name) => write!(f, "invalid codec type {name}"),
            RpcError::MalformedMethod(input) => {
                write!(f, "service/method request ill-formed: {input}")
            }
            RpcError::UnknownService(name) => write!(f, "can't find service: {name}"),
            RpcError::UnknownMethod(name) => write!(f, "can't find method: {name}"),
            RpcError::ServiceAlreadyDefined(name) => {
                write!(f, "service already defined: {name}")
            }
            RpcError::HandleTimeout(limit) => {
                write!(f, "request handle timeout: expect within {limit:?}")
            }
            RpcError::Remote(message) => write!(f, "{message}"),
            RpcError::ReadBody(cause) => write!(f, "reading body {cause}"),
            RpcError::InvalidEndpoint(endpoint) => {
                write!(f, "invalid endpoint '{endpoint}': expect tcp@host:port")
            }
            RpcError::Discovery(message) => write!(f, "rpc discovery: {message}"),
            RpcError::Codec(message) => write!(f, "codec error: {message}"),
            RpcError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        RpcError::Io(err)
    }
}

impl RpcError {
    /// Produce a copy of this error suitable for fanning out to every
    /// pending call when a session is torn down. `io::Error` is not
    /// `Clone`, so its kind and message are carried over instead.
    pub(crate) fn replicate(&self) -> RpcError {
        match self {
            RpcError::Shutdown => RpcError::Shutdown,
            RpcError::ConnectTimeout(limit) => RpcError::ConnectTimeout(*limit),
            RpcError::InvalidMagic(magic) => RpcError::InvalidMagic(*magic),
            RpcError::InvalidCodec(name) => RpcError::InvalidCodec(name.clone()),
            RpcError::MalformedMethod(input) => RpcError::MalformedMethod(input.clone()),
            RpcError::UnknownService(name) => RpcError::UnknownService(name.clone()),
            RpcError::UnknownMethod(name) => RpcError::UnknownMethod(name.clone()),
            RpcError::ServiceAlreadyDefined(name) => {
                RpcError::ServiceAlreadyDefined(name.clone())
            }
            RpcError::HandleTimeout(limit) => RpcError::HandleTimeout(*limit),
            RpcError::Remote(message) => RpcError::Remote(message.clone()),
            RpcError::ReadBody(cause) => RpcError::ReadBody(cause.clone()),
            RpcError::InvalidEndpoint(endpoint) => RpcError::InvalidEndpoint(endpoint.clone()),
            RpcError::Discovery(message) => RpcError::Discovery(message.clone()),
            RpcError::Codec(message) => RpcError::Codec(message.clone()),
            RpcError::Io(err) => RpcError::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RpcError>;
