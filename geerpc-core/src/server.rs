use std::sync::Arc;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{CodecReader, CodecWriter, ContentType, Header};
use crate::error::{Result, RpcError};
use crate::protocol::{self, MAGIC_NUMBER};
use crate::service::{Method, Service, ServiceMap};

type ConnReader = CodecReader<BufReader<OwnedReadHalf>>;
type ConnWriter = Arc<Mutex<CodecWriter<BufWriter<OwnedWriteHalf>>>>;

/// An RPC server: a set of registered services and an accept loop that
/// serves each connection on its own task.
#[derive(Clone, Default)]
pub struct Server {
    services: Arc<ServiceMap>,
}

impl Server {
    pub fn new() -> Self {
        Server {
            services: Arc::new(ServiceMap::new()),
        }
    }

    /// Register a service. Duplicate service names are rejected.
    pub fn register(&self, service: Service) -> Result<()> {
        self.services.register(service)
    }

    /// Accept connections until the listener fails, serving each one on
    /// its own task.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_conn(stream).await;
            });
        }
    }

    /// Serve a single connection: option handshake, then the
    /// read-dispatch-respond loop until the client hangs up.
    pub async fn serve_conn(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The preamble is JSON regardless of the negotiated body codec, so
        // unknown codecs are rejected before any binary traffic is read.
        let options = match protocol::read_options(&mut reader).await {
            Ok(options) => options,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "option exchange failed");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            tracing::warn!(
                %peer,
                magic = options.magic_number,
                "rejecting connection: invalid magic number"
            );
            return;
        }
        let Some(content) = ContentType::from_name(&options.codec_type) else {
            tracing::warn!(%peer, codec = %options.codec_type, "rejecting connection: invalid codec type");
            return;
        };

        let reader = CodecReader::new(reader, content);
        let writer = Arc::new(Mutex::new(CodecWriter::new(
            BufWriter::new(write_half),
            content,
        )));
        self.serve_codec(reader, writer, options.handle_timeout).await;
        tracing::debug!(%peer, "client disconnected");
    }

    async fn serve_codec(&self, mut reader: ConnReader, writer: ConnWriter, handle_timeout: Duration) {
        let content = reader.content_type();
        let mut handlers = JoinSet::new();

        loop {
            let mut header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "read header failed");
                    break;
                }
            };

            let method = match self.services.find(&header.service_method) {
                Ok(method) => method,
                Err(err) => {
                    // The body frame still has to be drained to keep the
                    // stream aligned for the next request.
                    if reader.skip_body().await.is_err() {
                        break;
                    }
                    header.error = err.to_string();
                    send_response(&writer, &header, &invalid_request(content)).await;
                    continue;
                }
            };

            let payload = match reader.read_body_raw().await {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(seq = header.seq, error = %err, "read body failed");
                    break;
                }
            };

            handlers.spawn(handle_request(
                writer.clone(),
                header,
                method,
                content,
                payload,
                handle_timeout,
            ));
        }

        // Draining: stop reading, let every in-flight handler flush its
        // response, then close the write half.
        while handlers.join_next().await.is_some() {}
        if let Err(err) = writer.lock().await.shutdown().await {
            tracing::debug!(error = %err, "connection shutdown failed");
        }
    }
}

/// Placeholder response body for requests that failed before (or instead
/// of) producing a reply. The client drains it without decoding.
fn invalid_request(content: ContentType) -> Vec<u8> {
    content.marshal(&()).unwrap_or_default()
}

async fn send_response(writer: &ConnWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write_raw(header, body).await {
        tracing::warn!(seq = header.seq, error = %err, "write response failed");
    }
}

/// Run one request to completion and write its single response frame.
///
/// The timeout races the method by dropping its future, so a request that
/// times out can never also send a late success: exactly one response per
/// seq leaves this task.
async fn handle_request(
    writer: ConnWriter,
    mut header: Header,
    method: Arc<Method>,
    content: ContentType,
    payload: Vec<u8>,
    handle_timeout: Duration,
) {
    let invoked = if handle_timeout.is_zero() {
        method.invoke(content, payload).await
    } else {
        match tokio::time::timeout(handle_timeout, method.invoke(content, payload)).await {
            Ok(invoked) => invoked,
            Err(_) => Err(RpcError::HandleTimeout(handle_timeout).to_string()),
        }
    };

    let body = match invoked {
        Ok(reply) => {
            header.error.clear();
            reply
        }
        Err(message) => {
            header.error = message;
            invalid_request(content)
        }
    };
    send_response(&writer, &header, &body).await;
}
