use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, RpcError};

/// Path the registry serves under.
pub const DEFAULT_PATH: &str = "/_geerpc_/registry";

/// How long a registered server stays alive without a heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Header carrying server addresses, on both GET responses and POST
/// requests. Lowercase because HTTP header names are case-insensitive and
/// hyper emits them as given.
pub const SERVERS_HEADER: &str = "x-geerpc-servers";

/// Simple registry center: servers POST heartbeats to stay listed,
/// clients GET the alive list. Stale entries are purged lazily on GET.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// A zero timeout means entries never expire.
    pub fn new(timeout: Duration) -> Self {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn put_server(&self, addr: &str) {
        // Insert or refresh: either way the entry starts its timeout anew.
        self.servers
            .lock()
            .unwrap()
            .insert(addr.to_string(), Instant::now());
    }

    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let mut alive = Vec::new();
        servers.retain(|addr, start| {
            if self.timeout.is_zero() || start.elapsed() <= self.timeout {
                alive.push(addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// Handle one registry request.
    pub fn handle<B>(&self, request: &Request<B>) -> Response<Empty<Bytes>> {
        let mut response = Response::new(Empty::new());
        match *request.method() {
            Method::GET => match HeaderValue::try_from(self.alive_servers().join(",")) {
                Ok(value) => {
                    response.headers_mut().insert(SERVERS_HEADER, value);
                }
                Err(_) => {
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                }
            },
            Method::POST => {
                let addr = request
                    .headers()
                    .get(SERVERS_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("");
                if addr.is_empty() {
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                } else {
                    self.put_server(addr);
                }
            }
            _ => {
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            }
        }
        response
    }

    /// Serve the registry on a listener until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "registry connection");
            let registry = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(registry.handle(&request)) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(error = %err, "registry connection error");
                }
            });
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_TIMEOUT)
    }
}

/// Register `addr` with the registry and keep it alive with periodic
/// heartbeats on a background task. The default period leaves a minute of
/// slack before the registry's default timeout; the task stops on the
/// first failed beat.
pub async fn heartbeat(registry: &str, addr: &str, period: Option<Duration>) -> Result<()> {
    let period = period.unwrap_or(DEFAULT_TIMEOUT.saturating_sub(Duration::from_secs(60)));
    send_heartbeat(registry, addr).await?;

    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; the initial beat already went out.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&registry, &addr).await {
                tracing::warn!(%addr, error = %err, "heartbeat failed, stopping");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(registry: &str, addr: &str) -> Result<()> {
    tracing::debug!(%addr, %registry, "send heartbeat");
    let response = request(Method::POST, registry, Some(addr)).await?;
    if !response.status().is_success() {
        return Err(RpcError::Discovery(format!(
            "registry heartbeat returned status {}",
            response.status()
        )));
    }
    Ok(())
}

/// Fetch the alive server list from the registry's GET response header.
pub(crate) async fn fetch_servers(registry: &str) -> Result<Vec<String>> {
    let response = request(Method::GET, registry, None).await?;
    let header = response
        .headers()
        .get(SERVERS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    Ok(header
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(String::from)
        .collect())
}

/// One-shot HTTP request over a fresh connection. The registry traffic is
/// a single header exchange, so there is nothing to pool.
async fn request(
    method: Method,
    url: &str,
    servers_header: Option<&str>,
) -> Result<Response<Incoming>> {
    let uri: Uri = url
        .parse()
        .map_err(|err| RpcError::Discovery(format!("invalid registry url {url}: {err}")))?;
    let host = uri
        .host()
        .ok_or_else(|| RpcError::Discovery(format!("invalid registry url {url}: missing host")))?;
    let authority = format!("{host}:{}", uri.port_u16().unwrap_or(80));

    let stream = TcpStream::connect(&authority).await?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| RpcError::Discovery(format!("registry handshake: {err}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "registry connection closed");
        }
    });

    let path = uri
        .path_and_query()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, authority);
    if let Some(addr) = servers_header {
        builder = builder.header(SERVERS_HEADER, addr);
    }
    let request = builder
        .body(Empty::<Bytes>::new())
        .map_err(|err| RpcError::Discovery(format!("build registry request: {err}")))?;

    sender
        .send_request(request)
        .await
        .map_err(|err| RpcError::Discovery(format!("registry request: {err}")))
}
