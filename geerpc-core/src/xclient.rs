use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::client::Client;
use crate::codec::ContentType;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Result, RpcError};
use crate::protocol::Options;

/// Multi-endpoint client: routes calls to one endpoint via discovery and
/// broadcasts to all endpoints concurrently, pooling one [`Client`]
/// session per endpoint.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XClientInner>,
}

struct XClientInner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Client>>,
    closed: AtomicBool,
}

/// Split `"<network>@<address>"`. Only `tcp` endpoints are dialable.
fn split_endpoint(rpc_addr: &str) -> Result<(&str, &str)> {
    match rpc_addr.split_once('@') {
        Some((network, address)) if !network.is_empty() && !address.is_empty() => {
            Ok((network, address))
        }
        _ => Err(RpcError::InvalidEndpoint(rpc_addr.to_string())),
    }
}

impl XClientInner {
    async fn dial_cached(&self, rpc_addr: &str) -> Result<Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            // Dead session: evict and re-dial.
            clients.remove(rpc_addr);
        }

        let (network, address) = split_endpoint(rpc_addr)?;
        if network != "tcp" {
            return Err(RpcError::InvalidEndpoint(rpc_addr.to_string()));
        }
        let client = Client::dial(address, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        XClient {
            inner: Arc::new(XClientInner {
                discovery,
                mode,
                options,
                clients: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Invoke a method on one endpoint picked by the selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Invoke a method on a specific endpoint.
    pub async fn call_addr<A, R>(&self, rpc_addr: &str, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.inner.dial_cached(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Invoke a method on every known endpoint concurrently.
    ///
    /// The first error aborts all still-in-flight invocations (their
    /// dropped calls deregister client-side) and becomes the result.
    /// Otherwise the first successful reply is returned and later replies
    /// are discarded.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.inner.discovery.get_all().await?;
        let content = ContentType::from_name(&self.inner.options.codec_type)
            .ok_or_else(|| RpcError::InvalidCodec(self.inner.options.codec_type.clone()))?;
        let body = content.marshal(args)?;

        let mut calls: JoinSet<Result<R>> = JoinSet::new();
        for rpc_addr in servers {
            let inner = self.inner.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            calls.spawn(async move {
                let client = inner.dial_cached(&rpc_addr).await?;
                client.go_raw(&service_method, body).await?.wait().await
            });
        }

        let mut reply = None;
        let mut first_error = None;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Ok(value)) => {
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Ok(Err(err)) => {
                    first_error = Some(err);
                    calls.abort_all();
                    break;
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    first_error = Some(RpcError::Io(io::Error::other(join_err.to_string())));
                    break;
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => reply
                .ok_or_else(|| RpcError::Discovery("no available servers".to_string())),
        }
    }

    /// Close every pooled session. Subsequent operations fail with
    /// [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut clients = self.inner.clients.lock().await;
        for (_, client) in clients.drain() {
            // Already-closed sessions answer Shutdown; nothing to do.
            let _ = client.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strings_split_on_the_separator() {
        let (network, address) = split_endpoint("tcp@127.0.0.1:9999").unwrap();
        assert_eq!(network, "tcp");
        assert_eq!(address, "127.0.0.1:9999");
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        for input in ["127.0.0.1:9999", "@127.0.0.1:9999", "tcp@", ""] {
            let err = split_endpoint(input).unwrap_err();
            assert!(matches!(err, RpcError::InvalidEndpoint(_)), "input {input:?}");
        }
    }
}
