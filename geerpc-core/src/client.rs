use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use crate::codec::{CodecReader, CodecWriter, ContentType, Header};
use crate::error::{Result, RpcError};
use crate::protocol::{self, Options};

/// What the receive loop hands to a waiting call: the raw reply payload
/// on success, or the error that completed the call.
type CallOutcome = std::result::Result<Vec<u8>, RpcError>;

/// An RPC client session over one TCP connection. Cheap to clone; all
/// clones multiplex their calls over the same connection by seq.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner {
    content: ContentType,
    /// Serializes outbound frames and covers the register-then-write
    /// critical section. Lock order: `sending` before `state`.
    sending: Mutex<CodecWriter<BufWriter<OwnedWriteHalf>>>,
    state: std::sync::Mutex<ClientState>,
}

struct ClientState {
    /// Next seq to assign; starts at 1, 0 is reserved invalid.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// The user called `close`.
    closing: bool,
    /// The receive loop tore the session down.
    shutdown: bool,
    /// Wakes the receive loop so `close` does not wait on the server.
    stop: Option<oneshot::Sender<()>>,
}

impl ClientInner {
    fn register_call(&self) -> Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }
}

/// An outstanding request. Await it with [`Call::wait`]; dropping it
/// before completion deregisters the call, so a response that arrives
/// later is drained as an unknown seq.
pub struct Call {
    seq: u64,
    service_method: String,
    content: ContentType,
    done: oneshot::Receiver<CallOutcome>,
    inner: Arc<ClientInner>,
}

impl Call {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the response and decode the reply.
    pub async fn wait<R: DeserializeOwned>(mut self) -> Result<R> {
        let outcome = match (&mut self.done).await {
            Ok(outcome) => outcome,
            // The sender is only ever dropped when the session dies
            // between registration and completion.
            Err(_) => Err(RpcError::Shutdown),
        };
        match outcome {
            Ok(payload) => self.content.unmarshal(&payload).map_err(|err| match err {
                RpcError::Codec(cause) => RpcError::ReadBody(cause),
                other => RpcError::ReadBody(other.to_string()),
            }),
            Err(err) => Err(err),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // A no-op after completion: the receive loop already removed the
        // pending entry. Seqs are never reused, so this cannot race a
        // later call.
        self.inner.remove_call(self.seq);
    }
}

impl Client {
    /// Dial `addr` and perform the option handshake. The whole exchange
    /// is bounded by `options.connect_timeout` (zero means unbounded).
    pub async fn dial(addr: &str, options: Options) -> Result<Client> {
        let content = ContentType::from_name(&options.codec_type)
            .ok_or_else(|| RpcError::InvalidCodec(options.codec_type.clone()))?;

        let connect_timeout = options.connect_timeout;
        let connect = Client::connect(addr, options, content);
        if connect_timeout.is_zero() {
            connect.await
        } else {
            match tokio::time::timeout(connect_timeout, connect).await {
                Ok(connected) => connected,
                Err(_) => Err(RpcError::ConnectTimeout(connect_timeout)),
            }
        }
    }

    async fn connect(addr: &str, options: Options, content: ContentType) -> Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let mut write_half = BufWriter::new(write_half);
        protocol::write_options(&mut write_half, &options).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = Arc::new(ClientInner {
            content,
            sending: Mutex::new(CodecWriter::new(write_half, content)),
            state: std::sync::Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
                stop: Some(stop_tx),
            }),
        });

        let reader = CodecReader::new(BufReader::new(read_half), content);
        tokio::spawn(receive_loop(inner.clone(), reader, stop_rx));

        Ok(Client { inner })
    }

    /// Invoke a method asynchronously, returning the [`Call`] handle.
    pub async fn go<A>(&self, service_method: &str, args: &A) -> Result<Call>
    where
        A: Serialize + ?Sized,
    {
        let body = self.inner.content.marshal(args)?;
        self.go_raw(service_method, body).await
    }

    pub(crate) async fn go_raw(&self, service_method: &str, body: Vec<u8>) -> Result<Call> {
        // Holding `sending` across register-then-write keeps the frame
        // order on the wire consistent with seq assignment.
        let mut writer = self.inner.sending.lock().await;
        let (seq, done) = self.inner.register_call()?;
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(err) = writer.write_raw(&header, &body).await {
            // The entry may already be gone: on a partial write the
            // receive loop can observe the response first and complete
            // the call itself.
            if let Some(tx) = self.inner.remove_call(seq) {
                let _ = tx.send(Err(err));
            }
        }
        drop(writer);

        Ok(Call {
            seq,
            service_method: service_method.to_string(),
            content: self.inner.content,
            done,
            inner: self.inner.clone(),
        })
    }

    /// Invoke a method and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.wait().await
    }

    /// True until the user closes the session or the receive loop tears
    /// it down.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// Close the session. Idempotent: the first call succeeds, later
    /// calls return [`RpcError::Shutdown`]. Pending calls are failed by
    /// the receive loop as it exits.
    pub async fn close(&self) -> Result<()> {
        let stop = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
            state.stop.take()
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let mut writer = self.inner.sending.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(error = %err, "client connection shutdown failed");
        }
        Ok(())
    }
}

/// The single task that owns the read half: match responses to pending
/// calls by seq until the connection fails or `close` signals a stop,
/// then fail whatever is still pending.
async fn receive_loop(
    inner: Arc<ClientInner>,
    mut reader: CodecReader<BufReader<OwnedReadHalf>>,
    mut stop: oneshot::Receiver<()>,
) {
    let exit = loop {
        let header = tokio::select! {
            _ = &mut stop => break RpcError::Shutdown,
            read = reader.read_header() => match read {
                Ok(Some(header)) => header,
                Ok(None) => break RpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )),
                Err(err) => break err,
            },
        };

        match inner.remove_call(header.seq) {
            // Nobody is waiting: the call was cancelled, or its write
            // failed partially and the send path completed it. Drain the
            // body to stay aligned.
            None => {
                if let Err(err) = reader.skip_body().await {
                    break err;
                }
            }
            Some(tx) => {
                if !header.error.is_empty() {
                    let drained = reader.skip_body().await;
                    let _ = tx.send(Err(RpcError::Remote(header.error)));
                    if let Err(err) = drained {
                        break err;
                    }
                } else {
                    match reader.read_body_raw().await {
                        Ok(payload) => {
                            let _ = tx.send(Ok(payload));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(RpcError::ReadBody(err.to_string())));
                            break err;
                        }
                    }
                }
            }
        }
    };

    terminate_calls(&inner, exit).await;
}

async fn terminate_calls(inner: &ClientInner, err: RpcError) {
    // Fixed lock order: `sending` before `state`.
    let _sending = inner.sending.lock().await;
    let mut state = inner.state.lock().unwrap();
    state.shutdown = true;
    if !state.pending.is_empty() {
        tracing::debug!(
            pending = state.pending.len(),
            error = %err,
            "failing pending calls"
        );
    }
    for (_, tx) in state.pending.drain() {
        let _ = tx.send(Err(err.replicate()));
    }
}
