use std::io;

use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};
use crate::frame::{FrameReader, FrameWriter};

/// Per-frame metadata. Every request and response on a connection is a
/// header frame immediately followed by a body frame, both encoded by
/// the negotiated codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name of the form `"<Service>.<Method>"`.
    pub service_method: String,
    /// Monotonic per-client identifier; starts at 1, 0 is reserved invalid.
    pub seq: u64,
    /// Empty on success; carries the server-side error text otherwise.
    pub error: String,
}

/// Body serialization negotiated in the option handshake.
///
/// The name-to-serializer mapping below is the codec registry: the
/// server rejects unknown names during the handshake, before any binary
/// traffic is touched. Adding a codec means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Compact binary encoding; the default.
    Bincode,
    /// Self-describing textual encoding, handy for debugging with netcat.
    Json,
}

impl ContentType {
    pub const BINCODE: &'static str = "application/bincode";
    pub const JSON: &'static str = "application/json";

    /// Look up a codec by its wire name.
    pub fn from_name(name: &str) -> Option<ContentType> {
        match name {
            ContentType::BINCODE => Some(ContentType::Bincode),
            ContentType::JSON => Some(ContentType::Json),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentType::Bincode => ContentType::BINCODE,
            ContentType::Json => ContentType::JSON,
        }
    }

    pub fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            ContentType::Bincode => bincode::DefaultOptions::new()
                .with_fixint_encoding()
                .serialize(value)
                .map_err(|err| RpcError::Codec(err.to_string())),
            ContentType::Json => {
                serde_json::to_vec(value).map_err(|err| RpcError::Codec(err.to_string()))
            }
        }
    }

    pub fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            ContentType::Bincode => bincode::DefaultOptions::new()
                .with_fixint_encoding()
                .deserialize(bytes)
                .map_err(|err| RpcError::Codec(err.to_string())),
            ContentType::Json => {
                serde_json::from_slice(bytes).map_err(|err| RpcError::Codec(err.to_string()))
            }
        }
    }
}

/// Read half of a connection's codec: header frames and the body frame
/// that follows each of them.
pub struct CodecReader<R> {
    frames: FrameReader<R>,
    content: ContentType,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(inner: R, content: ContentType) -> Self {
        CodecReader {
            frames: FrameReader::new(inner),
            content,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content
    }

    /// Read the next header. `Ok(None)` is a clean end-of-stream.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.frames.read_frame().await? {
            None => Ok(None),
            Some(payload) => Ok(Some(self.content.unmarshal(&payload)?)),
        }
    }

    /// Read the body frame as raw payload bytes, for dispatch paths that
    /// decode lazily (or not at all).
    pub async fn read_body_raw(&mut self) -> Result<Vec<u8>> {
        self.frames.read_frame().await?.ok_or_else(|| {
            RpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the body frame",
            ))
        })
    }

    /// Read and decode the body frame.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.read_body_raw().await?;
        self.content.unmarshal(&payload)
    }

    /// Drain the body frame without decoding it. Keeps the stream aligned
    /// when the value is unwanted (unknown seq, error placeholder).
    pub async fn skip_body(&mut self) -> Result<()> {
        self.read_body_raw().await.map(|_| ())
    }
}

/// Write half of a connection's codec. A send mutex around the writer is
/// what makes each header+body pair atomic relative to other writers; the
/// writer itself only guarantees the pair reaches the transport in one
/// flush.
pub struct CodecWriter<W> {
    frames: FrameWriter<W>,
    content: ContentType,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(inner: W, content: ContentType) -> Self {
        CodecWriter {
            frames: FrameWriter::new(inner),
            content,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content
    }

    /// Encode and write one header+body pair, then flush.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.content.marshal(body)?;
        self.write_raw(header, &body).await
    }

    /// Write one header+body pair where the body is already encoded.
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.content.marshal(header)?;
        self.frames.write_frame(&header).await?;
        self.frames.write_frame(body).await?;
        self.frames.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown().await?;
        Ok(())
    }
}
