use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::ContentType;
use crate::error::{Result, RpcError};

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3def5c;

/// Default bound on dial plus option handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection preamble, exchanged exactly once per connection before any
/// header/body traffic: the client writes it as a single JSON line, the
/// server reads it and selects the body codec from it.
///
/// Durations cross the wire as integer nanoseconds; zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: String,
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options::with_codec(ContentType::Bincode)
    }
}

impl Options {
    /// Default options with an explicit body codec.
    pub fn with_codec(content: ContentType) -> Self {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: content.name().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Write the option preamble as one newline-terminated JSON line and flush.
pub(crate) async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line =
        serde_json::to_vec(options).map_err(|err| RpcError::Codec(err.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the option preamble: everything up to the first newline, parsed as
/// JSON. No length prefix; surrounding whitespace is tolerated.
pub(crate) async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(RpcError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the option exchange",
        )));
    }
    serde_json::from_slice(&line).map_err(|err| RpcError::Codec(format!("option decode: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_encode_with_wire_field_names() {
        let json = serde_json::to_string(&Options::default()).unwrap();
        assert!(json.contains("\"MagicNumber\""));
        assert!(json.contains("\"CodecType\""));
        assert!(json.contains("\"ConnectTimeout\""));
        assert!(json.contains("\"HandleTimeout\""));
    }

    #[test]
    fn durations_cross_the_wire_as_nanoseconds() {
        let mut options = Options::default();
        options.handle_timeout = Duration::from_secs(1);
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"HandleTimeout\":1000000000"));

        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back.handle_timeout, Duration::from_secs(1));
        assert_eq!(back.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn preamble_round_trips_over_a_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = client;
        write_options(&mut client, &Options::default()).await.unwrap();

        let mut reader = tokio::io::BufReader::new(server);
        let options = read_options(&mut reader).await.unwrap();
        assert_eq!(options.magic_number, MAGIC_NUMBER);
        assert_eq!(options.codec_type, ContentType::BINCODE);
    }

    #[tokio::test]
    async fn preamble_tolerates_leading_whitespace() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = client;
        let json = serde_json::to_string(&Options::default()).unwrap();
        client
            .write_all(format!("  {json}  \n").as_bytes())
            .await
            .unwrap();

        let mut reader = tokio::io::BufReader::new(server);
        let options = read_options(&mut reader).await.unwrap();
        assert_eq!(options.magic_number, MAGIC_NUMBER);
    }

    #[tokio::test]
    async fn missing_preamble_is_an_eof_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        let mut reader = tokio::io::BufReader::new(server);
        let err = read_options(&mut reader).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
