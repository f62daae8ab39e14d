//! Framing-free JSON codec.
//!
//! Messages are self-delimiting JSON values written back to back. The decoder
//! buffers raw bytes and hands out every complete value it can find; the
//! encoder writes one compact value per line.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};

/// Incremental decoder over a growing byte buffer
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True if bytes of an unfinished value are buffered.
    pub fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Next complete value, or `None` if more bytes are needed.
    ///
    /// Syntax errors are returned as `MalformedMessage`; the decoder then skips
    /// ahead to the next `{` so later messages still decode.
    pub fn next_value(&mut self) -> Option<RpcResult<serde_json::Value>> {
        let (next, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<serde_json::Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => {
                // Only whitespace left.
                self.buf.clear();
                None
            }
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Some(Ok(value))
            }
            Some(Err(err)) if err.is_eof() => None,
            Some(Err(err)) => {
                self.resync();
                Some(Err(RpcError::MalformedMessage(err.to_string())))
            }
        }
    }

    fn resync(&mut self) {
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        let next_object = self
            .buf
            .get(start + 1..)
            .and_then(|rest| rest.iter().position(|&b| b == b'{'))
            .map(|offset| start + 1 + offset);

        match next_object {
            Some(at) => {
                self.buf.drain(..at);
            }
            None => self.buf.clear(),
        }
    }
}

/// Writes `message` as a single line of compact JSON and flushes the sink.
pub async fn encode<W, M>(sink: &mut W, message: &M) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');

    sink.write_all(&frame)
        .await
        .map_err(RpcError::from_transport)?;
    sink.flush().await.map_err(RpcError::from_transport)?;

    Ok(())
}
