//! Message framing for JSON-RPC streams.
//!
//! Two framings are supported:
//!
//! - [`Framing::ContentLength`]: `Content-Length: N\r\n\r\n{json}`, used over
//!   stdio, pipes and sockets.
//! - [`Framing::NewlineDelimited`]: one JSON document per line, used by the
//!   node-style IPC channel.
//!
//! [`MessageReader`] and [`MessageWriter`] wrap any async byte stream.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body (4 MiB).
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on one header line, terminator included.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    ContentLength,
    NewlineDelimited,
}

pub struct MessageReader<R> {
    reader: BufReader<R>,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on a clean EOF between messages.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        match self.framing {
            Framing::ContentLength => self.read_content_length_message().await,
            Framing::NewlineDelimited => self.read_line_message().await,
        }
    }

    async fn read_content_length_message(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_MESSAGE_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_MESSAGE_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading message body")?;

        let value = serde_json::from_slice(&body).context("parsing JSON-RPC message")?;
        Ok(Some(value))
    }

    /// Returns the `Content-Length` value, or `None` on EOF before any header byte.
    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut line = String::new();
        let mut started = false;

        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64 + 1)
                .read_line(&mut line)
                .await
                .context("reading header line")?;
            if line.len() > MAX_HEADER_LINE_BYTES {
                bail!("header line exceeds maximum {MAX_HEADER_LINE_BYTES} bytes");
            }

            if read == 0 {
                if !started {
                    return Ok(None);
                }
                bail!("unexpected EOF while reading headers");
            }
            started = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            let Some((key, value)) = trimmed.split_once(':') else {
                bail!("malformed header line: {trimmed:?}");
            };
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .context("invalid Content-Length value")?;
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("missing Content-Length header"),
        }
    }

    async fn read_line_message(&mut self) -> Result<Option<serde_json::Value>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = (&mut self.reader)
                .take(MAX_MESSAGE_BYTES as u64 + 1)
                .read_line(&mut line)
                .await
                .context("reading message line")?;
            if read == 0 {
                return Ok(None);
            }
            if line.len() > MAX_MESSAGE_BYTES {
                bail!("message line of {} bytes exceeds maximum {MAX_MESSAGE_BYTES}", line.len());
            }
            // Blank keep-alive lines carry no message.
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(line.trim_end()).context("parsing JSON-RPC message")?;
            return Ok(Some(value));
        }
    }
}

pub struct MessageWriter<W> {
    writer: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    pub async fn write_message(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(message).context("serializing JSON-RPC message")?;

        match self.framing {
            Framing::ContentLength => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                self.writer
                    .write_all(header.as_bytes())
                    .await
                    .context("writing message header")?;
                self.writer
                    .write_all(body.as_bytes())
                    .await
                    .context("writing message body")?;
            }
            Framing::NewlineDelimited => {
                self.writer
                    .write_all(body.as_bytes())
                    .await
                    .context("writing message line")?;
                self.writer
                    .write_all(b"\n")
                    .await
                    .context("writing message terminator")?;
            }
        }

        self.writer.flush().await.context("flushing message")?;
        Ok(())
    }

    /// Shut down the underlying stream, signalling EOF to the peer.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing message stream")
    }
}
