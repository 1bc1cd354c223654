//! `Content-Length` framing for LSP JSON-RPC over child stdio.
//!
//! Each message is `Content-Length: N\r\n\r\n{json}` where `N` counts bytes.
//! [`FrameReader`] pulls frames off a server's stdout; [`FrameWriter`] pushes
//! frames into its stdin as a single write so frames never interleave.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB). Workspace symbol and rename results on large
/// repositories exceed a few MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Serialize a message with its header into one contiguous buffer.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).context("serializing JSON-RPC frame")?;
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

enum HeaderLine {
    End,
    ContentLength(usize),
    Other,
}

fn parse_header_line(line: &str) -> Result<HeaderLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(HeaderLine::End);
    }
    let Some((key, value)) = trimmed.split_once(':') else {
        return Ok(HeaderLine::Other);
    };
    if key.trim().eq_ignore_ascii_case("Content-Length") {
        let len = value
            .trim()
            .parse()
            .with_context(|| format!("invalid Content-Length value: {value:?}"))?;
        return Ok(HeaderLine::ContentLength(len));
    }
    Ok(HeaderLine::Other)
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means clean EOF between frames; EOF anywhere inside a
    /// frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;

        let value = serde_json::from_slice(&body).context("parsing JSON-RPC frame")?;
        Ok(Some(value))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("unexpected EOF while reading headers");
                }
                return Ok(None);
            }
            started = true;

            match parse_header_line(&self.line)? {
                HeaderLine::End => break,
                HeaderLine::ContentLength(len) => content_length = Some(len),
                HeaderLine::Other => {}
            }
        }

        content_length
            .map(Some)
            .context("missing Content-Length header")
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    /// Flush and close the underlying stream.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing frame writer")
    }
}
