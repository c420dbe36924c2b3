//! `IO.read` streaming of a printed document into a caller-supplied sink.

use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dispatcher::{Dispatcher, ResponseHandler};
use crate::error::CdpError;
use crate::metrics;
use crate::util::MemoryProbe;

/// Where `Page.printToPDF` put the document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrintedDocument {
    /// `transferMode: ReturnAsStream` honoured; read it with `IO.read`.
    Stream(String),
    /// Small documents may come back inline as base64.
    Inline(String),
}

impl PrintedDocument {
    pub fn from_response(response: &Value) -> Result<Self, CdpError> {
        let handle = response
            .get("stream")
            .or_else(|| response.get("streamHandle"))
            .and_then(Value::as_str)
            .filter(|handle| !handle.is_empty());
        if let Some(handle) = handle {
            return Ok(PrintedDocument::Stream(handle.to_string()));
        }
        match response.get("data").and_then(Value::as_str) {
            Some(data) => Ok(PrintedDocument::Inline(data.to_string())),
            None => Err(CdpError::decode(
                "Page.printToPDF",
                "response carried neither a stream handle nor data",
            )),
        }
    }
}

/// Decodes inline base64 and writes it to `sink`.
pub async fn write_inline<W>(data: &str, sink: &mut W) -> Result<u64, CdpError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = STANDARD
        .decode(data)
        .map_err(|err| CdpError::decode("Page.printToPDF", err.to_string()))?;
    sink.write_all(&bytes).await?;
    sink.flush().await?;
    metrics::record_pdf_chunk(bytes.len());
    Ok(bytes.len() as u64)
}

#[derive(Deserialize)]
struct IoReadResult<'a> {
    #[serde(borrow, default)]
    data: Cow<'a, str>,
    #[serde(default)]
    eof: bool,
    #[serde(rename = "base64Encoded", default)]
    base64_encoded: bool,
}

struct Chunk {
    buf: Vec<u8>,
    eof: bool,
}

type ChunkResult = Result<Chunk, (Vec<u8>, CdpError)>;

/// Decodes one `IO.read` response into the buffer it was lent, then hands the buffer back.
struct ChunkHandler {
    buf: Vec<u8>,
    tx: oneshot::Sender<ChunkResult>,
}

impl ResponseHandler for ChunkHandler {
    fn on_response(self: Box<Self>, response: Result<&RawValue, CdpError>) {
        let ChunkHandler { mut buf, tx } = *self;
        buf.clear();
        let outcome = match response.and_then(|raw| decode_chunk(raw, &mut buf)) {
            Ok(eof) => Ok(Chunk { buf, eof }),
            Err(err) => Err((buf, err)),
        };
        let _ = tx.send(outcome);
    }
}

fn decode_chunk(raw: &RawValue, out: &mut Vec<u8>) -> Result<bool, CdpError> {
    let result: IoReadResult<'_> = serde_json::from_str(raw.get())
        .map_err(|err| CdpError::decode("IO.read", err.to_string()))?;
    if result.base64_encoded {
        STANDARD
            .decode_vec(result.data.as_bytes(), out)
            .map_err(|err| CdpError::decode("IO.read", err.to_string()))?;
    } else {
        out.extend_from_slice(result.data.as_bytes());
    }
    Ok(result.eof)
}

/// Closes a CDP stream handle exactly once.
///
/// [`StreamGuard::close`] awaits `IO.close`; if the guard is dropped instead (a cancelled
/// future), the close is spawned onto the current runtime.
pub struct StreamGuard {
    dispatcher: Dispatcher,
    session_id: String,
    handle: Option<String>,
}

impl StreamGuard {
    pub fn new(dispatcher: Dispatcher, session_id: &str, handle: &str) -> Self {
        Self {
            dispatcher,
            session_id: session_id.to_string(),
            handle: Some(handle.to_string()),
        }
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub async fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            close_stream(&self.dispatcher, &self.session_id, handle).await;
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let session_id = std::mem::take(&mut self.session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    close_stream(&dispatcher, &session_id, handle).await;
                });
            }
            Err(_) => {
                debug!(target: "cdp-pipe", %handle, "no runtime available to close stream");
            }
        }
    }
}

async fn close_stream(dispatcher: &Dispatcher, session_id: &str, handle: String) {
    if let Err(err) = dispatcher
        .send("IO.close", json!({ "handle": handle }), Some(session_id))
        .await
    {
        trace!(target: "cdp-pipe", %handle, ?err, "IO.close failed");
    }
}

/// Pulls a stream chunk by chunk, lending one decode buffer to each in-flight read.
pub struct PdfStreamReader<'a> {
    dispatcher: &'a Dispatcher,
    session_id: &'a str,
    handle: &'a str,
    chunk_size: usize,
    probe: MemoryProbe,
    check_every: u32,
    scratch: Option<Vec<u8>>,
    chunks: u64,
}

impl<'a> PdfStreamReader<'a> {
    pub fn new(
        dispatcher: &'a Dispatcher,
        session_id: &'a str,
        handle: &'a str,
        chunk_size: usize,
        probe: MemoryProbe,
        check_every: u32,
    ) -> Self {
        Self {
            dispatcher,
            session_id,
            handle,
            chunk_size,
            probe,
            check_every: check_every.max(1),
            scratch: None,
            chunks: 0,
        }
    }

    /// Streams until `eof`, returning the number of bytes written to `sink`.
    pub async fn copy_to<W>(
        &mut self,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, CdpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(CdpError::Cancelled);
            }
            if self.chunks % u64::from(self.check_every) == 0 {
                self.relieve_memory_pressure().await;
            }

            let chunk = self.read_chunk(cancel).await?;
            sink.write_all(&chunk.buf).await?;
            written += chunk.buf.len() as u64;
            self.chunks += 1;
            metrics::record_pdf_chunk(chunk.buf.len());
            trace!(
                target: "cdp-pipe",
                handle = self.handle,
                chunk = self.chunks,
                bytes = chunk.buf.len(),
                eof = chunk.eof,
                "pdf chunk"
            );

            let eof = chunk.eof;
            self.scratch = Some(chunk.buf);
            if eof {
                break;
            }
        }
        sink.flush().await?;
        Ok(written)
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks
    }

    async fn read_chunk(&mut self, cancel: &CancellationToken) -> Result<Chunk, CdpError> {
        let buf = self
            .scratch
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.chunk_size));
        let (tx, rx) = oneshot::channel();
        self.dispatcher
            .send_with_handler(
                "IO.read",
                json!({ "handle": self.handle, "size": self.chunk_size }),
                Some(self.session_id),
                Box::new(ChunkHandler { buf, tx }),
            )
            .await?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(CdpError::Cancelled),
            outcome = rx => outcome,
        };
        match outcome {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err((buf, err))) => {
                self.scratch = Some(buf);
                Err(err)
            }
            Err(_) => Err(CdpError::transport("IO.read response dropped")),
        }
    }

    /// Under memory pressure drop the cached buffer and let other tasks run before continuing.
    async fn relieve_memory_pressure(&mut self) {
        if !self.probe.under_pressure() {
            return;
        }
        metrics::record_memory_pressure();
        warn!(
            target: "cdp-pipe",
            handle = self.handle,
            threshold_bytes = self.probe.threshold_bytes(),
            available_bytes = ?self.probe.available_bytes(),
            "available memory below threshold; releasing scratch buffer"
        );
        self.scratch = None;
        tokio::task::yield_now().await;
    }
}
