use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::CdpError;
use crate::frame::{encode_frame, FrameDecoder};
use crate::metrics;

/// Command ids are unique for the whole process, across browsers and dispatchers.
static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 64 * 1024;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&CdpEvent) + Send + Sync>;

/// An unsolicited message from Chromium.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    pub method: String,
    pub session_id: Option<String>,
    pub params: Value,
}

/// Consumes the raw `result` span of one response on the reader task.
///
/// Implementations must not block; they run inline with frame dispatch.
pub trait ResponseHandler: Send + Sync {
    fn on_response(self: Box<Self>, response: Result<&RawValue, CdpError>);
}

enum Pending {
    Value {
        method: String,
        started: Instant,
        tx: oneshot::Sender<Result<Value, CdpError>>,
    },
    Handler(Box<dyn ResponseHandler>),
}

impl Pending {
    fn fail(self, err: CdpError) {
        match self {
            Pending::Value { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Pending::Handler(handler) => handler.on_response(Err(err)),
        }
    }
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct Envelope<'a> {
    id: Option<u64>,
    #[serde(borrow)]
    method: Option<Cow<'a, str>>,
    #[serde(rename = "sessionId", borrow)]
    session_id: Option<Cow<'a, str>>,
    #[serde(borrow)]
    params: Option<&'a RawValue>,
    #[serde(borrow)]
    result: Option<&'a RawValue>,
    #[serde(borrow)]
    error: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<Value>,
}

struct Inner {
    pending: DashMap<u64, Pending>,
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    close_reason: SyncMutex<Option<String>>,
}

impl Inner {
    fn closed_error(&self) -> CdpError {
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "dispatcher closed".to_string());
        CdpError::Transport(reason)
    }

    /// Marks the dispatcher dead and resolves every outstanding request with a transport error.
    fn fail_all(&self, reason: String) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            warn!(target: "cdp-dispatcher", pending = ids.len(), %reason, "failing outstanding commands");
        }
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.fail(CdpError::Transport(reason.clone()));
            }
        }
    }

    fn remove_listener(&self, method: &str, id: ListenerId) -> bool {
        let mut removed = false;
        let mut now_empty = false;
        if let Some(mut list) = self.listeners.get_mut(method) {
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            removed = list.len() != before;
            now_empty = list.is_empty();
        }
        if now_empty {
            self.listeners.remove_if(method, |_, list| list.is_empty());
        }
        removed
    }

    fn handle_frame(&self, frame: &[u8]) -> Result<(), CdpError> {
        let envelope: Envelope<'_> = serde_json::from_slice(frame)
            .map_err(|err| CdpError::transport(format!("malformed frame: {err}")))?;

        if let Some(id) = envelope.id {
            self.resolve(id, &envelope);
            return Ok(());
        }

        if let Some(method) = envelope.method.as_deref() {
            self.emit(method, &envelope)?;
        }
        Ok(())
    }

    fn resolve(&self, id: u64, envelope: &Envelope<'_>) {
        let Some((_, pending)) = self.pending.remove(&id) else {
            trace!(target: "cdp-dispatcher", id, "response without pending command");
            return;
        };

        let outcome: Result<&RawValue, CdpError> = match (envelope.error, envelope.result) {
            (Some(error), _) => Err(protocol_error(error)),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(CdpError::decode(
                "response",
                format!("command {id} returned neither result nor error"),
            )),
        };

        match pending {
            Pending::Value {
                method,
                started,
                tx,
            } => {
                let value = match outcome {
                    Ok(raw) => {
                        metrics::record_command_success(&method, started.elapsed());
                        serde_json::from_str::<Value>(raw.get())
                            .map_err(|err| CdpError::decode(&method, err.to_string()))
                    }
                    Err(err) => {
                        metrics::record_command_failure(&method);
                        Err(err)
                    }
                };
                let _ = tx.send(value);
            }
            Pending::Handler(handler) => handler.on_response(outcome),
        }
    }

    fn emit(&self, method: &str, envelope: &Envelope<'_>) -> Result<(), CdpError> {
        metrics::record_event();
        let listeners: Vec<Listener> = match self.listeners.get(method) {
            Some(list) if !list.is_empty() => {
                list.iter().map(|(_, listener)| listener.clone()).collect()
            }
            _ => return Ok(()),
        };

        let params = match envelope.params {
            Some(raw) => serde_json::from_str(raw.get())
                .map_err(|err| CdpError::transport(format!("malformed {method} params: {err}")))?,
            None => Value::Null,
        };
        let event = CdpEvent {
            method: method.to_string(),
            session_id: envelope.session_id.as_deref().map(str::to_string),
            params,
        };
        for listener in listeners {
            listener(&event);
        }
        Ok(())
    }
}

fn protocol_error(raw: &RawValue) -> CdpError {
    match serde_json::from_str::<ErrorBody>(raw.get()) {
        Ok(body) => CdpError::Protocol {
            code: body.code,
            message: body.message,
            data: body.data.map(|data| match data {
                Value::String(text) => text,
                other => other.to_string(),
            }),
            raw: raw.get().to_string(),
        },
        Err(_) => CdpError::Protocol {
            code: 0,
            message: "unrecognised error payload".to_string(),
            data: None,
            raw: raw.get().to_string(),
        },
    }
}

/// The pipe's reader and writer tasks, aborted together with the last dispatcher handle.
struct IoTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for IoTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Drops the pending entry of a `send` whose caller stopped waiting for the response.
struct PendingSlot<'a> {
    pending: &'a DashMap<u64, Pending>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.id).is_some() {
            trace!(target: "cdp-dispatcher", id = self.id, "abandoned command");
        }
    }
}

/// Multiplexes CDP commands and events over one framed duplex stream.
///
/// Cloning yields another handle to the same connection; the I/O tasks stop once the last
/// handle is dropped. Encoded frames are handed to a single writer task, so a caller that gives
/// up mid-command never leaves a partial frame on the pipe.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    tasks: Arc<IoTasks>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Dispatcher {
    /// Wraps a reader/writer pair and spawns the read loop. Must be called inside a runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (frames, outbound) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            pending: DashMap::new(),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            frames,
            closed: AtomicBool::new(false),
            close_reason: SyncMutex::new(None),
        });

        let tasks = IoTasks {
            reader: tokio::spawn(read_loop(reader, inner.clone())),
            writer: tokio::spawn(write_loop(writer, outbound, inner.clone())),
        };
        Self {
            inner,
            tasks: Arc::new(tasks),
        }
    }

    /// Sends one command and waits for its correlated response.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        let (tx, rx) = oneshot::channel();
        let pending = Pending::Value {
            method: method.to_string(),
            started: Instant::now(),
            tx,
        };
        let id = self.submit(method, &params, session_id, pending)?;
        let _slot = PendingSlot {
            pending: &self.inner.pending,
            id,
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inner.closed_error()),
        }
    }

    /// Sends one command whose response is consumed by `handler` on the reader task.
    ///
    /// Returns once the frame is queued; the handler observes the result or the error.
    pub async fn send_with_handler(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<(), CdpError> {
        self.submit(method, &params, session_id, Pending::Handler(handler))
            .map(|_| ())
    }

    /// Registers the pending entry and queues the encoded frame. Never suspends.
    fn submit(
        &self,
        method: &str,
        params: &Value,
        session_id: Option<&str>,
        pending: Pending,
    ) -> Result<u64, CdpError> {
        if self.is_closed() {
            let err = self.inner.closed_error();
            pending.fail(err.clone());
            return Err(err);
        }

        metrics::record_command(method);
        let id = NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.insert(id, pending);

        // The reader may have failed between the check and the insert.
        if self.is_closed() {
            let err = self.inner.closed_error();
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.fail(err.clone());
            }
            return Err(err);
        }

        let message = OutboundMessage {
            id,
            method,
            params,
            session_id,
        };

        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(err) => {
                let err = CdpError::decode(method, format!("failed to encode params: {err}"));
                if let Some((_, pending)) = self.inner.pending.remove(&id) {
                    pending.fail(err.clone());
                }
                return Err(err);
            }
        };
        let mut frame = Vec::new();
        encode_frame(&mut frame, &payload);

        trace!(target: "cdp-dispatcher", id, method, session = ?session_id, bytes = frame.len(), "send");
        if self.inner.frames.send(frame).is_err() {
            let err = self.inner.closed_error();
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.fail(err.clone());
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Registers `listener` for `method`. Listeners run on the reader task in registration order.
    pub fn on<F>(&self, method: &str, listener: F) -> ListenerId
    where
        F: Fn(&CdpEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(method.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off(&self, method: &str, id: ListenerId) -> bool {
        self.inner.remove_listener(method, id)
    }

    /// Like [`Dispatcher::on`], but the registration is undone when the guard drops.
    pub fn subscribe<F>(&self, method: &str, listener: F) -> ListenerGuard
    where
        F: Fn(&CdpEvent) + Send + Sync + 'static,
    {
        let id = self.on(method, listener);
        ListenerGuard {
            inner: self.inner.clone(),
            method: method.to_string(),
            id,
        }
    }

    pub fn listener_count(&self, method: &str) -> usize {
        self.inner
            .listeners
            .get(method)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// Stops the read loop and fails everything still outstanding.
    pub fn close(&self, reason: &str) {
        self.tasks.reader.abort();
        self.inner.fail_all(reason.to_string());
    }
}

/// Removes its listener exactly once when dropped.
pub struct ListenerGuard {
    inner: Arc<Inner>,
    method: String,
    id: ListenerId,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.inner.remove_listener(&self.method, self.id);
    }
}

async fn read_loop<R>(mut reader: R, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break "pipe closed".to_string(),
            Ok(n) => n,
            Err(err) => break format!("pipe read failed: {err}"),
        };
        decoder.extend(&chunk[..read]);

        let mut fatal = None;
        while let Some(frame) = decoder.next_frame() {
            if let Err(err) = inner.handle_frame(&frame) {
                fatal = Some(err.to_string());
                break;
            }
        }
        if let Some(reason) = fatal {
            break reason;
        }
    };
    debug!(target: "cdp-dispatcher", %reason, "read loop finished");
    inner.fail_all(reason);
}

/// Writes queued frames one at a time; each frame reaches the pipe whole or not at all.
async fn write_loop<W>(
    mut sink: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    inner: Arc<Inner>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = async {
            sink.write_all(&frame).await?;
            sink.flush().await
        }
        .await;
        if let Err(err) = written {
            inner.fail_all(format!("pipe write failed: {err}"));
            break;
        }
    }
    debug!(target: "cdp-dispatcher", "write loop finished");
}
