//! In-process stand-in for Chromium: answers CDP frames over a duplex stream.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cdp_pipe::Dispatcher;
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

pub type Outbound = Vec<(Duration, Value)>;

/// Every frame the fake received, in arrival order.
#[derive(Clone, Default)]
pub struct FrameLog(Arc<Mutex<Vec<Value>>>);

impl FrameLog {
    pub fn methods(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| frame["method"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    pub fn frames(&self, method: &str) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame["method"] == method)
            .cloned()
            .collect()
    }
}

pub fn reply(frame: &Value, result: Value) -> Value {
    json!({ "id": frame["id"], "result": result })
}

pub fn reply_error(frame: &Value, code: i64, message: &str) -> Value {
    json!({ "id": frame["id"], "error": { "code": code, "message": message } })
}

/// Wires a dispatcher to a responder. Zero-delay messages are written in order on the fake's
/// read task; delayed ones are written from their own task.
pub fn spawn_fake<F>(responder: F) -> (Dispatcher, FrameLog)
where
    F: Fn(&Value) -> Outbound + Send + Sync + 'static,
{
    let (client, server) = duplex(1 << 20);
    let (client_r, client_w) = split(client);
    let dispatcher = Dispatcher::new(client_r, client_w);

    let (server_r, server_w) = split(server);
    let server_w = Arc::new(tokio::sync::Mutex::new(server_w));
    let log = FrameLog::default();
    let task_log = log.clone();

    tokio::spawn(async move {
        let mut reader = BufReader::new(server_r);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(0, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if buf.last() == Some(&0) {
                buf.pop();
            }
            let frame: Value = serde_json::from_slice(&buf).expect("client sent valid json");
            task_log.0.lock().unwrap().push(frame.clone());

            for (delay, message) in responder(&frame) {
                let mut bytes = serde_json::to_vec(&message).unwrap();
                bytes.push(0);
                if delay.is_zero() {
                    let _ = server_w.lock().await.write_all(&bytes).await;
                } else {
                    let writer = server_w.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = writer.lock().await.write_all(&bytes).await;
                    });
                }
            }
        }
    });

    (dispatcher, log)
}

/// Behaviour switches for [`FakeChrome`].
#[derive(Clone)]
pub struct FakeChromeConfig {
    pub pdf: Vec<u8>,
    pub chunk_size: usize,
    pub inline: bool,
    pub read_delay: Duration,
    pub ready_state: &'static str,
    pub zones: Value,
}

impl Default for FakeChromeConfig {
    fn default() -> Self {
        Self {
            pdf: sample_pdf(),
            chunk_size: 64,
            inline: false,
            read_delay: Duration::ZERO,
            ready_state: "complete",
            zones: json!([]),
        }
    }
}

/// Counters observed by tests.
#[derive(Default)]
pub struct FakeChromeStats {
    pub open_streams: AtomicUsize,
    pub max_open_streams: AtomicUsize,
    pub closed_streams: AtomicUsize,
}

pub struct FakeChrome {
    pub dispatcher: Dispatcher,
    pub log: FrameLog,
    pub stats: Arc<FakeChromeStats>,
}

impl FakeChrome {
    pub fn spawn(config: FakeChromeConfig) -> Self {
        let stats = Arc::new(FakeChromeStats::default());
        let positions: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let next = Arc::new(AtomicUsize::new(1));
        let responder_stats = stats.clone();

        let (dispatcher, log) = spawn_fake(move |frame| {
            let method = frame["method"].as_str().unwrap_or_default();
            let now = Duration::ZERO;
            match method {
                "Browser.getVersion" => vec![(
                    now,
                    reply(
                        frame,
                        json!({
                            "protocolVersion": "1.3",
                            "product": "HeadlessChrome/124.0.0.0",
                            "revision": "@0",
                            "userAgent": "Mozilla/5.0 HeadlessChrome",
                            "jsVersion": "12.4"
                        }),
                    ),
                )],
                "Target.createTarget" => {
                    let n = next.fetch_add(1, Ordering::SeqCst);
                    vec![(now, reply(frame, json!({ "targetId": format!("T{n}") })))]
                }
                "Target.attachToTarget" => {
                    let target = frame["params"]["targetId"].as_str().unwrap_or("T0");
                    vec![(now, reply(frame, json!({ "sessionId": format!("S-{target}") })))]
                }
                "Page.getFrameTree" => vec![(
                    now,
                    reply(frame, json!({ "frameTree": { "frame": { "id": "F1" } } })),
                )],
                "Runtime.evaluate" => {
                    let expression = frame["params"]["expression"].as_str().unwrap_or_default();
                    let result = if expression == "document.readyState" {
                        json!({ "type": "string", "value": config.ready_state })
                    } else if expression.contains("signature-area-") {
                        json!({ "type": "object", "value": config.zones })
                    } else {
                        json!({ "type": "undefined" })
                    };
                    vec![(now, reply(frame, json!({ "result": result })))]
                }
                "Page.printToPDF" => {
                    if config.inline {
                        vec![(now, reply(frame, json!({ "data": STANDARD.encode(&config.pdf) })))]
                    } else {
                        let n = next.fetch_add(1, Ordering::SeqCst);
                        let handle = format!("stream-{n}");
                        positions.lock().unwrap().insert(handle.clone(), 0);
                        let open = responder_stats.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
                        responder_stats
                            .max_open_streams
                            .fetch_max(open, Ordering::SeqCst);
                        vec![(now, reply(frame, json!({ "data": "", "stream": handle })))]
                    }
                }
                "IO.read" => {
                    let handle = frame["params"]["handle"].as_str().unwrap_or_default();
                    let mut positions = positions.lock().unwrap();
                    let Some(pos) = positions.get_mut(handle) else {
                        return vec![(now, reply_error(frame, -32000, "Invalid stream handle"))];
                    };
                    let end = (*pos + config.chunk_size).min(config.pdf.len());
                    let chunk = &config.pdf[*pos..end];
                    *pos = end;
                    let eof = end == config.pdf.len();
                    vec![(
                        config.read_delay,
                        reply(
                            frame,
                            json!({
                                "base64Encoded": true,
                                "data": STANDARD.encode(chunk),
                                "eof": eof
                            }),
                        ),
                    )]
                }
                "IO.close" => {
                    let handle = frame["params"]["handle"].as_str().unwrap_or_default();
                    if positions.lock().unwrap().remove(handle).is_some() {
                        responder_stats.open_streams.fetch_sub(1, Ordering::SeqCst);
                        responder_stats.closed_streams.fetch_add(1, Ordering::SeqCst);
                    }
                    vec![(now, reply(frame, json!({})))]
                }
                "Target.closeTarget" => vec![(now, reply(frame, json!({ "success": true })))],
                _ => vec![(now, reply(frame, json!({})))],
            }
        });

        Self {
            dispatcher,
            log,
            stats,
        }
    }
}

/// Smallest byte string that looks like a PDF to the assertions.
pub fn sample_pdf() -> Vec<u8> {
    let mut pdf = b"%PDF-1.4\n".to_vec();
    pdf.extend(std::iter::repeat(b'x').take(500));
    pdf.extend_from_slice(b"\n%%EOF\n");
    pdf
}
