//! Process-wide counters for the CDP client and the PDF stream reader.
//!
//! Atomics back [`snapshot`] for cheap in-process reads; the prometheus collectors are only
//! exported once a caller hands a registry to [`register_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Registry,
};
use tracing::warn;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CdpMetricsSnapshot {
    pub commands: u64,
    pub events: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
    pub pdf_chunks: u64,
    pub pdf_bytes: u64,
    pub memory_pressure_events: u64,
}

struct Tally {
    sent: AtomicU64,
    answered: AtomicU64,
    rejected: AtomicU64,
    latency_us: AtomicU64,
    events: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    pressure: AtomicU64,
}

impl Tally {
    const fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            events: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            pressure: AtomicU64::new(0),
        }
    }

    fn cells(&self) -> [&AtomicU64; 8] {
        [
            &self.sent,
            &self.answered,
            &self.rejected,
            &self.latency_us,
            &self.events,
            &self.chunks,
            &self.bytes,
            &self.pressure,
        ]
    }
}

static TALLY: Tally = Tally::new();

struct Collectors {
    sent: IntCounterVec,
    rejected: IntCounterVec,
    round_trip: HistogramVec,
    events: IntCounter,
    chunks: IntCounter,
    bytes: IntCounter,
    pressure: IntCounter,
    printing: IntGauge,
}

impl Collectors {
    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            sent: IntCounterVec::new(
                opts!("pdfpipe_cdp_commands_total", "CDP commands written to the pipe"),
                &["method"],
            )?,
            rejected: IntCounterVec::new(
                opts!(
                    "pdfpipe_cdp_command_failures_total",
                    "CDP commands answered with an error object"
                ),
                &["method"],
            )?,
            round_trip: HistogramVec::new(
                histogram_opts!(
                    "pdfpipe_cdp_command_duration_seconds",
                    "Time from writing a command to reading its response",
                    vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
                ),
                &["method"],
            )?,
            events: IntCounter::new("pdfpipe_cdp_events_total", "CDP events read from the pipe")?,
            chunks: IntCounter::new("pdfpipe_pdf_chunks_total", "IO.read chunks decoded")?,
            bytes: IntCounter::new("pdfpipe_pdf_bytes_total", "PDF bytes written to sinks")?,
            pressure: IntCounter::new(
                "pdfpipe_memory_pressure_total",
                "Reads that found available memory under the threshold",
            )?,
            printing: IntGauge::new(
                "pdfpipe_active_renders",
                "printToPDF calls holding a render permit",
            )?,
        })
    }

    fn each(&self) -> [Box<dyn Collector>; 8] {
        [
            Box::new(self.sent.clone()),
            Box::new(self.rejected.clone()),
            Box::new(self.round_trip.clone()),
            Box::new(self.events.clone()),
            Box::new(self.chunks.clone()),
            Box::new(self.bytes.clone()),
            Box::new(self.pressure.clone()),
            Box::new(self.printing.clone()),
        ]
    }
}

lazy_static! {
    // Names and help strings are constants; construction only fails on a malformed name.
    static ref COLLECTORS: Collectors =
        Collectors::build().expect("static cdp metric definitions are valid");
}

/// Adds every collector to `registry`. Registering twice is harmless.
pub fn register_metrics(registry: &Registry) {
    for collector in COLLECTORS.each() {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => warn!(target: "cdp-pipe", ?err, "cdp metric not registered"),
        }
    }
}

pub fn record_command(method: &str) {
    TALLY.sent.fetch_add(1, Ordering::Relaxed);
    COLLECTORS.sent.with_label_values(&[method]).inc();
}

pub fn record_command_success(method: &str, elapsed: Duration) {
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    TALLY.answered.fetch_add(1, Ordering::Relaxed);
    TALLY.latency_us.fetch_add(micros, Ordering::Relaxed);
    COLLECTORS
        .round_trip
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn record_command_failure(method: &str) {
    TALLY.rejected.fetch_add(1, Ordering::Relaxed);
    COLLECTORS.rejected.with_label_values(&[method]).inc();
}

pub fn record_event() {
    TALLY.events.fetch_add(1, Ordering::Relaxed);
    COLLECTORS.events.inc();
}

pub fn record_pdf_chunk(len: usize) {
    let len = len as u64;
    TALLY.chunks.fetch_add(1, Ordering::Relaxed);
    TALLY.bytes.fetch_add(len, Ordering::Relaxed);
    COLLECTORS.chunks.inc();
    COLLECTORS.bytes.inc_by(len);
}

pub fn record_memory_pressure() {
    TALLY.pressure.fetch_add(1, Ordering::Relaxed);
    COLLECTORS.pressure.inc();
}

pub fn render_started() {
    COLLECTORS.printing.inc();
}

pub fn render_finished() {
    COLLECTORS.printing.dec();
}

pub fn snapshot() -> CdpMetricsSnapshot {
    let [sent, answered, rejected, latency_us, events, chunks, bytes, pressure] =
        TALLY.cells().map(|cell| cell.load(Ordering::Relaxed));
    CdpMetricsSnapshot {
        commands: sent,
        events,
        command_success: answered,
        command_failures: rejected,
        command_latency_total_us: latency_us,
        pdf_chunks: chunks,
        pdf_bytes: bytes,
        memory_pressure_events: pressure,
    }
}

/// Zeroes the in-process tallies. Prometheus collectors keep counting.
pub fn reset() {
    for cell in TALLY.cells() {
        cell.store(0, Ordering::Relaxed);
    }
}
