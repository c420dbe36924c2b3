use std::fs;
use std::path::PathBuf;

use tracing::debug;

const MEMINFO: &str = "/proc/meminfo";

/// Samples available system memory from `/proc/meminfo`.
#[derive(Clone, Debug)]
pub struct MemoryProbe {
    source: PathBuf,
    threshold_bytes: u64,
}

impl MemoryProbe {
    pub fn new(threshold_mb: u64) -> Self {
        Self::with_source(MEMINFO, threshold_mb)
    }

    pub fn with_source(source: impl Into<PathBuf>, threshold_mb: u64) -> Self {
        Self {
            source: source.into(),
            threshold_bytes: threshold_mb.saturating_mul(1024 * 1024),
        }
    }

    /// `MemAvailable` in bytes, or `None` when the kernel does not report it.
    pub fn available_bytes(&self) -> Option<u64> {
        let text = match fs::read_to_string(&self.source) {
            Ok(text) => text,
            Err(err) => {
                debug!(target: "cdp-pipe", ?err, path = %self.source.display(), "meminfo unreadable");
                return None;
            }
        };
        parse_mem_available(&text)
    }

    /// True when available memory is known and below the threshold.
    pub fn under_pressure(&self) -> bool {
        matches!(self.available_bytes(), Some(available) if available < self.threshold_bytes)
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }
}

fn parse_mem_available(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| {
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let scale = match parts.next() {
                Some("kB") | Some("KB") => 1024,
                Some("mB") | Some("MB") => 1024 * 1024,
                _ => 1,
            };
            Some(value.saturating_mul(scale))
        })
}
