//! Chromium DevTools Protocol client speaking over `--remote-debugging-pipe`.
//!
//! The crate drives a headless Chromium child through two anonymous pipes (fds 3/4), multiplexes
//! NUL-framed JSON commands over them, and exposes page sessions that load HTML, wait for it to
//! settle and stream the printed PDF back in chunks.

use std::{env, path::PathBuf};

use which::which;

pub mod error {
    use std::path::PathBuf;
    use std::time::Duration;

    use thiserror::Error;

    /// Failures surfaced by the CDP client. Cloneable so a single transport failure can be
    /// delivered to every outstanding request.
    #[derive(Clone, Debug, Error)]
    pub enum CdpError {
        /// The pipe closed or the child died; fatal for the dispatcher.
        #[error("cdp transport failure: {0}")]
        Transport(String),
        /// Chromium answered with an `error` object.
        #[error("cdp protocol error {code}: {message}")]
        Protocol {
            code: i64,
            message: String,
            data: Option<String>,
            raw: String,
        },
        #[error("chromium failed to become ready within {0:?}")]
        Startup(Duration),
        #[error("failed to spawn chromium at {path}: {reason}")]
        Spawn { path: PathBuf, reason: String },
        #[error("chromium binary not found; set binary_path or PDFPIPE_CHROMIUM")]
        BinaryNotFound,
        #[error("malformed response to {method}: {reason}")]
        Decode { method: String, reason: String },
        #[error("operation cancelled")]
        Cancelled,
        #[error("browser not started")]
        NotStarted,
        #[error("page session is closed")]
        PageClosed,
        #[error("sink i/o failure: {0}")]
        Io(String),
    }

    impl CdpError {
        pub fn transport(reason: impl Into<String>) -> Self {
            Self::Transport(reason.into())
        }

        pub fn decode(method: &str, reason: impl Into<String>) -> Self {
            Self::Decode {
                method: method.to_string(),
                reason: reason.into(),
            }
        }

        pub fn is_transport(&self) -> bool {
            matches!(self, Self::Transport(_))
        }

        pub fn is_protocol(&self) -> bool {
            matches!(self, Self::Protocol { .. })
        }
    }

    impl From<std::io::Error> for CdpError {
        fn from(err: std::io::Error) -> Self {
            Self::Io(err.to_string())
        }
    }
}

pub mod config {
    use std::path::PathBuf;
    use std::time::Duration;

    use bitflags::bitflags;
    use serde::{Deserialize, Serialize};

    use crate::error::CdpError;

    bitflags! {
        /// Conditions that mark a page as ready to print. Flags are evaluated together on each
        /// poll and the first satisfied one wins.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct WaitStrategy: u32 {
            /// `document.readyState === 'complete'`.
            const LOAD = 1;
            /// At most two requests in flight for 500ms.
            const NETWORK_IDLE = 2;
            /// A configured expression evaluates to the expected value.
            const JAVASCRIPT_VARIABLE = 4;
        }
    }

    impl Default for WaitStrategy {
        fn default() -> Self {
            WaitStrategy::LOAD
        }
    }

    impl WaitStrategy {
        /// Parse a comma separated list such as `load,network-idle`.
        pub fn parse_list(raw: &str) -> Result<Self, String> {
            let mut flags = WaitStrategy::empty();
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let flag = match part.to_ascii_lowercase().replace('_', "-").as_str() {
                    "load" => WaitStrategy::LOAD,
                    "network-idle" | "networkidle" => WaitStrategy::NETWORK_IDLE,
                    "js-variable" | "javascript-variable" | "javascriptvariable" => {
                        WaitStrategy::JAVASCRIPT_VARIABLE
                    }
                    "none" => WaitStrategy::empty(),
                    other => return Err(format!("unknown wait strategy '{other}'")),
                };
                flags |= flag;
            }
            Ok(flags)
        }
    }

    pub const MIN_IO_READ_CHUNK: usize = 256 * 1024;
    pub const MAX_IO_READ_CHUNK: usize = 1024 * 1024;

    /// Launch and render tuning for a [`crate::browser::Browser`].
    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BrowserOptions {
        /// Upper bound on concurrent `Page.printToPDF` streams.
        #[serde(alias = "MaxConcurrentRenders")]
        pub max_concurrent_renders: usize,
        /// Below this much available memory the stream reader backs off.
        #[serde(alias = "MemoryThresholdMb")]
        pub memory_threshold_mb: u64,
        #[serde(alias = "BinaryPath")]
        pub binary_path: Option<PathBuf>,
        #[serde(alias = "WaitStrategy")]
        pub wait_strategy: WaitStrategy,
        #[serde(alias = "WaitVariable")]
        pub wait_variable: Option<String>,
        #[serde(alias = "WaitVariableValue")]
        pub wait_variable_value: Option<String>,
        /// `None` waits without a deadline.
        #[serde(alias = "WaitTimeoutMs")]
        pub wait_timeout_ms: Option<u64>,
        pub poll_interval_ms: u64,
        pub startup_timeout_ms: u64,
        pub io_read_chunk_bytes: usize,
        pub memory_check_interval_chunks: u32,
        pub extra_args: Vec<String>,
    }

    impl Default for BrowserOptions {
        fn default() -> Self {
            Self {
                max_concurrent_renders: num_cpus::get().max(1),
                memory_threshold_mb: 1024,
                binary_path: None,
                wait_strategy: WaitStrategy::LOAD,
                wait_variable: None,
                wait_variable_value: None,
                wait_timeout_ms: Some(10_000),
                poll_interval_ms: 50,
                startup_timeout_ms: 5_000,
                io_read_chunk_bytes: MIN_IO_READ_CHUNK,
                memory_check_interval_chunks: 16,
                extra_args: Vec::new(),
            }
        }
    }

    impl BrowserOptions {
        pub fn wait_timeout(&self) -> Option<Duration> {
            self.wait_timeout_ms.map(Duration::from_millis)
        }

        pub fn poll_interval(&self) -> Duration {
            Duration::from_millis(self.poll_interval_ms.max(1))
        }

        pub fn startup_timeout(&self) -> Duration {
            Duration::from_millis(self.startup_timeout_ms)
        }

        pub fn io_read_chunk(&self) -> usize {
            self.io_read_chunk_bytes
                .clamp(MIN_IO_READ_CHUNK, MAX_IO_READ_CHUNK)
        }

        pub fn render_permits(&self) -> usize {
            self.max_concurrent_renders.max(1)
        }

        /// Explicit path first, then the usual discovery chain.
        pub fn resolve_binary(&self) -> Result<PathBuf, CdpError> {
            if let Some(path) = &self.binary_path {
                if !path.as_os_str().is_empty() {
                    return Ok(path.clone());
                }
            }
            crate::detect_chromium_executable().ok_or(CdpError::BinaryNotFound)
        }
    }
}

pub mod browser;
pub mod dispatcher;
pub mod events;
pub mod frame;
pub mod metrics;
pub mod page;
pub mod pipe;
pub mod stream;
pub mod util;
pub mod wait;
pub mod zones;

pub use browser::Browser;
pub use config::{BrowserOptions, WaitStrategy};
pub use dispatcher::{CdpEvent, Dispatcher, ListenerGuard, ListenerId, ResponseHandler};
pub use error::CdpError;
pub use metrics::CdpMetricsSnapshot;
pub use page::{Page, PageState, PrintOptions, PrintOutcome};
pub use pdfpipe_core_types::SignatureZone;

/// Environment variable pointing at a Chromium binary.
pub const CHROMIUM_ENV: &str = "PDFPIPE_CHROMIUM";

/// Locate a Chromium binary: env override, bundled runtime, then `PATH`.
pub fn detect_chromium_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var(CHROMIUM_ENV) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    if let Some(bundled) = bundled_runtime_path() {
        if bundled.exists() {
            return Some(bundled);
        }
    }

    for name in chromium_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    None
}

/// `runtimes/<rid>/native/chrome-shell` next to the running executable.
fn bundled_runtime_path() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?;
    let rid = match env::consts::ARCH {
        "aarch64" => "linux-arm64",
        _ => "linux-x64",
    };
    Some(
        dir.join("runtimes")
            .join(rid)
            .join("native")
            .join("chrome-shell"),
    )
}

fn chromium_executable_names() -> &'static [&'static str] {
    &[
        "chrome-shell",
        "chromium",
        "chromium-browser",
        "google-chrome-stable",
        "google-chrome",
    ]
}

#[cfg(test)]
mod tests {
    use super::config::{BrowserOptions, WaitStrategy, MAX_IO_READ_CHUNK, MIN_IO_READ_CHUNK};
    use super::{chromium_executable_names, detect_chromium_executable, CHROMIUM_ENV};
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chromium");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var(CHROMIUM_ENV).ok();
        env::set_var(CHROMIUM_ENV, exe_path.to_string_lossy().to_string());
        let detected = detect_chromium_executable();
        if let Some(value) = original {
            env::set_var(CHROMIUM_ENV, value);
        } else {
            env::remove_var(CHROMIUM_ENV);
        }
        assert_eq!(detected, Some(exe_path));
    }

    #[test]
    fn executable_names_prefer_bundled_shell() {
        assert_eq!(chromium_executable_names()[0], "chrome-shell");
    }

    #[test]
    fn explicit_binary_path_wins() {
        let opts = BrowserOptions {
            binary_path: Some("/opt/chromium/chrome".into()),
            ..BrowserOptions::default()
        };
        assert_eq!(
            opts.resolve_binary().unwrap(),
            std::path::PathBuf::from("/opt/chromium/chrome")
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let opts = BrowserOptions::default();
        assert_eq!(opts.memory_threshold_mb, 1024);
        assert_eq!(opts.wait_strategy, WaitStrategy::LOAD);
        assert_eq!(opts.wait_timeout_ms, Some(10_000));
        assert_eq!(opts.poll_interval_ms, 50);
        assert_eq!(opts.startup_timeout_ms, 5_000);
        assert!(opts.max_concurrent_renders >= 1);
    }

    #[test]
    fn io_chunk_is_clamped() {
        let small = BrowserOptions {
            io_read_chunk_bytes: 1,
            ..BrowserOptions::default()
        };
        let large = BrowserOptions {
            io_read_chunk_bytes: usize::MAX,
            ..BrowserOptions::default()
        };
        assert_eq!(small.io_read_chunk(), MIN_IO_READ_CHUNK);
        assert_eq!(large.io_read_chunk(), MAX_IO_READ_CHUNK);
    }

    #[test]
    fn wait_strategy_parses_lists() {
        assert_eq!(
            WaitStrategy::parse_list("load, network-idle").unwrap(),
            WaitStrategy::LOAD | WaitStrategy::NETWORK_IDLE
        );
        assert_eq!(
            WaitStrategy::parse_list("js_variable").unwrap(),
            WaitStrategy::JAVASCRIPT_VARIABLE
        );
        assert!(WaitStrategy::parse_list("none").unwrap().is_empty());
        assert!(WaitStrategy::parse_list("sometimes").is_err());
    }

    #[test]
    fn wait_strategy_bits_match_wire_values() {
        assert_eq!(WaitStrategy::LOAD.bits(), 1);
        assert_eq!(WaitStrategy::NETWORK_IDLE.bits(), 2);
        assert_eq!(WaitStrategy::JAVASCRIPT_VARIABLE.bits(), 4);
    }

    #[test]
    fn options_accept_pascal_case_keys() {
        let opts: BrowserOptions = serde_json::from_str(
            r#"{"MaxConcurrentRenders": 3, "WaitTimeoutMs": null, "MemoryThresholdMb": 256}"#,
        )
        .unwrap();
        assert_eq!(opts.max_concurrent_renders, 3);
        assert_eq!(opts.wait_timeout_ms, None);
        assert_eq!(opts.memory_threshold_mb, 256);
        assert_eq!(opts.poll_interval_ms, 50);
    }
}
