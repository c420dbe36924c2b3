use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use cdp_pipe::browser::BrowserVersion;
use cdp_pipe::util::MemoryProbe;
use cdp_pipe::Browser;
use clap::Args;
use humantime::format_rfc3339;
use serde::Serialize;
use tracing::debug;

use super::context::CliContext;
use super::output::{print_json, OutputFormat};

#[derive(Args, Clone, Debug, Default)]
pub struct InfoArgs {
    /// Do not launch Chromium to read its version
    #[arg(long)]
    pub no_probe: bool,
}

#[derive(Serialize)]
struct SystemInfo {
    version: &'static str,
    build_date: &'static str,
    git_commit: &'static str,
    checked_at: String,
    config_path: PathBuf,
    config_loaded: bool,
    chromium_binary: Option<PathBuf>,
    chromium_error: Option<String>,
    chromium: Option<BrowserVersion>,
    cpu_count: usize,
    max_concurrent_renders: usize,
    memory_available_bytes: Option<u64>,
    memory_threshold_bytes: u64,
    under_memory_pressure: bool,
}

pub async fn cmd_info(args: InfoArgs, ctx: &CliContext) -> Result<()> {
    let options = &ctx.config().browser;
    let (chromium_binary, mut chromium_error) = match options.resolve_binary() {
        Ok(path) => (Some(path), None),
        Err(err) => (None, Some(err.to_string())),
    };

    let chromium = match (&chromium_binary, args.no_probe) {
        (Some(_), false) => match probe_version(options.clone()).await {
            Ok(version) => Some(version),
            Err(err) => {
                chromium_error = Some(err);
                None
            }
        },
        _ => None,
    };

    let memory = MemoryProbe::new(options.memory_threshold_mb);
    let info = SystemInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_date: option_env!("BUILD_DATE").unwrap_or("unknown"),
        git_commit: option_env!("GIT_HASH").unwrap_or("unknown"),
        checked_at: format_rfc3339(SystemTime::now()).to_string(),
        config_path: ctx.config_path().to_path_buf(),
        config_loaded: ctx.config_from_file(),
        chromium_binary,
        chromium_error,
        chromium,
        cpu_count: num_cpus::get(),
        max_concurrent_renders: options.render_permits(),
        memory_available_bytes: memory.available_bytes(),
        memory_threshold_bytes: memory.threshold_bytes(),
        under_memory_pressure: memory.under_pressure(),
    };

    match ctx.format() {
        OutputFormat::Json => print_json(&info)?,
        OutputFormat::Human => print_human(&info),
    }
    Ok(())
}

async fn probe_version(mut options: cdp_pipe::BrowserOptions) -> Result<BrowserVersion, String> {
    options.startup_timeout_ms = options.startup_timeout_ms.max(1_000);
    let browser = Browser::new(options);
    let started = tokio::time::timeout(Duration::from_secs(30), browser.start()).await;
    let version = match started {
        Ok(Ok(())) => browser
            .version()
            .ok_or_else(|| "chromium did not report a version".to_string()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("chromium probe timed out".to_string()),
    };
    browser.dispose().await;
    debug!(?version, "chromium probe finished");
    version
}

fn print_human(info: &SystemInfo) {
    println!("pdfpipe System Information");
    println!("==========================");
    println!("Version: {}", info.version);
    println!("Build Date: {}", info.build_date);
    println!("Git Commit: {}", info.git_commit);
    println!("Checked At: {}", info.checked_at);
    println!();

    println!("Configuration:");
    println!(
        "- Path: {} ({})",
        info.config_path.display(),
        if info.config_loaded { "loaded" } else { "not found, defaults" }
    );
    println!("- Max Concurrent Renders: {}", info.max_concurrent_renders);
    println!();

    println!("Chromium:");
    match &info.chromium_binary {
        Some(path) => println!("- Binary: {}", path.display()),
        None => println!("- Binary: not found"),
    }
    if let Some(version) = &info.chromium {
        println!("- Product: {}", version.product);
        println!("- Protocol: {}", version.protocol_version);
        println!("- V8: {}", version.js_version);
    }
    if let Some(err) = &info.chromium_error {
        println!("- Error: {}", err);
    }
    println!();

    println!("Host:");
    println!("- CPUs: {}", info.cpu_count);
    match info.memory_available_bytes {
        Some(bytes) => println!("- Memory Available: {} MiB", bytes / (1024 * 1024)),
        None => println!("- Memory Available: unknown"),
    }
    println!(
        "- Memory Threshold: {} MiB{}",
        info.memory_threshold_bytes / (1024 * 1024),
        if info.under_memory_pressure {
            " (under pressure)"
        } else {
            ""
        }
    );
}
