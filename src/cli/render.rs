use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use pdfpipe::PdfService;
use serde::Serialize;
use tokio::fs;
use tokio::io::BufWriter;
use tracing::{debug, info};

use super::browser_args::BrowserArgs;
use super::context::CliContext;
use super::output::{print_json, OutputFormat};
use super::runtime::ctrl_c_token;

#[derive(Args, Clone, Debug)]
pub struct RenderArgs {
    /// HTML file to render
    pub input: PathBuf,

    /// Where to write the PDF
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    #[command(flatten)]
    pub browser: BrowserArgs,
}

#[derive(Serialize)]
struct RenderSummary<'a> {
    output: &'a Path,
    bytes: u64,
    zones: Vec<&'a str>,
}

pub async fn cmd_render(args: RenderArgs, ctx: &CliContext) -> Result<()> {
    let html = fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("reading {}", args.input.display()))?;
    let options = args.browser.browser_options(&ctx.config().browser)?;

    let service = PdfService::start(options)
        .await
        .context("starting chromium")?;
    let cancel = ctrl_c_token();

    let file = fs::File::create(&args.output)
        .await
        .with_context(|| format!("creating {}", args.output.display()))?;
    let mut sink = BufWriter::new(file);
    let result = service.render_pdf(&html, &mut sink, &cancel).await;
    service.shutdown().await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            discard_partial(&args.output).await;
            return Err(err).with_context(|| format!("rendering {}", args.input.display()));
        }
    };
    info!(output = %args.output.display(), bytes = outcome.bytes_written, "PDF written");

    let summary = RenderSummary {
        output: &args.output,
        bytes: outcome.bytes_written,
        zones: outcome.zones.iter().map(|zone| zone.id.as_str()).collect(),
    };
    match ctx.format() {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Human => println!(
            "Wrote {} bytes to {}",
            summary.bytes,
            summary.output.display()
        ),
    }
    Ok(())
}

/// Removes a half-written output so a failed run never leaves a truncated PDF behind.
pub(crate) async fn discard_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        debug!(path = %path.display(), ?err, "no partial output to remove");
    }
}
