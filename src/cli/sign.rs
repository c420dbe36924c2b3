use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::Args;
use pdf_signer::SignatureReport;
use pdfpipe::{IdentitySource, PdfService, SignatureZone, SigningConfig};
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use super::browser_args::BrowserArgs;
use super::context::CliContext;
use super::output::{print_json, OutputFormat};
use super::render::discard_partial;
use super::runtime::ctrl_c_token;

#[derive(Args, Clone, Debug)]
pub struct SignArgs {
    /// HTML page to render and sign, or an existing PDF
    pub input: PathBuf,

    /// Where to write the signed PDF
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// PKCS#12 bundle used for every zone without its own identity
    #[arg(long, value_name = "FILE")]
    pub p12: Option<PathBuf>,

    /// Environment variable holding the PKCS#12 password(s)
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,

    /// Identity for a single zone, as ZONE_ID=FILE.p12 (repeatable)
    #[arg(long = "zone", value_name = "ID=FILE")]
    pub zone_identities: Vec<ZoneIdentity>,

    /// JSON array of zones ({id, x, y, width, height} in CSS pixels); required for PDF input
    #[arg(long, value_name = "FILE")]
    pub zones: Option<PathBuf>,

    /// Bytes reserved for each signature; sized from the certificate chain when omitted
    #[arg(long, value_name = "BYTES")]
    pub reservation: Option<usize>,

    /// Written to each signature's /Reason
    #[arg(long)]
    pub reason: Option<String>,

    /// Written to each signature's /Location
    #[arg(long)]
    pub location: Option<String>,

    #[command(flatten)]
    pub browser: BrowserArgs,
}

/// `signature-area-ceo=ceo.p12`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneIdentity {
    pub zone: String,
    pub p12: PathBuf,
}

impl FromStr for ZoneIdentity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (zone, path) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected ZONE_ID=FILE, got '{raw}'"))?;
        let zone = zone.trim();
        let path = path.trim();
        if zone.is_empty() || path.is_empty() {
            return Err(format!("expected ZONE_ID=FILE, got '{raw}'"));
        }
        Ok(Self {
            zone: zone.to_string(),
            p12: PathBuf::from(path),
        })
    }
}

#[derive(Serialize)]
struct SignSummary<'a> {
    output: &'a Path,
    bytes: usize,
    signatures: Vec<ReportView<'a>>,
}

#[derive(Serialize)]
struct ReportView<'a> {
    zone: &'a str,
    page: u32,
    object: String,
    byte_range: [usize; 4],
    sha256: &'a str,
    signature_bytes: usize,
    reserved_bytes: usize,
}

impl<'a> From<&'a SignatureReport> for ReportView<'a> {
    fn from(report: &'a SignatureReport) -> Self {
        Self {
            zone: &report.zone_id,
            page: report.page_number,
            object: report.signature_object.to_string(),
            byte_range: report.byte_range,
            sha256: &report.digest_hex,
            signature_bytes: report.signature_len,
            reserved_bytes: report.reserved,
        }
    }
}

impl SignArgs {
    /// Command-line identities layered over the configured ones.
    fn signing_config(&self, base: &SigningConfig) -> SigningConfig {
        let mut signing = base.clone();
        if let Some(p12) = &self.p12 {
            signing.default_identity = Some(IdentitySource::new(p12, self.password_env.clone()));
        }
        for entry in &self.zone_identities {
            signing.zone_identities.insert(
                entry.zone.clone(),
                IdentitySource::new(&entry.p12, self.password_env.clone()),
            );
        }
        if self.reservation.is_some() {
            signing.contents_reservation = self.reservation;
        }
        if self.reason.is_some() {
            signing.reason = self.reason.clone();
        }
        if self.location.is_some() {
            signing.location = self.location.clone();
        }
        signing
    }
}

pub async fn cmd_sign(args: SignArgs, ctx: &CliContext) -> Result<()> {
    let input = fs::read(&args.input)
        .await
        .with_context(|| format!("reading {}", args.input.display()))?;

    let signing = args.signing_config(&ctx.config().signing);
    let signer = signing.build_signer().context("loading signing identities")?;
    if !signer.has_identities() {
        bail!("no signing identity; pass --p12 or configure signing.default_identity");
    }

    let (bytes, reports) = if is_pdf(&input) {
        let Some(zones_path) = &args.zones else {
            bail!("signing an existing PDF needs --zones <FILE>");
        };
        let zones = read_zones(zones_path).await?;
        let signed = signer
            .sign_with_report(&input, &zones)
            .with_context(|| format!("signing {}", args.input.display()))?;
        fs::write(&args.output, &signed.bytes)
            .await
            .with_context(|| format!("writing {}", args.output.display()))?;
        (signed.bytes.len(), signed.reports)
    } else {
        if args.zones.is_some() {
            warn!("--zones is ignored for HTML input; zones come from the rendered page");
        }
        let html = String::from_utf8(input)
            .with_context(|| format!("{} is neither a PDF nor UTF-8 HTML", args.input.display()))?;
        let options = args.browser.browser_options(&ctx.config().browser)?;
        let service = PdfService::start(options)
            .await
            .context("starting chromium")?;
        let cancel = ctrl_c_token();

        let file = fs::File::create(&args.output)
            .await
            .with_context(|| format!("creating {}", args.output.display()))?;
        let mut sink = BufWriter::new(file);
        let result = service
            .render_signed_pdf(&html, &mut sink, &signer, &cancel)
            .await;
        service.shutdown().await;
        match result {
            Ok(rendered) => {
                sink.shutdown().await?;
                (rendered.bytes_written as usize, rendered.reports)
            }
            Err(err) => {
                discard_partial(&args.output).await;
                return Err(err).with_context(|| format!("signing {}", args.input.display()));
            }
        }
    };

    if reports.is_empty() {
        warn!("no signature areas found; the document was written unsigned");
    }
    info!(output = %args.output.display(), signatures = reports.len(), "signed PDF written");

    let summary = SignSummary {
        output: &args.output,
        bytes,
        signatures: reports.iter().map(ReportView::from).collect(),
    };
    match ctx.format() {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Human => {
            println!(
                "Wrote {} bytes to {} ({} signature(s))",
                summary.bytes,
                summary.output.display(),
                summary.signatures.len()
            );
            for report in &summary.signatures {
                println!(
                    "- {} on page {}: object {}, byte range {:?}, sha256 {}",
                    report.zone, report.page, report.object, report.byte_range, report.sha256
                );
            }
        }
    }
    Ok(())
}

fn is_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|window| window == b"%PDF-")
}

async fn read_zones(path: &Path) -> Result<Vec<SignatureZone>> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing zones from {}", path.display()))
}
