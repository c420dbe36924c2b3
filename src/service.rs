//! Render and render-then-sign on top of a shared [`Browser`].

use std::sync::Arc;
use std::time::Instant;

use cdp_pipe::{Browser, BrowserOptions, CdpError, Page, PrintOptions, PrintOutcome};
use pdf_signer::{PdfSigner, SignatureReport, SignatureZone};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::errors::Result;

/// What [`PdfService::render_signed_pdf`] produced.
#[derive(Clone, Debug, Default)]
pub struct SignedRender {
    pub bytes_written: u64,
    pub zones: Vec<SignatureZone>,
    pub reports: Vec<SignatureReport>,
}

/// HTML to PDF front door. Cheap to clone; clones share one Chromium.
#[derive(Clone, Debug)]
pub struct PdfService {
    browser: Arc<Browser>,
}

impl PdfService {
    /// Launches Chromium and waits for it to answer.
    pub async fn start(options: BrowserOptions) -> Result<Self> {
        Self::attach(Arc::new(Browser::new(options))).await
    }

    /// Wraps an existing browser and runs its readiness handshake.
    pub async fn attach(browser: Arc<Browser>) -> Result<Self> {
        browser.start().await?;
        Ok(Self { browser })
    }

    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// Renders `html` straight into `sink`.
    #[instrument(target = "pdfpipe", skip_all, fields(html = html.len()))]
    pub async fn render_pdf<W>(
        &self,
        html: &str,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<PrintOutcome>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let started = Instant::now();
        let page = self.browser.create_page().await?;
        let result = page
            .render(html, sink, PrintOptions::default(), cancel)
            .await;
        let outcome = finish_page(&page, result).await?;
        sink.flush().await?;
        info!(
            target: "pdfpipe",
            bytes = outcome.bytes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered"
        );
        Ok(outcome)
    }

    /// Renders into memory with signature-zone discovery, signs every zone and writes the
    /// signed document to `sink`. A page without zones is written unchanged.
    #[instrument(target = "pdfpipe", skip_all, fields(html = html.len()))]
    pub async fn render_signed_pdf<W>(
        &self,
        html: &str,
        sink: &mut W,
        signer: &PdfSigner,
        cancel: &CancellationToken,
    ) -> Result<SignedRender>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let started = Instant::now();
        let mut printed = Vec::new();
        let page = self.browser.create_page().await?;
        let result = page
            .render(
                html,
                &mut printed,
                PrintOptions::default().with_signature_zones(),
                cancel,
            )
            .await;
        let outcome = finish_page(&page, result).await?;

        if cancel.is_cancelled() {
            return Err(CdpError::Cancelled.into());
        }
        let signed = signer.sign_with_report(&printed, &outcome.zones)?;
        sink.write_all(&signed.bytes).await?;
        sink.flush().await?;

        info!(
            target: "pdfpipe",
            bytes = signed.bytes.len(),
            zones = outcome.zones.len(),
            signatures = signed.reports.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendered and signed"
        );
        Ok(SignedRender {
            bytes_written: signed.bytes.len() as u64,
            zones: outcome.zones,
            reports: signed.reports,
        })
    }

    /// Stops Chromium. Outstanding renders fail with a transport error.
    pub async fn shutdown(&self) {
        self.browser.dispose().await;
    }
}

/// Closes `page` whatever the outcome of its render.
async fn finish_page(
    page: &Page,
    result: std::result::Result<PrintOutcome, CdpError>,
) -> Result<PrintOutcome> {
    page.close().await;
    if let Err(err) = &result {
        warn!(target: "pdfpipe", session = %page.session_id(), %err, "render failed");
    }
    Ok(result?)
}
