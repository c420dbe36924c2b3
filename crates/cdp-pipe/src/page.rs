use std::sync::Arc;

use parking_lot::Mutex;
use pdfpipe_core_types::SignatureZone;
use serde_json::{json, Value};
use tokio::io::AsyncWrite;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{BrowserOptions, WaitStrategy};
use crate::dispatcher::Dispatcher;
use crate::error::CdpError;
use crate::metrics;
use crate::stream::{write_inline, PdfStreamReader, PrintedDocument, StreamGuard};
use crate::util::MemoryProbe;
use crate::wait::{WaitConditions, WaitOutcome};
use crate::zones::find_signature_zones;

/// Lifecycle of a page session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    Unloaded,
    ContentSet,
    Ready,
    Printing,
    Closed,
}

/// Knobs for one `Page.printToPDF` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrintOptions {
    pub detect_signature_zones: bool,
    pub print_background: bool,
    pub prefer_css_page_size: bool,
    pub landscape: bool,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            detect_signature_zones: false,
            print_background: true,
            prefer_css_page_size: true,
            landscape: false,
        }
    }
}

impl PrintOptions {
    pub fn with_signature_zones(mut self) -> Self {
        self.detect_signature_zones = true;
        self
    }

    fn params(&self) -> Value {
        json!({
            "printBackground": self.print_background,
            "preferCSSPageSize": self.prefer_css_page_size,
            "landscape": self.landscape,
            "transferMode": "ReturnAsStream",
        })
    }
}

/// Result of a print.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrintOutcome {
    pub bytes_written: u64,
    pub zones: Vec<SignatureZone>,
}

#[derive(Debug)]
struct PageFlags {
    state: PageState,
    page_enabled: bool,
    network_enabled: bool,
    frame_id: Option<String>,
}

/// One attached tab. Created by [`crate::Browser::create_page`].
#[derive(Debug)]
pub struct Page {
    dispatcher: Dispatcher,
    session_id: String,
    target_id: String,
    options: Arc<BrowserOptions>,
    renders: Arc<Semaphore>,
    flags: Mutex<PageFlags>,
}

impl Page {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        session_id: String,
        target_id: String,
        options: Arc<BrowserOptions>,
        renders: Arc<Semaphore>,
    ) -> Self {
        Self {
            dispatcher,
            session_id,
            target_id,
            options,
            renders,
            flags: Mutex::new(PageFlags {
                state: PageState::Unloaded,
                page_enabled: false,
                network_enabled: false,
                frame_id: None,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn state(&self) -> PageState {
        self.flags.lock().state
    }

    fn set_state(&self, state: PageState) {
        self.flags.lock().state = state;
    }

    fn ensure_open(&self) -> Result<(), CdpError> {
        if self.state() == PageState::Closed {
            return Err(CdpError::PageClosed);
        }
        Ok(())
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        self.dispatcher
            .send(method, params, Some(&self.session_id))
            .await
    }

    /// Loads `html` into the main frame and waits for the configured readiness conditions.
    ///
    /// A wait timeout is not an error: the page is left in whatever state it reached.
    #[instrument(target = "cdp-pipe", skip(self, html, cancel), fields(session = %self.session_id, bytes = html.len()))]
    pub async fn set_content(
        &self,
        html: &str,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, CdpError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(CdpError::Cancelled);
        }

        if !self.flags.lock().page_enabled {
            self.send("Page.enable", json!({})).await?;
            self.flags.lock().page_enabled = true;
        }

        let frame_id = self.frame_id().await?;

        let wants_network = self
            .options
            .wait_strategy
            .contains(WaitStrategy::NETWORK_IDLE);
        if wants_network && !self.flags.lock().network_enabled {
            self.send("Network.enable", json!({})).await?;
            self.flags.lock().network_enabled = true;
        }

        // Listeners go in before the content so no early request is missed.
        let conditions = WaitConditions::new(&self.dispatcher, &self.session_id, &self.options);
        self.send(
            "Page.setDocumentContent",
            json!({ "frameId": frame_id, "html": html }),
        )
        .await?;
        self.set_state(PageState::ContentSet);

        let outcome = conditions
            .wait(
                self.options.wait_timeout(),
                self.options.poll_interval(),
                cancel,
            )
            .await?;
        self.set_state(PageState::Ready);
        debug!(target: "cdp-pipe", session = %self.session_id, ?outcome, "content ready");
        Ok(outcome)
    }

    async fn frame_id(&self) -> Result<String, CdpError> {
        if let Some(frame_id) = self.flags.lock().frame_id.clone() {
            return Ok(frame_id);
        }
        let tree = self.send("Page.getFrameTree", json!({})).await?;
        let frame_id = tree
            .pointer("/frameTree/frame/id")
            .and_then(Value::as_str)
            .ok_or_else(|| CdpError::decode("Page.getFrameTree", "missing frameTree.frame.id"))?
            .to_string();
        self.flags.lock().frame_id = Some(frame_id.clone());
        Ok(frame_id)
    }

    /// Prints the current document into `sink`.
    ///
    /// Holds one render permit for the whole print. The permit and the stream handle are
    /// released on success, error and cancellation alike.
    #[instrument(target = "cdp-pipe", skip(self, sink, cancel), fields(session = %self.session_id))]
    pub async fn print_to_pdf<W>(
        &self,
        sink: &mut W,
        options: PrintOptions,
        cancel: &CancellationToken,
    ) -> Result<PrintOutcome, CdpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.ensure_open()?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CdpError::Cancelled),
            permit = self.renders.acquire() => permit
                .map_err(|_| CdpError::transport("render semaphore closed"))?,
        };
        let _active = ActiveRender::start();
        let previous = self.state();
        self.set_state(PageState::Printing);

        let result = self.print_with_permit(sink, options, cancel).await;
        if self.state() == PageState::Printing {
            self.set_state(previous);
        }
        result
    }

    async fn print_with_permit<W>(
        &self,
        sink: &mut W,
        options: PrintOptions,
        cancel: &CancellationToken,
    ) -> Result<PrintOutcome, CdpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let zones = if options.detect_signature_zones {
            find_signature_zones(&self.dispatcher, &self.session_id).await?
        } else {
            Vec::new()
        };

        if cancel.is_cancelled() {
            return Err(CdpError::Cancelled);
        }
        let response = self.send("Page.printToPDF", options.params()).await?;

        let bytes_written = match PrintedDocument::from_response(&response)? {
            PrintedDocument::Inline(data) => write_inline(&data, sink).await?,
            PrintedDocument::Stream(handle) => {
                let guard = StreamGuard::new(self.dispatcher.clone(), &self.session_id, &handle);
                let mut reader = PdfStreamReader::new(
                    &self.dispatcher,
                    &self.session_id,
                    &handle,
                    self.options.io_read_chunk(),
                    MemoryProbe::new(self.options.memory_threshold_mb),
                    self.options.memory_check_interval_chunks,
                );
                let copied = reader.copy_to(sink, cancel).await;
                guard.close().await;
                copied?
            }
        };

        info!(
            target: "cdp-pipe",
            session = %self.session_id,
            bytes = bytes_written,
            zones = zones.len(),
            "pdf printed"
        );
        Ok(PrintOutcome {
            bytes_written,
            zones,
        })
    }

    /// `set_content` followed by `print_to_pdf`.
    pub async fn render<W>(
        &self,
        html: &str,
        sink: &mut W,
        options: PrintOptions,
        cancel: &CancellationToken,
    ) -> Result<PrintOutcome, CdpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.set_content(html, cancel).await?;
        self.print_to_pdf(sink, options, cancel).await
    }

    /// Closes the target. Failures are ignored; the browser may already be gone.
    pub async fn close(&self) {
        {
            let mut flags = self.flags.lock();
            if flags.state == PageState::Closed {
                return;
            }
            flags.state = PageState::Closed;
        }
        if let Err(err) = self
            .dispatcher
            .send(
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
                None,
            )
            .await
        {
            debug!(target: "cdp-pipe", target_id = %self.target_id, ?err, "closeTarget failed");
        }
    }
}

struct ActiveRender;

impl ActiveRender {
    fn start() -> Self {
        metrics::render_started();
        ActiveRender
    }
}

impl Drop for ActiveRender {
    fn drop(&mut self) {
        metrics::render_finished();
    }
}
