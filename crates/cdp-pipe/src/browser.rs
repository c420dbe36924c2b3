use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::BrowserOptions;
use crate::dispatcher::Dispatcher;
use crate::error::CdpError;
use crate::page::Page;
use crate::pipe::BrowserPipe;

/// `Browser.getVersion` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserVersion {
    pub protocol_version: String,
    pub product: String,
    pub revision: String,
    pub user_agent: String,
    pub js_version: String,
}

struct Session {
    dispatcher: Dispatcher,
    child: Option<Child>,
    version: Option<BrowserVersion>,
}

/// A Chromium instance driven over the debugging pipe.
///
/// Share it behind an `Arc`; pages borrow its dispatcher and render semaphore.
pub struct Browser {
    options: Arc<BrowserOptions>,
    renders: Arc<Semaphore>,
    start_lock: Mutex<()>,
    session: RwLock<Option<Session>>,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("started", &self.is_started())
            .field("available_permits", &self.renders.available_permits())
            .finish()
    }
}

impl Browser {
    pub fn new(options: BrowserOptions) -> Self {
        let renders = Arc::new(Semaphore::new(options.render_permits()));
        Self {
            options: Arc::new(options),
            renders,
            start_lock: Mutex::new(()),
            session: RwLock::new(None),
        }
    }

    /// Attaches to a transport the caller already owns. `start` then only runs the readiness
    /// handshake.
    pub fn with_dispatcher(options: BrowserOptions, dispatcher: Dispatcher) -> Self {
        let browser = Self::new(options);
        *browser.session.write() = Some(Session {
            dispatcher,
            child: None,
            version: None,
        });
        browser
    }

    pub fn options(&self) -> &BrowserOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|session| session.version.is_some())
    }

    /// Spawns Chromium and waits until it answers `Browser.getVersion`. Repeated calls are no-ops.
    pub async fn start(&self) -> Result<(), CdpError> {
        let _guard = self.start_lock.lock().await;
        if self.is_started() {
            return Ok(());
        }

        let existing = self
            .session
            .read()
            .as_ref()
            .map(|session| session.dispatcher.clone());
        let dispatcher = match existing {
            Some(dispatcher) => dispatcher,
            None => {
                let binary = self.options.resolve_binary()?;
                let (child, reader, writer) =
                    BrowserPipe::spawn(&binary, &self.options.extra_args)?.into_parts();
                let dispatcher = Dispatcher::new(reader, writer);
                *self.session.write() = Some(Session {
                    dispatcher: dispatcher.clone(),
                    child: Some(child),
                    version: None,
                });
                dispatcher
            }
        };

        match wait_until_ready(
            &dispatcher,
            self.options.startup_timeout(),
            self.options.poll_interval(),
        )
        .await
        {
            Ok(version) => {
                info!(
                    target: "cdp-pipe",
                    product = %version.product,
                    protocol = %version.protocol_version,
                    permits = self.options.render_permits(),
                    "chromium ready"
                );
                if let Some(session) = self.session.write().as_mut() {
                    session.version = Some(version);
                }
                Ok(())
            }
            Err(err) => {
                self.teardown("startup failed");
                Err(err)
            }
        }
    }

    pub fn dispatcher(&self) -> Result<Dispatcher, CdpError> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.version.is_some())
            .map(|session| session.dispatcher.clone())
            .ok_or(CdpError::NotStarted)
    }

    pub fn version(&self) -> Option<BrowserVersion> {
        self.session
            .read()
            .as_ref()
            .and_then(|session| session.version.clone())
    }

    pub fn render_semaphore(&self) -> Arc<Semaphore> {
        self.renders.clone()
    }

    /// Opens a blank target and attaches a flattened session to it.
    pub async fn create_page(&self) -> Result<Page, CdpError> {
        let dispatcher = self.dispatcher()?;
        let created = dispatcher
            .send("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = string_field(&created, "targetId", "Target.createTarget")?;

        let attached = dispatcher
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = string_field(&attached, "sessionId", "Target.attachToTarget")?;
        debug!(target: "cdp-pipe", %target_id, %session_id, "page attached");

        Ok(Page::new(
            dispatcher,
            session_id,
            target_id,
            self.options.clone(),
            self.renders.clone(),
        ))
    }

    /// Kills the child and fails outstanding commands. Errors are ignored.
    pub async fn dispose(&self) {
        let _guard = self.start_lock.lock().await;
        let session = self.session.write().take();
        if let Some(session) = session {
            session.dispatcher.close("browser disposed");
            if let Some(mut child) = session.child {
                if let Err(err) = child.start_kill() {
                    debug!(target: "cdp-pipe", ?err, "chromium already exited");
                }
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            }
            info!(target: "cdp-pipe", "browser disposed");
        }
    }

    fn teardown(&self, reason: &str) {
        if let Some(session) = self.session.write().take() {
            session.dispatcher.close(reason);
            if let Some(mut child) = session.child {
                let _ = child.start_kill();
            }
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.teardown("browser dropped");
    }
}

fn string_field(value: &Value, field: &str, method: &str) -> Result<String, CdpError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CdpError::decode(method, format!("missing {field}")))
}

/// Polls `Browser.getVersion` until it succeeds or `timeout` elapses.
async fn wait_until_ready(
    dispatcher: &Dispatcher,
    timeout: Duration,
    backoff: Duration,
) -> Result<BrowserVersion, CdpError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(target: "cdp-pipe", ?timeout, "chromium never answered Browser.getVersion");
            return Err(CdpError::Startup(timeout));
        }

        match tokio::time::timeout(
            remaining,
            dispatcher.send("Browser.getVersion", json!({}), None),
        )
        .await
        {
            Ok(Ok(value)) => {
                return serde_json::from_value(value)
                    .map_err(|err| CdpError::decode("Browser.getVersion", err.to_string()));
            }
            Ok(Err(err)) if err.is_transport() => {
                warn!(target: "cdp-pipe", %err, "chromium transport failed during startup");
                return Err(CdpError::Startup(timeout));
            }
            Ok(Err(err)) => {
                debug!(target: "cdp-pipe", %err, "liveness probe failed; retrying");
            }
            Err(_) => continue,
        }
        tokio::time::sleep(backoff).await;
    }
}
