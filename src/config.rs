//! Application configuration.
//!
//! One YAML file holds the browser tuning and the signing identities. Lookup order is the
//! explicit `--config` path, `./config/pdfpipe.yaml`, then `<config dir>/pdfpipe/config.yaml`;
//! a missing file means defaults. Environment overrides are applied last.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use cdp_pipe::{BrowserOptions, CHROMIUM_ENV};
use pdf_signer::{ContentsReservation, PdfSigner, SignerOptions, SigningIdentity};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::{PdfPipeError, Result};

pub const LOCAL_CONFIG_PATH: &str = "config/pdfpipe.yaml";

pub const MAX_CONCURRENT_RENDERS_ENV: &str = "PDFPIPE_MAX_CONCURRENT_RENDERS";
pub const MEMORY_THRESHOLD_ENV: &str = "PDFPIPE_MEMORY_THRESHOLD_MB";
pub const WAIT_TIMEOUT_ENV: &str = "PDFPIPE_WAIT_TIMEOUT_MS";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub browser: BrowserOptions,
    pub signing: SigningConfig,
}

/// Where signing identities come from and how signatures are laid out.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Used for every zone without an entry in `zone_identities`.
    pub default_identity: Option<IdentitySource>,
    pub zone_identities: BTreeMap<String, IdentitySource>,
    /// Bytes reserved for each CMS blob; sized from the certificate chain when unset.
    pub contents_reservation: Option<usize>,
    pub reason: Option<String>,
    pub location: Option<String>,
}

/// A PKCS#12 bundle on disk and the environment variable holding its password.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySource {
    pub p12: PathBuf,
    /// Unset means the bundle has an empty password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl IdentitySource {
    pub fn new(p12: impl Into<PathBuf>, password_env: Option<String>) -> Self {
        Self {
            p12: p12.into(),
            password_env,
        }
    }

    fn password(&self) -> Result<String> {
        match &self.password_env {
            Some(var) => env::var(var).map_err(|_| {
                PdfPipeError::config(format!(
                    "password variable {var} for {} is not set",
                    self.p12.display()
                ))
            }),
            None => Ok(String::new()),
        }
    }

    pub fn load(&self) -> Result<SigningIdentity> {
        let password = self.password()?;
        let identity = SigningIdentity::from_pkcs12_file(&self.p12, &password)?;
        debug!(
            target: "pdfpipe",
            path = %self.p12.display(),
            subject = ?identity.subject_name(),
            "identity loaded"
        );
        Ok(identity)
    }
}

impl SigningConfig {
    pub fn signer_options(&self) -> SignerOptions {
        SignerOptions {
            contents_reservation: self
                .contents_reservation
                .map_or(ContentsReservation::Auto, ContentsReservation::Fixed),
            reason: self.reason.clone(),
            location: self.location.clone(),
            ..SignerOptions::default()
        }
    }

    /// Loads every configured identity into a ready signer.
    pub fn build_signer(&self) -> Result<PdfSigner> {
        let mut signer = PdfSigner::new(self.signer_options());
        if let Some(source) = &self.default_identity {
            signer.add_identity(source.load()?, None);
        }
        for (zone, source) in &self.zone_identities {
            signer.add_identity(source.load()?, Some(zone));
        }
        Ok(signer)
    }
}

/// Configuration plus the path it was (or would have been) read from.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    pub from_file: bool,
}

/// The path `load` reads when no explicit path is given.
pub fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_PATH);
    if local.exists() {
        return Some(local);
    }
    let mut path = dirs::config_dir()?;
    path.push("pdfpipe");
    path.push("config.yaml");
    Some(path)
}

impl AppConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reads the config file (if any) and applies environment overrides.
    pub async fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_config_path()
                .ok_or_else(|| PdfPipeError::config("cannot determine config directory"))?,
        };

        let (mut config, from_file) = if fs::try_exists(&path).await? {
            let raw = fs::read_to_string(&path).await?;
            let config = Self::from_yaml(&raw).map_err(|err| {
                PdfPipeError::config(format!("{}: {err}", path.display()))
            })?;
            info!(target: "pdfpipe", path = %path.display(), "loaded configuration");
            (config, true)
        } else if explicit.is_some() {
            return Err(PdfPipeError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        } else {
            debug!(target: "pdfpipe", path = %path.display(), "no config file; using defaults");
            (Self::default(), false)
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(LoadedConfig {
            config,
            path,
            from_file,
        })
    }

    /// Applies `PDFPIPE_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(raw) = lookup(MAX_CONCURRENT_RENDERS_ENV) {
            self.browser.max_concurrent_renders = parse_number(MAX_CONCURRENT_RENDERS_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MEMORY_THRESHOLD_ENV) {
            self.browser.memory_threshold_mb = parse_number(MEMORY_THRESHOLD_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CHROMIUM_ENV) {
            self.browser.binary_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup(WAIT_TIMEOUT_ENV) {
            self.browser.wait_timeout_ms = parse_timeout(&raw)
                .map_err(|reason| PdfPipeError::config(format!("{WAIT_TIMEOUT_ENV}: {reason}")))?;
        }

        if self.browser.max_concurrent_renders == 0 {
            warn!(target: "pdfpipe", "max_concurrent_renders is 0; one render at a time");
        }
        Ok(())
    }
}

/// `none` (or `unbounded`) disables the deadline.
pub fn parse_timeout(raw: &str) -> std::result::Result<Option<u64>, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" | "unbounded" | "null" => Ok(None),
        value => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| format!("expected milliseconds or 'none', got '{raw}'")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| PdfPipeError::config(format!("{key}: '{raw}' is not a number")))
}
