//! Error type shared by the service layer and the CLI.
//!
//! Each variant names the phase that failed so callers can tell a broken browser from a broken
//! certificate without matching on messages.

use cdp_pipe::CdpError;
use pdf_signer::SignError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfPipeError {
    /// Launching Chromium, loading content or printing.
    #[error("render failed: {0}")]
    Render(#[from] CdpError),

    /// Parsing the printed document, loading identities or signing.
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PdfPipeError> = std::result::Result<T, E>;

impl PdfPipeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Short phase label for structured logs.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Render(_) => "render",
            Self::Sign(_) => "sign",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// True when the render failed because it was cancelled rather than broken.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Render(CdpError::Cancelled))
    }
}

impl From<serde_yaml::Error> for PdfPipeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
