//! pdfpipe
//!
//! Renders HTML to PDF through a headless Chromium driven over its debugging pipe, and signs
//! the printed document in place wherever the page marked a signature area.

pub mod config;
pub mod errors;
pub mod service;

pub use config::{AppConfig, IdentitySource, LoadedConfig, SigningConfig};
pub use errors::{PdfPipeError, Result};
pub use service::{PdfService, SignedRender};

pub use cdp_pipe::{BrowserOptions, WaitStrategy};
pub use pdf_signer::{PdfSigner, SignatureZone, SigningIdentity};
