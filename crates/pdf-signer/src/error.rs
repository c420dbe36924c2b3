use pdfpipe_core_types::GeometryError;
use thiserror::Error;

/// Everything that can stop a document from being signed.
///
/// No variant is ever returned after output bytes have been handed back, so a failed call leaves
/// the caller's input untouched.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("malformed pdf: {0}")]
    Structure(String),

    #[error("no certificate configured for signature zone '{zone}'")]
    MissingCertificate { zone: String },

    #[error("signature needs {needed} bytes but only {reserved} were reserved")]
    Capacity { needed: usize, reserved: usize },

    #[error("signature zone '{zone}' cannot be placed: {source}")]
    Placement {
        zone: String,
        #[source]
        source: GeometryError,
    },

    #[error("cryptographic failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("invalid signing identity: {0}")]
    Identity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SignError {
    pub(crate) fn structure(message: impl Into<String>) -> Self {
        Self::Structure(message.into())
    }
}
