use std::fs;
use std::path::Path;

use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use tracing::debug;

use crate::error::SignError;

/// DER bytes added on top of certificates and key size when sizing `/Contents`.
const CMS_OVERHEAD: usize = 1024;

/// A signing certificate, its private key and any intermediates to embed.
#[derive(Clone)]
pub struct SigningIdentity {
    certificate: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("subject", &self.subject_name())
            .field("chain", &self.chain.len())
            .finish()
    }
}

impl SigningIdentity {
    pub fn new(certificate: X509, key: PKey<Private>, chain: Vec<X509>) -> Self {
        Self {
            certificate,
            key,
            chain,
        }
    }

    /// Loads a PKCS#12 (`.p12` / `.pfx`) bundle.
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, SignError> {
        // Bundles exported by older tooling use RC2/3DES, which OpenSSL 3 keeps in the legacy
        // provider. Loading fails harmlessly when the provider is not built in.
        let _legacy = openssl::provider::Provider::try_load(None, "legacy", true).ok();

        let parsed = Pkcs12::from_der(der)?
            .parse2(password)
            .map_err(|err| SignError::Identity(format!("cannot decrypt PKCS#12 bundle: {err}")))?;
        let certificate = parsed
            .cert
            .ok_or_else(|| SignError::Identity("PKCS#12 bundle has no certificate".into()))?;
        let key = parsed
            .pkey
            .ok_or_else(|| SignError::Identity("PKCS#12 bundle has no private key".into()))?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let identity = Self::new(certificate, key, chain);
        debug!(target: "pdf-signer", identity = ?identity, "loaded PKCS#12 identity");
        Ok(identity)
    }

    pub fn from_pkcs12_file(path: impl AsRef<Path>, password: &str) -> Result<Self, SignError> {
        Self::from_pkcs12(&fs::read(path)?, password)
    }

    /// `cert_pem` may hold the signing certificate followed by its intermediates.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, SignError> {
        let mut certificates = X509::stack_from_pem(cert_pem)?.into_iter();
        let certificate = certificates
            .next()
            .ok_or_else(|| SignError::Identity("PEM input has no certificate".into()))?;
        let key = PKey::private_key_from_pem(key_pem)?;
        Ok(Self::new(certificate, key, certificates.collect()))
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Common name of the certificate subject.
    pub fn subject_name(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|name| name.to_string())
    }

    /// Upper bound for the DER size of a detached signature made with this identity.
    pub fn estimated_signature_len(&self) -> usize {
        let certificates: usize = std::iter::once(&self.certificate)
            .chain(&self.chain)
            .map(|cert| cert.to_der().map(|der| der.len()).unwrap_or(4096))
            .sum();
        certificates + self.key.size() + CMS_OVERHEAD
    }

    /// Detached PKCS#7 `SignedData` over `content`, DER encoded.
    pub fn sign_detached(&self, content: &[u8]) -> Result<Vec<u8>, SignError> {
        let mut extra = Stack::new()?;
        for cert in &self.chain {
            extra.push(cert.clone())?;
        }
        let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOSMIMECAP;
        let pkcs7 = Pkcs7::sign(&self.certificate, &self.key, &extra, content, flags)?;
        Ok(pkcs7.to_der()?)
    }
}
