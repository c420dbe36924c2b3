//! Incremental-update PDF signing.
//!
//! [`PdfSigner`] appends an `/AcroForm`, one signature field per [`SignatureZone`] and the
//! updated catalog and pages to an existing document without rewriting any of its bytes, then
//! embeds a detached PKCS#7 signature over everything but the signature's own `/Contents`.

pub mod error;
pub mod identity;
pub mod lexer;
pub mod object;
pub mod signer;
pub mod source;
pub mod writer;

pub use error::SignError;
pub use identity::SigningIdentity;
pub use object::{
    IndirectObject, ObjectId, PdfArray, PdfDictionary, PdfName, PdfNumber, PdfObject, PdfStream,
    PdfString, SignatureDictionary,
};
pub use pdfpipe_core_types::{PdfPlacement, SignatureZone};
pub use signer::{
    sign, ContentsReservation, PdfSigner, SignatureReport, SignedDocument, SignerOptions,
    MIN_CONTENTS_RESERVATION,
};
pub use source::SourceDocument;
pub use writer::ObjectSerializer;
