use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pdfpipe_core_types::{PdfPlacement, SignatureZone};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::SignError;
use crate::identity::SigningIdentity;
use crate::lexer::DictionaryEntries;
use crate::object::{
    IndirectObject, ObjectId, PdfArray, PdfDictionary, PdfName, PdfObject, PdfString,
    SignatureDictionary, BYTE_RANGE_WIDTH,
};
use crate::source::SourceDocument;
use crate::writer::{write_trailer, write_xref, ObjectSerializer, SignaturePlaceholders, XrefEntry};

/// Smallest `/Contents` reservation, in DER bytes, used when sizing automatically.
pub const MIN_CONTENTS_RESERVATION: usize = 4096;

const RESERVATION_STEP: usize = 1024;

/// How many DER bytes each `/Contents` placeholder can hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentsReservation {
    /// Sized from the signing identity's certificate chain, never below
    /// [`MIN_CONTENTS_RESERVATION`].
    #[default]
    Auto,
    Fixed(usize),
}

#[derive(Clone, Debug, Default)]
pub struct SignerOptions {
    pub contents_reservation: ContentsReservation,
    /// Written into `/M`; the current time when unset.
    pub signing_time: Option<DateTime<Utc>>,
    /// Page height used to map zones onto pages; the first page's `/MediaBox` when unset.
    pub page_height: Option<f64>,
    pub reason: Option<String>,
    pub location: Option<String>,
}

/// What was written for one signature zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureReport {
    pub zone_id: String,
    /// Page the widget was attached to, 1-based.
    pub page_number: u32,
    pub signature_object: ObjectId,
    pub widget_object: ObjectId,
    pub byte_range: [usize; 4],
    /// SHA-256 of the bytes named by `byte_range`, lowercase hex.
    pub digest_hex: String,
    pub signature_len: usize,
    pub reserved: usize,
}

#[derive(Clone, Debug)]
pub struct SignedDocument {
    pub bytes: Vec<u8>,
    pub reports: Vec<SignatureReport>,
}

/// Adds one signature field per zone to a PDF as an incremental update and signs it.
///
/// The first revision appended carries the `/AcroForm`, every widget, the updated catalog and
/// pages, and the first signature. Each further signature is appended in a revision of its own
/// so that every byte range covers a finished file.
#[derive(Clone, Debug, Default)]
pub struct PdfSigner {
    options: SignerOptions,
    default_identity: Option<Arc<SigningIdentity>>,
    zone_identities: HashMap<String, Arc<SigningIdentity>>,
}

struct PlannedField {
    zone_id: String,
    page_number: u32,
    page: ObjectId,
    identity: Arc<SigningIdentity>,
    reserved: usize,
    signature: IndirectObject,
    widget: IndirectObject,
}

struct IdAllocator(u32);

impl IdAllocator {
    fn next(&mut self) -> ObjectId {
        let id = ObjectId::new(self.0);
        self.0 += 1;
        id
    }
}

impl PdfSigner {
    pub fn new(options: SignerOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &SignerOptions {
        &self.options
    }

    /// Registers `identity` for `zone_id`, or as the fallback for every zone when `None`.
    pub fn add_identity(
        &mut self,
        identity: impl Into<Arc<SigningIdentity>>,
        zone_id: Option<&str>,
    ) -> &mut Self {
        let identity = identity.into();
        match zone_id {
            Some(zone) => {
                self.zone_identities.insert(zone.to_string(), identity);
            }
            None => self.default_identity = Some(identity),
        }
        self
    }

    pub fn with_identity(
        mut self,
        identity: impl Into<Arc<SigningIdentity>>,
        zone_id: Option<&str>,
    ) -> Self {
        self.add_identity(identity, zone_id);
        self
    }

    pub fn has_identities(&self) -> bool {
        self.default_identity.is_some() || !self.zone_identities.is_empty()
    }

    pub fn sign(&self, pdf: &[u8], zones: &[SignatureZone]) -> Result<Vec<u8>, SignError> {
        self.sign_with_report(pdf, zones).map(|signed| signed.bytes)
    }

    #[instrument(target = "pdf-signer", skip_all, fields(zones = zones.len(), bytes = pdf.len()))]
    pub fn sign_with_report(
        &self,
        pdf: &[u8],
        zones: &[SignatureZone],
    ) -> Result<SignedDocument, SignError> {
        if zones.is_empty() {
            return Ok(SignedDocument {
                bytes: pdf.to_vec(),
                reports: Vec::new(),
            });
        }
        let identities = zones
            .iter()
            .map(|zone| self.identity_for(&zone.id))
            .collect::<Result<Vec<_>, _>>()?;

        let source = SourceDocument::parse(pdf)?;
        let pages = source.page_refs()?;
        let first_page = *pages
            .first()
            .ok_or_else(|| SignError::structure("document has no pages"))?;
        let page_height = self
            .options
            .page_height
            .unwrap_or_else(|| source.page_height());
        let signing_time = pdf_date(self.options.signing_time.unwrap_or_else(Utc::now));

        let mut ids = IdAllocator(source.next_object_id());
        let acroform_id = ids.next();
        let mut fields = Vec::with_capacity(zones.len());
        for (zone, identity) in zones.iter().zip(identities) {
            let placement = zone
                .to_pdf_placement(page_height)
                .map_err(|source| SignError::Placement {
                    zone: zone.id.clone(),
                    source,
                })?;
            let target = (placement.page_number as usize)
                .checked_sub(1)
                .and_then(|index| pages.get(index));
            let (page_number, page) = match target {
                Some(page) => (placement.page_number, *page),
                None => {
                    warn!(
                        target: "pdf-signer",
                        zone = %zone.id,
                        page = placement.page_number,
                        pages = pages.len(),
                        "zone falls beyond the last page; attaching it to page 1"
                    );
                    (1, first_page)
                }
            };
            fields.push(self.plan_field(
                zone,
                &placement,
                page_number,
                page,
                identity,
                &signing_time,
                &mut ids,
            ));
        }
        let size = ids.0;

        let catalog = source.catalog()?;
        let acroform = IndirectObject::new(
            acroform_id,
            build_acroform(&source, &catalog, fields.iter().map(|f| f.widget.id()))?,
        );
        let root = IndirectObject::new(source.trailer().root, rebuild_catalog(&catalog, &acroform));
        let updated_pages = rebuild_pages(&source, &fields)?;

        let mut out = Vec::with_capacity(pdf.len() + fields.len() * 12 * 1024);
        out.extend_from_slice(pdf);
        let mut prev = source.last_startxref();
        let mut reports = Vec::with_capacity(fields.len());

        for (index, field) in fields.iter().enumerate() {
            let mut revision: Vec<&IndirectObject> = Vec::new();
            if index == 0 {
                revision.push(&acroform);
                revision.push(&field.signature);
                revision.extend(fields.iter().map(|f| &f.widget));
                revision.push(&root);
                revision.extend(updated_pages.iter());
            } else {
                revision.push(&field.signature);
            }

            let (placeholders, xref_offset) =
                append_revision(&mut out, &revision, &source, size, prev)?;
            prev = xref_offset;
            let spans = placeholders.ok_or_else(|| {
                SignError::structure("signature placeholder missing from revision")
            })?;
            let report = seal(&mut out, &spans, field)?;
            debug!(
                target: "pdf-signer",
                zone = %report.zone_id,
                page = report.page_number,
                byte_range = ?report.byte_range,
                signature_len = report.signature_len,
                reserved = report.reserved,
                "signature embedded"
            );
            reports.push(report);
        }

        info!(
            target: "pdf-signer",
            signatures = reports.len(),
            input_bytes = pdf.len(),
            output_bytes = out.len(),
            "document signed"
        );
        Ok(SignedDocument {
            bytes: out,
            reports,
        })
    }

    fn identity_for(&self, zone_id: &str) -> Result<Arc<SigningIdentity>, SignError> {
        self.zone_identities
            .get(zone_id)
            .or(self.default_identity.as_ref())
            .cloned()
            .ok_or_else(|| SignError::MissingCertificate {
                zone: zone_id.to_string(),
            })
    }

    fn reservation(&self, identity: &SigningIdentity) -> usize {
        match self.options.contents_reservation {
            ContentsReservation::Fixed(bytes) => bytes,
            ContentsReservation::Auto => identity
                .estimated_signature_len()
                .div_ceil(RESERVATION_STEP)
                .saturating_mul(RESERVATION_STEP)
                .max(MIN_CONTENTS_RESERVATION),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_field(
        &self,
        zone: &SignatureZone,
        placement: &PdfPlacement,
        page_number: u32,
        page: ObjectId,
        identity: Arc<SigningIdentity>,
        signing_time: &str,
        ids: &mut IdAllocator,
    ) -> PlannedField {
        let reserved = self.reservation(&identity);
        let mut signature = SignatureDictionary::new(signing_time, reserved);
        if let Some(name) = identity.subject_name() {
            signature.insert("Name", PdfString::from(name.as_str()));
        }
        if let Some(reason) = &self.options.reason {
            signature.insert("Reason", PdfString::from(reason.as_str()));
        }
        if let Some(location) = &self.options.location {
            signature.insert("Location", PdfString::from(location.as_str()));
        }
        let signature = IndirectObject::new(ids.next(), signature);

        let widget = PdfDictionary::new()
            .with("Type", PdfName::new("Annot"))
            .with("Subtype", PdfName::new("Widget"))
            .with("FT", PdfName::new("Sig"))
            .with("Rect", placement.rect().into_iter().collect::<PdfArray>())
            .with("P", PdfObject::Reference(page))
            .with("V", signature.reference())
            .with("T", PdfString::from(zone.id.as_str()))
            .with("F", 4);
        let widget = IndirectObject::new(ids.next(), widget);

        PlannedField {
            zone_id: zone.id.clone(),
            page_number,
            page,
            identity,
            reserved,
            signature,
            widget,
        }
    }
}

/// Signs with a per-zone identity map and an optional fallback identity.
pub fn sign(
    pdf: &[u8],
    zones: &[SignatureZone],
    certificates_by_zone: &HashMap<String, SigningIdentity>,
    default_certificate: Option<&SigningIdentity>,
) -> Result<Vec<u8>, SignError> {
    let mut signer = PdfSigner::new(SignerOptions::default());
    for (zone, identity) in certificates_by_zone {
        signer.add_identity(identity.clone(), Some(zone));
    }
    if let Some(identity) = default_certificate {
        signer.add_identity(identity.clone(), None);
    }
    signer.sign(pdf, zones)
}

/// `D:YYYYMMDDHHmmSSZ`
fn pdf_date(time: DateTime<Utc>) -> String {
    format!("D:{}Z", time.format("%Y%m%d%H%M%S"))
}

/// Existing form keys survive; existing `/Fields` come first, then the new widgets.
fn build_acroform(
    source: &SourceDocument<'_>,
    catalog: &DictionaryEntries,
    widgets: impl Iterator<Item = ObjectId>,
) -> Result<PdfDictionary, SignError> {
    let mut form = PdfDictionary::new().with("Fields", PdfArray::new());
    let mut fields = PdfArray::new();

    if let Some(existing) = catalog.get("AcroForm") {
        let existing = source.resolve(existing)?;
        if let Some(dict) = existing.shape.as_dictionary() {
            for entry in dict.iter() {
                if entry.key == "Fields" {
                    let resolved = source.resolve(&entry.value)?;
                    for item in resolved.shape.as_array().unwrap_or_default() {
                        fields.push(PdfObject::raw(item.raw.clone()));
                    }
                } else {
                    form.insert(entry.key.as_str(), PdfObject::raw(entry.value.raw.clone()));
                }
            }
        }
    }

    for widget in widgets {
        fields.push(PdfObject::Reference(widget));
    }
    form.insert("Fields", fields);
    form.insert("SigFlags", 3);
    Ok(form)
}

/// Every catalog key is carried over verbatim except `/AcroForm`.
fn rebuild_catalog(catalog: &DictionaryEntries, acroform: &IndirectObject) -> PdfDictionary {
    let mut root = PdfDictionary::new();
    for entry in catalog.iter() {
        root.insert(entry.key.as_str(), PdfObject::raw(entry.value.raw.clone()));
    }
    root.insert("AcroForm", acroform.reference());
    root
}

/// One updated object per page that received widgets, in first-use order.
fn rebuild_pages(
    source: &SourceDocument<'_>,
    fields: &[PlannedField],
) -> Result<Vec<IndirectObject>, SignError> {
    let mut grouped: Vec<(ObjectId, Vec<ObjectId>)> = Vec::new();
    for field in fields {
        match grouped.iter_mut().find(|(page, _)| *page == field.page) {
            Some((_, widgets)) => widgets.push(field.widget.id()),
            None => grouped.push((field.page, vec![field.widget.id()])),
        }
    }

    grouped
        .into_iter()
        .map(|(page, widgets)| {
            let original = source.dictionary(page)?;
            let mut annots = PdfArray::new();
            if let Some(existing) = original.get("Annots") {
                let resolved = source.resolve(existing)?;
                match resolved.shape.as_array() {
                    Some(items) => {
                        for item in items {
                            annots.push(PdfObject::raw(item.raw.clone()));
                        }
                    }
                    None => warn!(
                        target: "pdf-signer",
                        page = %page,
                        "page /Annots is not an array; replacing it"
                    ),
                }
            }
            for widget in widgets {
                annots.push(PdfObject::Reference(widget));
            }

            let mut dict = PdfDictionary::new();
            for entry in original.iter() {
                dict.insert(entry.key.as_str(), PdfObject::raw(entry.value.raw.clone()));
            }
            dict.insert("Annots", annots);
            Ok(IndirectObject::new(page, dict))
        })
        .collect()
}

/// Appends objects, an xref section and a trailer. Returns the signature placeholders written
/// in this revision and the new xref offset.
fn append_revision(
    out: &mut Vec<u8>,
    objects: &[&IndirectObject],
    source: &SourceDocument<'_>,
    size: u32,
    prev: usize,
) -> Result<(Option<SignaturePlaceholders>, usize), SignError> {
    let mut entries = Vec::with_capacity(objects.len());
    let mut placeholders = None;
    let mut serializer = ObjectSerializer::new(out);
    for object in objects {
        let written = serializer.write_indirect(object);
        entries.push(XrefEntry::from(&written));
        if let Some(spans) = written.signature {
            if placeholders.replace(spans).is_some() {
                return Err(SignError::structure("more than one signature in a revision"));
            }
        }
    }

    let xref_offset = write_xref(out, &entries);
    let trailer = source.trailer();
    let mut dict = PdfDictionary::new()
        .with("Size", size)
        .with("Root", PdfObject::Reference(trailer.root))
        .with("Prev", prev as i64);
    if let Some(info) = &trailer.info {
        dict.insert("Info", PdfObject::raw(info.raw.clone()));
    }
    if let Some(id) = &trailer.id {
        dict.insert("ID", PdfObject::raw(id.raw.clone()));
    }
    write_trailer(out, &dict, xref_offset);
    Ok((placeholders, xref_offset))
}

/// Fills `/ByteRange`, signs everything outside `/Contents` and writes the signature into it.
fn seal(
    out: &mut [u8],
    spans: &SignaturePlaceholders,
    field: &PlannedField,
) -> Result<SignatureReport, SignError> {
    let contents = spans.contents.clone();
    let byte_range = [0, contents.start, contents.end, out.len() - contents.end];
    let text = format!(
        "[{} {} {} {}]",
        byte_range[0], byte_range[1], byte_range[2], byte_range[3]
    );
    if text.len() > BYTE_RANGE_WIDTH {
        return Err(SignError::structure("byte range does not fit its placeholder"));
    }
    let slot = &mut out[spans.byte_range.clone()];
    slot.fill(b' ');
    slot[..text.len()].copy_from_slice(text.as_bytes());

    let mut covered = Vec::with_capacity(out.len() - contents.len());
    covered.extend_from_slice(&out[..contents.start]);
    covered.extend_from_slice(&out[contents.end..]);
    let digest = Sha256::digest(&covered);
    let der = field.identity.sign_detached(&covered)?;

    let capacity = (contents.len() - 2) / 2;
    if der.len() > capacity {
        return Err(SignError::Capacity {
            needed: der.len(),
            reserved: capacity,
        });
    }
    let encoded = hex::encode_upper(&der);
    let start = contents.start + 1;
    out[start..start + encoded.len()].copy_from_slice(encoded.as_bytes());

    Ok(SignatureReport {
        zone_id: field.zone_id.clone(),
        page_number: field.page_number,
        signature_object: field.signature.id(),
        widget_object: field.widget.id(),
        byte_range,
        digest_hex: hex::encode(digest),
        signature_len: der.len(),
        reserved: field.reserved,
    })
}
