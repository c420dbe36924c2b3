//! Object model for the bytes appended by an incremental update.
//!
//! Only what the signer writes is modelled. Values copied out of the source document travel as
//! [`PdfObject::Raw`] spans and are re-emitted byte for byte.

use std::fmt;

/// `<number> <generation>` identity of an indirect object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub number: u32,
    pub generation: u16,
}

impl ObjectId {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            generation: 0,
        }
    }

    pub fn with_generation(number: u32, generation: u16) -> Self {
        Self { number, generation }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.generation)
    }
}

/// A name without its leading solidus.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PdfName(String);

impl PdfName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PdfName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PdfNumber {
    Integer(i64),
    Real(f64),
}

/// Literal string payload. Escaping happens at serialization time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PdfString(Vec<u8>);

impl PdfString {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for PdfString {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PdfArray(Vec<PdfObject>);

impl PdfArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: impl Into<PdfObject>) {
        self.0.push(item.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PdfObject> {
        self.0.iter()
    }
}

impl<T: Into<PdfObject>> FromIterator<T> for PdfArray {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Dictionary that keeps keys in insertion order.
///
/// Replacing an existing key keeps its original position, so a dictionary rebuilt from a source
/// object serializes its keys in the order the source had them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PdfDictionary {
    entries: Vec<(PdfName, PdfObject)>,
}

impl PdfDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<PdfName>, value: impl Into<PdfObject>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<PdfName>, value: impl Into<PdfObject>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PdfObject> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<PdfObject> {
        let index = self.entries.iter().position(|(k, _)| k.as_str() == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PdfName, &PdfObject)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// A stream: its dictionary gets `/Length` set from `data` when serialized.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PdfStream {
    pub dict: PdfDictionary,
    pub data: Vec<u8>,
}

impl PdfStream {
    pub fn new(dict: PdfDictionary, data: impl Into<Vec<u8>>) -> Self {
        Self {
            dict,
            data: data.into(),
        }
    }
}

/// A `/Type /Sig` dictionary whose `/Contents` and `/ByteRange` are written as fixed-width
/// placeholders and patched after the file layout is final.
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureDictionary {
    entries: PdfDictionary,
    contents_capacity: usize,
}

/// Width of the `/ByteRange` placeholder, brackets included.
pub const BYTE_RANGE_WIDTH: usize = 64;

impl SignatureDictionary {
    /// `signing_time` is the already formatted PDF date (`D:...`).
    pub fn new(signing_time: &str, contents_capacity: usize) -> Self {
        let entries = PdfDictionary::new()
            .with("Type", PdfName::new("Sig"))
            .with("Filter", PdfName::new("Adobe.PPKLite"))
            .with("SubFilter", PdfName::new("adbe.pkcs7.detached"))
            .with("M", PdfString::from(signing_time));
        Self {
            entries,
            contents_capacity,
        }
    }

    /// Optional descriptive keys such as `/Name`, `/Reason` or `/Location`.
    pub fn insert(&mut self, key: impl Into<PdfName>, value: impl Into<PdfObject>) {
        self.entries.insert(key, value);
    }

    pub fn entries(&self) -> &PdfDictionary {
        &self.entries
    }

    /// Bytes of DER the `/Contents` placeholder can hold.
    pub fn contents_capacity(&self) -> usize {
        self.contents_capacity
    }

    /// Length of the `/Contents` hex string including its `<` `>` delimiters.
    pub fn contents_width(&self) -> usize {
        self.contents_capacity * 2 + 2
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PdfObject {
    Null,
    Boolean(bool),
    Number(PdfNumber),
    Name(PdfName),
    String(PdfString),
    Array(PdfArray),
    Dictionary(PdfDictionary),
    Reference(ObjectId),
    /// Bytes copied verbatim from the source document.
    Raw(Vec<u8>),
    Stream(PdfStream),
    Signature(SignatureDictionary),
}

impl PdfObject {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Raw(bytes.into())
    }

    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            Self::Reference(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for PdfObject {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for PdfObject {
    fn from(value: i64) -> Self {
        Self::Number(PdfNumber::Integer(value))
    }
}

impl From<i32> for PdfObject {
    fn from(value: i32) -> Self {
        Self::Number(PdfNumber::Integer(value.into()))
    }
}

impl From<u32> for PdfObject {
    fn from(value: u32) -> Self {
        Self::Number(PdfNumber::Integer(value.into()))
    }
}

impl From<f64> for PdfObject {
    fn from(value: f64) -> Self {
        Self::Number(PdfNumber::Real(value))
    }
}

impl From<PdfName> for PdfObject {
    fn from(value: PdfName) -> Self {
        Self::Name(value)
    }
}

impl From<PdfString> for PdfObject {
    fn from(value: PdfString) -> Self {
        Self::String(value)
    }
}

impl From<PdfArray> for PdfObject {
    fn from(value: PdfArray) -> Self {
        Self::Array(value)
    }
}

impl From<PdfDictionary> for PdfObject {
    fn from(value: PdfDictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<PdfStream> for PdfObject {
    fn from(value: PdfStream) -> Self {
        Self::Stream(value)
    }
}

impl From<SignatureDictionary> for PdfObject {
    fn from(value: SignatureDictionary) -> Self {
        Self::Signature(value)
    }
}

/// An object with an identity, written as `<id> <gen> obj ... endobj`.
///
/// `IndirectObject` is not a [`PdfObject`], so the only way to point at it from another object
/// is [`reference`](Self::reference).
#[derive(Clone, Debug, PartialEq)]
pub struct IndirectObject {
    id: ObjectId,
    object: PdfObject,
}

impl IndirectObject {
    pub fn new(id: ObjectId, object: impl Into<PdfObject>) -> Self {
        Self {
            id,
            object: object.into(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn object(&self) -> &PdfObject {
        &self.object
    }

    pub fn reference(&self) -> PdfObject {
        PdfObject::Reference(self.id)
    }
}
