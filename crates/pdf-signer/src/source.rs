//! Read-only view of the document being updated.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use pdfpipe_core_types::LETTER_HEIGHT_PT;
use regex::bytes::Regex;
use tracing::debug;

use crate::error::SignError;
use crate::lexer::{DictionaryEntries, Lexer, Shape, Token, Value};
use crate::object::ObjectId;

static OBJECT_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)(\d+)[\x00\t\n\x0c\r ]+(\d+)[\x00\t\n\x0c\r ]+obj\b")
        .expect("object header pattern is valid")
});

const MAX_TREE_DEPTH: usize = 64;

/// The trailer of the revision being extended.
#[derive(Clone, Debug)]
pub struct Trailer {
    pub root: ObjectId,
    pub size: Option<u32>,
    /// Raw `/Info` value, carried into the new trailer.
    pub info: Option<Value>,
    /// Raw `/ID` value, carried into the new trailer.
    pub id: Option<Value>,
    pub entries: DictionaryEntries,
}

#[derive(Clone, Copy, Debug)]
struct ObjectLocation {
    generation: u16,
    body: usize,
}

/// The parts of an existing PDF an incremental update has to know about.
#[derive(Debug)]
pub struct SourceDocument<'a> {
    data: &'a [u8],
    last_startxref: usize,
    trailer: Trailer,
    objects: HashMap<u32, ObjectLocation>,
    max_object_id: u32,
}

impl<'a> SourceDocument<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, SignError> {
        let last_startxref = find_last_startxref(data)?;
        let trailer = read_trailer(data, last_startxref)?;

        let mut objects = HashMap::new();
        let mut max_header = 0u32;
        let mut cursor = 0;
        while let Some(caps) = OBJECT_HEADER.captures_at(data, cursor) {
            let Some(whole) = caps.get(0) else {
                break;
            };
            cursor = whole.end();
            let (Some(number), Some(generation)) = (
                parse_capture::<u32>(caps.get(1)),
                parse_capture::<u16>(caps.get(2)),
            ) else {
                continue;
            };
            max_header = max_header.max(number);
            // Incremental updates append newer definitions, so the last one wins.
            objects.insert(
                number,
                ObjectLocation {
                    generation,
                    body: whole.end(),
                },
            );
            // Stream data is opaque; header-like text inside it must not shadow real objects.
            if let Some(end) = stream_end(data, whole.end()) {
                cursor = end;
            }
        }

        let from_size = trailer.size.map(|size| size.saturating_sub(1)).unwrap_or(0);
        let max_object_id = max_header.max(from_size);
        debug!(
            target: "pdf-signer",
            startxref = last_startxref,
            objects = objects.len(),
            max_object_id,
            root = %trailer.root,
            "source document scanned"
        );

        Ok(Self {
            data,
            last_startxref,
            trailer,
            objects,
            max_object_id,
        })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Offset named by the final `startxref`; the new trailer's `/Prev`.
    pub fn last_startxref(&self) -> usize {
        self.last_startxref
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn max_object_id(&self) -> u32 {
        self.max_object_id
    }

    pub fn next_object_id(&self) -> u32 {
        self.max_object_id + 1
    }

    /// Current identity (with generation) of object `number`, if it is defined.
    pub fn object_id(&self, number: u32) -> Option<ObjectId> {
        self.objects
            .get(&number)
            .map(|loc| ObjectId::with_generation(number, loc.generation))
    }

    /// Bytes between `obj` and `endobj` of the newest definition of `id`.
    pub fn object_body(&self, id: ObjectId) -> Result<&'a [u8], SignError> {
        let location = self.location(id)?;
        let rest = &self.data[location.body..];
        let end = find(rest, b"endobj").unwrap_or(rest.len());
        Ok(&rest[..end])
    }

    /// First value of the object's body, with spans relative to the whole file.
    pub fn object_value(&self, id: ObjectId) -> Result<Value, SignError> {
        let location = self.location(id)?;
        Lexer::at(self.data, location.body)
            .parse_value()
            .map_err(|err| SignError::structure(format!("object {id}: {err}")))
    }

    pub fn dictionary(&self, id: ObjectId) -> Result<DictionaryEntries, SignError> {
        match self.object_value(id)?.shape {
            Shape::Dictionary(entries) => Ok(entries),
            _ => Err(SignError::structure(format!("object {id} is not a dictionary"))),
        }
    }

    /// Follows one level of indirection.
    pub fn resolve(&self, value: &Value) -> Result<Value, SignError> {
        match value.shape.as_reference() {
            Some(id) => self.object_value(id),
            None => Ok(value.clone()),
        }
    }

    pub fn catalog(&self) -> Result<DictionaryEntries, SignError> {
        self.dictionary(self.trailer.root)
    }

    /// Leaf page objects in document order.
    pub fn page_refs(&self) -> Result<Vec<ObjectId>, SignError> {
        let catalog = self.catalog()?;
        let root = catalog
            .get("Pages")
            .and_then(|value| value.shape.as_reference())
            .ok_or_else(|| SignError::structure("catalog has no /Pages reference"))?;

        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        self.collect_pages(root, 0, &mut visited, &mut pages)?;
        Ok(pages)
    }

    fn collect_pages(
        &self,
        node: ObjectId,
        depth: usize,
        visited: &mut HashSet<ObjectId>,
        pages: &mut Vec<ObjectId>,
    ) -> Result<(), SignError> {
        if depth > MAX_TREE_DEPTH || !visited.insert(node) {
            return Ok(());
        }
        let dict = self.dictionary(node)?;
        let is_tree_node = dict
            .get("Type")
            .and_then(|value| value.shape.as_name())
            .map_or(dict.get("Kids").is_some(), |name| name == "Pages");
        if !is_tree_node {
            pages.push(node);
            return Ok(());
        }

        let Some(kids) = dict.get("Kids") else {
            return Ok(());
        };
        let kids = self.resolve(kids)?;
        for kid in kids.shape.as_array().unwrap_or_default() {
            if let Some(id) = kid.shape.as_reference() {
                self.collect_pages(id, depth + 1, visited, pages)?;
            }
        }
        Ok(())
    }

    /// Height of the first page's `/MediaBox`, inherited through `/Parent`.
    /// Falls back to US Letter when nothing usable is found.
    pub fn page_height(&self) -> f64 {
        self.page_refs()
            .ok()
            .and_then(|pages| pages.first().copied())
            .and_then(|page| self.media_box_height(page))
            .unwrap_or(LETTER_HEIGHT_PT)
    }

    fn media_box_height(&self, page: ObjectId) -> Option<f64> {
        let mut node = page;
        for _ in 0..MAX_TREE_DEPTH {
            let dict = self.dictionary(node).ok()?;
            if let Some(media_box) = dict.get("MediaBox") {
                let media_box = self.resolve(media_box).ok()?;
                let corners: Vec<f64> = media_box
                    .shape
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.shape.as_number())
                    .collect();
                if let [_, lly, _, ury] = corners.as_slice() {
                    let height = (ury - lly).abs();
                    return (height > 0.0).then_some(height);
                }
                return None;
            }
            node = dict.get("Parent")?.shape.as_reference()?;
        }
        None
    }

    fn location(&self, id: ObjectId) -> Result<ObjectLocation, SignError> {
        self.objects
            .get(&id.number)
            .copied()
            .ok_or_else(|| SignError::structure(format!("object {id} not found")))
    }
}

/// Offset just past `endstream` when the object whose body starts at `body` is a stream.
fn stream_end(data: &[u8], body: usize) -> Option<usize> {
    let mut lexer = Lexer::at(data, body);
    let dict = lexer.parse_value().ok()?;
    let Shape::Dictionary(entries) = &dict.shape else {
        return None;
    };
    let start = match lexer.next_token() {
        Ok(Some((Token::Keyword(word), span))) if word == b"stream" => span.end,
        _ => return None,
    };
    // A direct /Length jumps over the data; an indirect one falls back to the keyword scan.
    let skip = entries
        .get("Length")
        .and_then(|value| value.shape.as_integer())
        .and_then(|len| usize::try_from(len).ok())
        .filter(|len| start.saturating_add(*len) <= data.len())
        .unwrap_or(0);
    let from = start + skip;
    find(&data[from..], b"endstream").map(|at| from + at + b"endstream".len())
}

fn parse_capture<T: std::str::FromStr>(capture: Option<regex::bytes::Match<'_>>) -> Option<T> {
    std::str::from_utf8(capture?.as_bytes()).ok()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn find_last_startxref(data: &[u8]) -> Result<usize, SignError> {
    let keyword = rfind(data, b"startxref")
        .ok_or_else(|| SignError::structure("no startxref marker"))?;
    let mut lexer = Lexer::at(data, keyword + b"startxref".len());
    match lexer.next_token()? {
        Some((Token::Integer(offset), _)) if offset >= 0 && (offset as usize) < data.len() => {
            Ok(offset as usize)
        }
        _ => Err(SignError::structure("startxref is not followed by a valid offset")),
    }
}

fn read_trailer(data: &[u8], xref_offset: usize) -> Result<Trailer, SignError> {
    let entries = match find(&data[xref_offset..], b"trailer") {
        Some(pos) => Lexer::at(data, xref_offset + pos + b"trailer".len()).parse_dictionary()?,
        None => cross_reference_stream_dictionary(data, xref_offset)?,
    };

    if entries.get("Encrypt").is_some() {
        return Err(SignError::structure("encrypted documents are not supported"));
    }
    let root = entries
        .get("Root")
        .and_then(|value| value.shape.as_reference())
        .ok_or_else(|| SignError::structure("trailer has no /Root reference"))?;
    let size = entries
        .get("Size")
        .and_then(|value| value.shape.as_integer())
        .and_then(|size| u32::try_from(size).ok());

    Ok(Trailer {
        root,
        size,
        info: entries.get("Info").cloned(),
        id: entries.get("ID").cloned(),
        entries,
    })
}

/// PDF 1.5 files keep their trailer keys in the `/Type /XRef` stream's dictionary.
fn cross_reference_stream_dictionary(
    data: &[u8],
    offset: usize,
) -> Result<DictionaryEntries, SignError> {
    let missing = || SignError::structure(format!("no trailer found after xref offset {offset}"));
    let mut lexer = Lexer::at(data, offset);
    match (lexer.next_token()?, lexer.next_token()?, lexer.next_token()?) {
        (
            Some((Token::Integer(_), _)),
            Some((Token::Integer(_), _)),
            Some((Token::Keyword(word), _)),
        ) if word == b"obj" => {}
        _ => return Err(missing()),
    }
    let entries = lexer.parse_dictionary()?;
    match entries.get("Type").and_then(|value| value.shape.as_name()) {
        Some("XRef") => Ok(entries),
        _ => Err(missing()),
    }
}
