//! Serialization of appended objects, cross-reference sections and trailers.

use std::ops::Range;

use crate::object::{
    IndirectObject, ObjectId, PdfDictionary, PdfName, PdfNumber, PdfObject, PdfStream,
    SignatureDictionary, BYTE_RANGE_WIDTH,
};

/// Absolute spans of the patchable parts of a written signature dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignaturePlaceholders {
    /// `<000...0>` including both delimiters.
    pub contents: Range<usize>,
    /// The fixed-width `[ ... ]` span.
    pub byte_range: Range<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenObject {
    pub id: ObjectId,
    /// Offset of the first digit of `<id> <gen> obj`.
    pub offset: usize,
    pub signature: Option<SignaturePlaceholders>,
}

/// Appends objects to an output buffer and reports where they landed.
pub struct ObjectSerializer<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> ObjectSerializer<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub fn position(&self) -> usize {
        self.out.len()
    }

    /// Writes `<id> <gen> obj` ... `endobj`, starting on a fresh line.
    pub fn write_indirect(&mut self, object: &IndirectObject) -> WrittenObject {
        self.start_line();
        let offset = self.out.len();
        let id = object.id();
        self.put(format!("{} {} obj\n", id.number, id.generation).as_bytes());
        let signature = self.write_object(object.object());
        self.put(b"\nendobj\n");
        WrittenObject {
            id,
            offset,
            signature,
        }
    }

    /// Writes a direct object. Returns placeholder spans if it contained a signature dictionary.
    pub fn write_object(&mut self, object: &PdfObject) -> Option<SignaturePlaceholders> {
        let mut placeholders = None;
        self.write_value(object, &mut placeholders);
        placeholders
    }

    fn write_value(&mut self, object: &PdfObject, placeholders: &mut Option<SignaturePlaceholders>) {
        match object {
            PdfObject::Null => self.put(b"null"),
            PdfObject::Boolean(value) => self.put(if *value { b"true" } else { b"false" }),
            PdfObject::Number(number) => self.put(format_number(*number).as_bytes()),
            PdfObject::Name(name) => self.write_name(name),
            PdfObject::String(text) => {
                self.out.push(b'(');
                for &byte in text.as_bytes() {
                    match byte {
                        b'(' | b')' | b'\\' => self.put(&[b'\\', byte]),
                        b'\n' => self.put(b"\\n"),
                        b'\r' => self.put(b"\\r"),
                        b'\t' => self.put(b"\\t"),
                        0x20..=0x7e => self.out.push(byte),
                        _ => self.put(format!("\\{byte:03o}").as_bytes()),
                    }
                }
                self.out.push(b')');
            }
            PdfObject::Array(items) => {
                self.out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(b' ');
                    }
                    self.write_value(item, placeholders);
                }
                self.out.push(b']');
            }
            PdfObject::Dictionary(dict) => self.write_dictionary(dict, placeholders),
            PdfObject::Reference(id) => {
                self.put(format!("{} {} R", id.number, id.generation).as_bytes())
            }
            PdfObject::Raw(bytes) => self.put(bytes),
            PdfObject::Stream(stream) => self.write_stream(stream, placeholders),
            PdfObject::Signature(signature) => {
                let spans = self.write_signature(signature, placeholders);
                *placeholders = Some(spans);
            }
        }
    }

    fn write_dictionary(
        &mut self,
        dict: &PdfDictionary,
        placeholders: &mut Option<SignaturePlaceholders>,
    ) {
        self.put(b"<<");
        self.write_entries(dict, placeholders);
        self.put(b" >>");
    }

    fn write_entries(
        &mut self,
        dict: &PdfDictionary,
        placeholders: &mut Option<SignaturePlaceholders>,
    ) {
        for (key, value) in dict.iter() {
            self.out.push(b' ');
            self.write_name(key);
            self.out.push(b' ');
            self.write_value(value, placeholders);
        }
    }

    fn write_stream(&mut self, stream: &PdfStream, placeholders: &mut Option<SignaturePlaceholders>) {
        let dict = stream
            .dict
            .clone()
            .with("Length", stream.data.len() as i64);
        self.write_dictionary(&dict, placeholders);
        self.put(b"\nstream\n");
        self.put(&stream.data);
        self.put(b"\nendstream");
    }

    fn write_signature(
        &mut self,
        signature: &SignatureDictionary,
        placeholders: &mut Option<SignaturePlaceholders>,
    ) -> SignaturePlaceholders {
        self.put(b"<<");
        self.write_entries(signature.entries(), placeholders);

        self.put(b" /Contents ");
        let contents_start = self.out.len();
        self.out.push(b'<');
        self.out
            .resize(self.out.len() + signature.contents_capacity() * 2, b'0');
        self.out.push(b'>');
        let contents = contents_start..self.out.len();

        self.put(b" /ByteRange ");
        let range_start = self.out.len();
        self.out.push(b'[');
        self.out.resize(range_start + BYTE_RANGE_WIDTH - 1, b' ');
        self.out.push(b']');
        let byte_range = range_start..self.out.len();

        self.put(b" >>");
        SignaturePlaceholders {
            contents,
            byte_range,
        }
    }

    fn write_name(&mut self, name: &PdfName) {
        self.out.push(b'/');
        for &byte in name.as_str().as_bytes() {
            if is_regular_name_byte(byte) {
                self.out.push(byte);
            } else {
                self.put(format!("#{byte:02X}").as_bytes());
            }
        }
    }

    fn start_line(&mut self) {
        if !matches!(self.out.last(), None | Some(b'\n') | Some(b'\r')) {
            self.out.push(b'\n');
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }
}

fn is_regular_name_byte(byte: u8) -> bool {
    (0x21..=0x7e).contains(&byte)
        && !matches!(
            byte,
            b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%' | b'#'
        )
}

fn format_number(number: PdfNumber) -> String {
    match number {
        PdfNumber::Integer(value) => value.to_string(),
        PdfNumber::Real(value) => {
            let text = format!("{value:.4}");
            let text = text.trim_end_matches('0').trim_end_matches('.');
            match text {
                "-0" | "" => "0".to_string(),
                other => other.to_string(),
            }
        }
    }
}

/// One in-use cross-reference entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XrefEntry {
    pub id: ObjectId,
    pub offset: usize,
}

impl From<&WrittenObject> for XrefEntry {
    fn from(written: &WrittenObject) -> Self {
        Self {
            id: written.id,
            offset: written.offset,
        }
    }
}

/// Writes a classic `xref` section split into contiguous subsections and returns its offset.
pub fn write_xref(out: &mut Vec<u8>, entries: &[XrefEntry]) -> usize {
    if !matches!(out.last(), None | Some(b'\n') | Some(b'\r')) {
        out.push(b'\n');
    }
    let offset = out.len();
    out.extend_from_slice(b"xref\n");

    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|entry| entry.id.number);
    sorted.dedup_by_key(|entry| entry.id.number);

    let mut start = 0;
    while start < sorted.len() {
        let mut end = start + 1;
        while end < sorted.len() && sorted[end].id.number == sorted[end - 1].id.number + 1 {
            end += 1;
        }
        out.extend_from_slice(format!("{} {}\n", sorted[start].id.number, end - start).as_bytes());
        for entry in &sorted[start..end] {
            out.extend_from_slice(
                format!("{:010} {:05} n \n", entry.offset, entry.id.generation).as_bytes(),
            );
        }
        start = end;
    }
    offset
}

/// Writes `trailer`, the dictionary and the `startxref` footer.
pub fn write_trailer(out: &mut Vec<u8>, trailer: &PdfDictionary, xref_offset: usize) {
    out.extend_from_slice(b"trailer\n");
    ObjectSerializer::new(out).write_object(&PdfObject::Dictionary(trailer.clone()));
    out.extend_from_slice(format!("\nstartxref\n{xref_offset}\n%%EOF\n").as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{PdfArray, PdfString};
    use pretty_assertions::assert_eq;

    fn render(object: PdfObject) -> String {
        let mut out = Vec::new();
        ObjectSerializer::new(&mut out).write_object(&object);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn dictionaries_keep_insertion_order() {
        let dict = PdfDictionary::new()
            .with("Type", PdfName::new("Annot"))
            .with("Rect", [0.0, 10.5, 100.25, 60.0].into_iter().collect::<PdfArray>())
            .with("P", PdfObject::Reference(ObjectId::new(3)))
            .with("T", PdfString::from("sig (1)"));
        assert_eq!(
            render(dict.into()),
            "<< /Type /Annot /Rect [0 10.5 100.25 60] /P 3 0 R /T (sig \\(1\\)) >>"
        );
    }

    #[test]
    fn names_escape_delimiters() {
        assert_eq!(render(PdfName::new("A B#(c)").into()), "/A#20B#23#28c#29");
    }

    #[test]
    fn reals_are_trimmed() {
        assert_eq!(format_number(PdfNumber::Real(12.0)), "12");
        assert_eq!(format_number(PdfNumber::Real(-0.00001)), "0");
        assert_eq!(format_number(PdfNumber::Real(595.2756)), "595.2756");
    }

    #[test]
    fn indirect_offset_points_at_object_number() {
        let mut out = b"%PDF-1.7\n%%EOF".to_vec();
        let written = ObjectSerializer::new(&mut out)
            .write_indirect(&IndirectObject::new(ObjectId::new(7), PdfObject::Null));
        assert!(out[written.offset..].starts_with(b"7 0 obj\nnull\nendobj\n"));
        assert_eq!(out[written.offset - 1], b'\n');
    }

    #[test]
    fn signature_placeholders_are_recorded() {
        let mut out = Vec::new();
        let sig = SignatureDictionary::new("D:20240101000000Z", 8);
        let written = ObjectSerializer::new(&mut out)
            .write_indirect(&IndirectObject::new(ObjectId::new(4), sig));
        let spans = written.signature.unwrap();

        assert_eq!(&out[spans.contents.clone()], format!("<{}>", "0".repeat(16)).as_bytes());
        assert_eq!(spans.byte_range.len(), BYTE_RANGE_WIDTH);
        assert_eq!(out[spans.byte_range.start], b'[');
        assert_eq!(out[spans.byte_range.end - 1], b']');
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("/SubFilter /adbe.pkcs7.detached /M (D:20240101000000Z) /Contents <"));
    }

    #[test]
    fn streams_get_their_length() {
        let stream = PdfStream::new(PdfDictionary::new(), b"abc".to_vec());
        assert_eq!(render(stream.into()), "<< /Length 3 >>\nstream\nabc\nendstream");
    }

    #[test]
    fn xref_groups_contiguous_ranges() {
        let mut out = b"body".to_vec();
        let entries = [
            XrefEntry { id: ObjectId::new(12), offset: 300 },
            XrefEntry { id: ObjectId::new(1), offset: 10 },
            XrefEntry { id: ObjectId::new(11), offset: 200 },
            XrefEntry { id: ObjectId::new(13), offset: 400 },
        ];
        let offset = write_xref(&mut out, &entries);
        assert_eq!(offset, 5);
        assert_eq!(
            String::from_utf8(out[offset..].to_vec()).unwrap(),
            "xref\n1 1\n0000000010 00000 n \n11 3\n0000000200 00000 n \n0000000300 00000 n \n0000000400 00000 n \n"
        );
    }

    #[test]
    fn trailer_ends_with_eof_marker() {
        let mut out = Vec::new();
        let trailer = PdfDictionary::new()
            .with("Size", 14)
            .with("Root", PdfObject::Reference(ObjectId::new(1)))
            .with("Prev", 1234);
        write_trailer(&mut out, &trailer, 999);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "trailer\n<< /Size 14 /Root 1 0 R /Prev 1234 >>\nstartxref\n999\n%%EOF\n"
        );
    }
}
