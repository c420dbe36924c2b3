//! A small PDF tokenizer.
//!
//! It recognises enough syntax to read the trailer, the catalog and page dictionaries of an
//! existing document. Every parsed value keeps the exact bytes it came from, so keys the signer
//! does not understand can be written back unchanged.

use std::ops::Range;

use crate::error::SignError;
use crate::object::ObjectId;

#[derive(Clone, Debug, PartialEq)]
pub enum Token<'a> {
    /// Decoded name without the solidus.
    Name(String),
    Integer(i64),
    Real(f64),
    LiteralString,
    HexString,
    ArrayStart,
    ArrayEnd,
    DictStart,
    DictEnd,
    /// `obj`, `R`, `true`, `stream`, ...
    Keyword(&'a [u8]),
}

/// A parsed value and the bytes it was parsed from.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    pub shape: Shape,
    pub span: Range<usize>,
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Name(String),
    String,
    Array(Vec<Value>),
    Dictionary(DictionaryEntries),
    Reference(ObjectId),
    Keyword(String),
}

impl Shape {
    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            Shape::Reference(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Shape::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Shape::Integer(value) => Some(*value as f64),
            Shape::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Shape::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Shape::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&DictionaryEntries> {
        match self {
            Shape::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DictEntry {
    pub key: String,
    pub value: Value,
}

/// Dictionary entries in source order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DictionaryEntries {
    entries: Vec<DictEntry>,
}

impl DictionaryEntries {
    /// Later duplicates win, matching how readers treat repeated keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DictEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Lexer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::at(data, 0)
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn skip_whitespace(&mut self) {
        while let Some(&byte) = self.data.get(self.pos) {
            if is_whitespace(byte) {
                self.pos += 1;
            } else if byte == b'%' {
                while let Some(&c) = self.data.get(self.pos) {
                    if c == b'\n' || c == b'\r' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Option<(Token<'a>, Range<usize>)>, SignError> {
        self.skip_whitespace();
        let start = self.pos;
        let Some(&byte) = self.data.get(start) else {
            return Ok(None);
        };

        let token = match byte {
            b'/' => {
                self.pos += 1;
                let run = self.regular_run();
                Token::Name(decode_name(run))
            }
            b'(' => {
                self.literal_string(start)?;
                Token::LiteralString
            }
            b'<' if self.data.get(start + 1) == Some(&b'<') => {
                self.pos += 2;
                Token::DictStart
            }
            b'<' => {
                let end = self.data[start..]
                    .iter()
                    .position(|&c| c == b'>')
                    .ok_or_else(|| SignError::structure(format!("unterminated hex string at {start}")))?;
                self.pos = start + end + 1;
                Token::HexString
            }
            b'>' if self.data.get(start + 1) == Some(&b'>') => {
                self.pos += 2;
                Token::DictEnd
            }
            b'[' => {
                self.pos += 1;
                Token::ArrayStart
            }
            b']' => {
                self.pos += 1;
                Token::ArrayEnd
            }
            b'{' | b'}' => {
                self.pos += 1;
                Token::Keyword(&self.data[start..self.pos])
            }
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.number(start)?,
            b')' | b'>' => {
                return Err(SignError::structure(format!(
                    "unexpected '{}' at offset {start}",
                    byte as char
                )))
            }
            _ => Token::Keyword(self.regular_run()),
        };
        Ok(Some((token, start..self.pos)))
    }

    /// Parses one complete value, folding `<n> <g> R` into a reference.
    pub fn parse_value(&mut self) -> Result<Value, SignError> {
        let Some((token, span)) = self.next_token()? else {
            return Err(SignError::structure("unexpected end of data"));
        };

        let shape = match token {
            Token::Integer(number) => {
                if let Some(id) = self.reference_tail(number) {
                    Shape::Reference(id)
                } else {
                    Shape::Integer(number)
                }
            }
            Token::Real(value) => Shape::Real(value),
            Token::Name(name) => Shape::Name(name),
            Token::LiteralString | Token::HexString => Shape::String,
            Token::ArrayStart => {
                let mut items = Vec::new();
                loop {
                    self.skip_whitespace();
                    match self.data.get(self.pos) {
                        Some(b']') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => items.push(self.parse_value()?),
                        None => return Err(SignError::structure("unterminated array")),
                    }
                }
                Shape::Array(items)
            }
            Token::DictStart => Shape::Dictionary(self.dictionary_entries()?),
            Token::Keyword(word) => match word {
                b"true" => Shape::Boolean(true),
                b"false" => Shape::Boolean(false),
                b"null" => Shape::Null,
                other => Shape::Keyword(String::from_utf8_lossy(other).into_owned()),
            },
            Token::ArrayEnd | Token::DictEnd => {
                return Err(SignError::structure(format!(
                    "unbalanced delimiter at offset {}",
                    span.start
                )))
            }
        };

        let span = span.start..self.pos;
        Ok(Value {
            shape,
            raw: self.data[span.clone()].to_vec(),
            span,
        })
    }

    /// Parses a dictionary starting at the current position.
    pub fn parse_dictionary(&mut self) -> Result<DictionaryEntries, SignError> {
        let start = self.pos;
        match self.parse_value()?.shape {
            Shape::Dictionary(entries) => Ok(entries),
            _ => Err(SignError::structure(format!(
                "expected a dictionary at offset {start}"
            ))),
        }
    }

    fn dictionary_entries(&mut self) -> Result<DictionaryEntries, SignError> {
        let mut entries = Vec::new();
        loop {
            match self.next_token()? {
                Some((Token::DictEnd, _)) => break,
                Some((Token::Name(key), _)) => {
                    let value = self.parse_value()?;
                    entries.push(DictEntry { key, value });
                }
                Some((_, span)) => {
                    return Err(SignError::structure(format!(
                        "dictionary key expected at offset {}",
                        span.start
                    )))
                }
                None => return Err(SignError::structure("unterminated dictionary")),
            }
        }
        Ok(DictionaryEntries { entries })
    }

    fn reference_tail(&mut self, number: i64) -> Option<ObjectId> {
        let save = self.pos;
        let id = match (self.next_token(), self.next_token()) {
            (Ok(Some((Token::Integer(generation), _))), Ok(Some((Token::Keyword(word), _))))
                if word == b"R" =>
            {
                match (u32::try_from(number), u16::try_from(generation)) {
                    (Ok(number), Ok(generation)) => {
                        Some(ObjectId::with_generation(number, generation))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        if id.is_none() {
            self.pos = save;
        }
        id
    }

    fn literal_string(&mut self, start: usize) -> Result<(), SignError> {
        let mut depth = 0usize;
        let mut pos = start;
        while let Some(&byte) = self.data.get(pos) {
            match byte {
                b'\\' => pos += 1,
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos = pos + 1;
                        return Ok(());
                    }
                }
                _ => {}
            }
            pos += 1;
        }
        Err(SignError::structure(format!(
            "unterminated string at offset {start}"
        )))
    }

    fn number(&mut self, start: usize) -> Result<Token<'a>, SignError> {
        let mut end = start;
        if matches!(self.data.get(end), Some(b'+' | b'-')) {
            end += 1;
        }
        while matches!(self.data.get(end), Some(b'0'..=b'9' | b'.')) {
            end += 1;
        }
        self.pos = end;

        let text = std::str::from_utf8(&self.data[start..end]).unwrap_or_default();
        let invalid = || SignError::structure(format!("invalid number '{text}' at offset {start}"));
        if text.contains('.') {
            text.parse::<f64>().map(Token::Real).map_err(|_| invalid())
        } else {
            text.parse::<i64>().map(Token::Integer).map_err(|_| invalid())
        }
    }

    fn regular_run(&mut self) -> &'a [u8] {
        let start = self.pos;
        while let Some(&byte) = self.data.get(self.pos) {
            if is_whitespace(byte) || is_delimiter(byte) {
                break;
            }
            self.pos += 1;
        }
        &self.data[start..self.pos]
    }
}

pub(crate) fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b'\0' | b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

fn decode_name(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'#' && i + 2 < raw.len() {
            if let Ok(decoded) = hex::decode(&raw[i + 1..i + 3]) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
