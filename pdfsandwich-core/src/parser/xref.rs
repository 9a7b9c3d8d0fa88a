//! Cross-reference parsing
//!
//! Reads both classic `xref` tables and PDF 1.5 cross-reference streams,
//! following the `/Prev` chain (and hybrid-file `/XRefStm` pointers) so
//! incrementally-updated documents resolve to their newest objects.

use std::collections::HashMap;

use super::lexer::{Lexer, Token};
use super::object::{parse_dictionary, parse_indirect_object};
use super::{filters, ParseError, ParseResult};
use crate::objects::{ObjectId, PdfDictionary, PdfObject};

/// Where an object's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefEntry {
    /// At `offset` in the file, with this generation.
    InUse { offset: usize, generation: u16 },
    /// On the free list.
    Free,
    /// Compressed inside object stream `stream` at `index`.
    InStream { stream: u32, index: u32 },
}

/// The merged cross-reference map plus the newest trailer dictionary.
#[derive(Debug, Clone, Default)]
pub struct XrefTable {
    pub entries: HashMap<u32, XrefEntry>,
    pub trailer: PdfDictionary,
}

impl XrefTable {
    pub fn get(&self, number: u32) -> Option<&XrefEntry> {
        self.entries.get(&number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Locates `startxref` near the end of the file.
pub fn find_startxref(data: &[u8]) -> ParseResult<usize> {
    let tail_start = data.len().saturating_sub(2048);
    let tail = &data[tail_start..];
    let pos = tail
        .windows(9)
        .rposition(|w| w == b"startxref")
        .ok_or_else(|| ParseError::InvalidXref("no startxref marker".to_string()))?;
    let mut lexer = Lexer::at(data, tail_start + pos + 9);
    match lexer.next_token()? {
        Token::Integer(offset) if offset >= 0 => Ok(offset as usize),
        other => Err(ParseError::InvalidXref(format!(
            "bad startxref operand: {other:?}"
        ))),
    }
}

/// Reads the full xref chain starting at `start_offset`. Sections are
/// visited newest-first and earlier entries win, which is exactly the
/// incremental-update shadowing rule.
pub fn read_xref_chain(data: &[u8], start_offset: usize) -> ParseResult<XrefTable> {
    let mut table = XrefTable::default();
    let mut next = Some(start_offset);
    let mut visited = Vec::new();

    while let Some(offset) = next {
        if visited.contains(&offset) {
            return Err(ParseError::InvalidXref("circular /Prev chain".to_string()));
        }
        visited.push(offset);

        let section = read_xref_section(data, offset)?;
        for (number, entry) in section.entries {
            table.entries.entry(number).or_insert(entry);
        }
        if table.trailer.0.is_empty() {
            table.trailer = section.trailer.clone();
        }

        // Hybrid files carry a parallel xref stream with the compressed
        // objects classic readers cannot see.
        if let Some(xrefstm) = section.trailer.get("XRefStm").and_then(|o| o.as_integer()) {
            if !visited.contains(&(xrefstm as usize)) {
                visited.push(xrefstm as usize);
                let hybrid = read_xref_section(data, xrefstm as usize)?;
                for (number, entry) in hybrid.entries {
                    table.entries.entry(number).or_insert(entry);
                }
            }
        }

        next = section
            .trailer
            .get("Prev")
            .and_then(|o| o.as_integer())
            .map(|p| p as usize);
    }
    Ok(table)
}

fn read_xref_section(data: &[u8], offset: usize) -> ParseResult<XrefTable> {
    if offset >= data.len() {
        return Err(ParseError::InvalidXref(format!(
            "xref offset {offset} past end of file"
        )));
    }
    let mut lexer = Lexer::at(data, offset);
    match lexer.peek_token()? {
        Token::Keyword(kw) if kw == "xref" => read_classic_table(&mut lexer),
        Token::Integer(_) => read_xref_stream(data, offset),
        other => Err(ParseError::InvalidXref(format!(
            "neither xref table nor xref stream at offset {offset}: {other:?}"
        ))),
    }
}

fn read_classic_table(lexer: &mut Lexer<'_>) -> ParseResult<XrefTable> {
    let mut table = XrefTable::default();
    lexer.next_token()?; // consume "xref"

    loop {
        match lexer.next_token()? {
            Token::Keyword(kw) if kw == "trailer" => break,
            Token::Integer(first) if first >= 0 => {
                let count = match lexer.next_token()? {
                    Token::Integer(c) if c >= 0 => c as u32,
                    other => {
                        return Err(ParseError::InvalidXref(format!(
                            "bad subsection count: {other:?}"
                        )))
                    }
                };
                for i in 0..count {
                    let number = first as u32 + i;
                    let offset = expect_integer(lexer)?;
                    let generation = expect_integer(lexer)?;
                    let entry = match lexer.next_token()? {
                        Token::Keyword(kw) if kw == "n" => XrefEntry::InUse {
                            offset: offset as usize,
                            generation: generation as u16,
                        },
                        Token::Keyword(kw) if kw == "f" => XrefEntry::Free,
                        other => {
                            return Err(ParseError::InvalidXref(format!(
                                "bad entry type: {other:?}"
                            )))
                        }
                    };
                    table.entries.entry(number).or_insert(entry);
                }
            }
            other => {
                return Err(ParseError::InvalidXref(format!(
                    "bad xref subsection header: {other:?}"
                )))
            }
        }
    }

    match lexer.next_token()? {
        Token::DictStart => {
            table.trailer = parse_dictionary(lexer)?;
            Ok(table)
        }
        other => Err(ParseError::InvalidXref(format!(
            "trailer is not a dictionary: {other:?}"
        ))),
    }
}

fn expect_integer(lexer: &mut Lexer<'_>) -> ParseResult<i64> {
    match lexer.next_token()? {
        Token::Integer(i) => Ok(i),
        other => Err(ParseError::InvalidXref(format!(
            "expected integer, found {other:?}"
        ))),
    }
}

fn read_xref_stream(data: &[u8], offset: usize) -> ParseResult<XrefTable> {
    let mut lexer = Lexer::at(data, offset);
    let (_, object) = parse_indirect_object(&mut lexer, &|_| None)?;
    let stream = object
        .as_stream()
        .ok_or_else(|| ParseError::InvalidXref("xref stream object is not a stream".into()))?;
    let dict = stream.dict.clone();
    let decoded = filters::decode_stream(stream)?;

    let widths: Vec<usize> = dict
        .get("W")
        .and_then(|o| o.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|o| o.as_integer().map(|i| i as usize))
                .collect()
        })
        .ok_or_else(|| ParseError::InvalidXref("xref stream missing /W".into()))?;
    if widths.len() != 3 {
        return Err(ParseError::InvalidXref("/W must have three elements".into()));
    }

    let size = dict
        .get("Size")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| ParseError::InvalidXref("xref stream missing /Size".into()))?;
    let index: Vec<i64> = match dict.get("Index").and_then(|o| o.as_array()) {
        Some(a) => a.iter().filter_map(|o| o.as_integer()).collect(),
        None => vec![0, size],
    };

    let row_len: usize = widths.iter().sum();
    if row_len == 0 {
        return Err(ParseError::InvalidXref("zero-width xref rows".into()));
    }

    let mut table = XrefTable::default();
    table.trailer = dict;
    let mut rows = decoded.chunks_exact(row_len);
    for pair in index.chunks_exact(2) {
        let (first, count) = (pair[0] as u32, pair[1] as u32);
        for i in 0..count {
            let Some(row) = rows.next() else {
                return Err(ParseError::InvalidXref("xref stream truncated".into()));
            };
            let mut fields = [0u64; 3];
            let mut cursor = 0;
            for (f, &w) in fields.iter_mut().zip(&widths) {
                // A zero-width type field defaults to 1 (in use).
                *f = if w == 0 {
                    u64::from(cursor == 0)
                } else {
                    row[cursor..cursor + w]
                        .iter()
                        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
                };
                cursor += w;
            }
            let number = first + i;
            let entry = match fields[0] {
                0 => XrefEntry::Free,
                1 => XrefEntry::InUse {
                    offset: fields[1] as usize,
                    generation: fields[2] as u16,
                },
                2 => XrefEntry::InStream {
                    stream: fields[1] as u32,
                    index: fields[2] as u32,
                },
                other => {
                    return Err(ParseError::InvalidXref(format!(
                        "unknown xref entry type {other}"
                    )))
                }
            };
            table.entries.entry(number).or_insert(entry);
        }
    }
    Ok(table)
}

/// Parses the objects packed inside an object stream (`/Type /ObjStm`).
/// Returns `(id, object)` pairs in stream order.
pub fn parse_object_stream(
    stream: &crate::objects::PdfStream,
) -> ParseResult<Vec<(ObjectId, PdfObject)>> {
    let n = stream
        .dict
        .get("N")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| ParseError::MissingKey("N".to_string()))? as usize;
    let first = stream
        .dict
        .get("First")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| ParseError::MissingKey("First".to_string()))? as usize;

    let decoded = filters::decode_stream(stream)?;
    let mut header = Lexer::new(&decoded);
    let mut pairs = Vec::with_capacity(n);
    for _ in 0..n {
        let number = expect_integer(&mut header)? as u32;
        let offset = expect_integer(&mut header)? as usize;
        pairs.push((number, offset));
    }

    let mut objects = Vec::with_capacity(n);
    for (number, offset) in pairs {
        if first + offset >= decoded.len() {
            return Err(ParseError::InvalidXref("ObjStm offset out of range".into()));
        }
        let mut lexer = Lexer::at(&decoded, first + offset);
        let object = super::object::parse_object(&mut lexer)?;
        objects.push((ObjectId::new(number, 0), object));
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_startxref() {
        let data = b"%PDF-1.4\n...body...\nstartxref\n1234\n%%EOF";
        assert_eq!(find_startxref(data).unwrap(), 1234);
    }

    #[test]
    fn test_classic_table() {
        let data = b"xref\n0 3\n0000000000 65535 f \n0000000017 00000 n \n0000000081 00000 n \ntrailer\n<< /Size 3 /Root 1 0 R >>\n";
        let table = read_xref_chain(data, 0).unwrap();
        assert_eq!(table.get(0), Some(&XrefEntry::Free));
        assert_eq!(
            table.get(1),
            Some(&XrefEntry::InUse {
                offset: 17,
                generation: 0
            })
        );
        assert_eq!(
            table.trailer.get("Size").and_then(|o| o.as_integer()),
            Some(3)
        );
    }

    #[test]
    fn test_missing_startxref() {
        assert!(find_startxref(b"%PDF-1.4 nothing here").is_err());
    }

    #[test]
    fn test_object_stream_roundtrip() {
        // Two objects: "7 0" -> integer 42 at offset 0, "8 0" -> /Name at 3.
        let payload = b"42 /Name";
        let header = b"7 0 8 3 ";
        let mut dict = PdfDictionary::new();
        dict.insert("N", PdfObject::Integer(2));
        dict.insert("First", PdfObject::Integer(header.len() as i64));
        let mut data = header.to_vec();
        data.extend_from_slice(payload);
        let stream = crate::objects::PdfStream::new(dict, data);

        let objects = parse_object_stream(&stream).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].0, ObjectId::new(7, 0));
        assert_eq!(objects[0].1.as_integer(), Some(42));
        assert_eq!(objects[1].1.as_name().unwrap().as_str(), "Name");
    }
}
