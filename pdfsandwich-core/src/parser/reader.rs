//! Document reader
//!
//! Turns a PDF byte image into the object arena: signature check, xref
//! chain, indirect object loading, and object-stream expansion. When the
//! cross-reference data is broken the reader falls back to scanning the
//! file for `N G obj` headers, which recovers most scanner-produced
//! damage; a file without a PDF signature is not recovered at all.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use super::lexer::Lexer;
use super::object::parse_indirect_object;
use super::xref::{self, XrefEntry, XrefTable};
use super::{ParseError, ParseResult};
use crate::objects::{ObjectId, PdfDictionary, PdfObject};

/// A fully loaded PDF file: every reachable indirect object materialized
/// into an arena keyed by object id.
#[derive(Debug)]
pub struct PdfReader {
    bytes: Vec<u8>,
    version: String,
    objects: BTreeMap<ObjectId, PdfObject>,
    trailer: PdfDictionary,
}

impl PdfReader {
    pub fn open(path: impl AsRef<Path>) -> ParseResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> ParseResult<Self> {
        let (header_offset, version) = check_signature(&bytes)?;
        if header_offset > 0 {
            debug!(offset = header_offset, "PDF signature preceded by junk bytes");
        }

        let (objects, trailer) = match load_via_xref(&bytes) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "cross-reference data unusable, scanning for objects");
                load_via_scan(&bytes)?
            }
        };

        if trailer.get("Root").is_none() {
            return Err(ParseError::InvalidXref("trailer has no /Root".to_string()));
        }

        Ok(Self {
            bytes,
            version,
            objects,
            trailer,
        })
    }

    /// The original byte image; copy-only pages and the optimizer's size
    /// accounting both need it.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn trailer(&self) -> &PdfDictionary {
        &self.trailer
    }

    pub fn objects(&self) -> &BTreeMap<ObjectId, PdfObject> {
        &self.objects
    }

    pub fn into_parts(self) -> (Vec<u8>, String, BTreeMap<ObjectId, PdfObject>, PdfDictionary) {
        (self.bytes, self.version, self.objects, self.trailer)
    }

    /// Follows a reference to its object; non-references come back as-is.
    pub fn resolve<'a>(&'a self, object: &'a PdfObject) -> &'a PdfObject {
        match object {
            PdfObject::Reference(id) => self.objects.get(id).unwrap_or(&PdfObject::Null),
            other => other,
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&PdfObject> {
        self.objects.get(&id)
    }

    /// The document catalog (`/Root`).
    pub fn catalog(&self) -> ParseResult<&PdfDictionary> {
        let root = self
            .trailer
            .get("Root")
            .ok_or_else(|| ParseError::MissingKey("Root".to_string()))?;
        self.resolve(root)
            .as_dict()
            .ok_or_else(|| ParseError::InvalidXref("/Root is not a dictionary".to_string()))
    }

    /// Whether the trailer carries an `/Encrypt` dictionary.
    pub fn is_encrypted(&self) -> bool {
        self.trailer
            .get("Encrypt")
            .map(|o| !self.resolve(o).is_null())
            .unwrap_or(false)
    }
}

/// Finds `%PDF-` within the first kilobyte (some generators prefix junk)
/// and returns its offset plus the declared version.
fn check_signature(bytes: &[u8]) -> ParseResult<(usize, String)> {
    let window = &bytes[..bytes.len().min(1024)];
    let offset = window
        .windows(5)
        .position(|w| w == b"%PDF-")
        .ok_or(ParseError::NotAPdf)?;
    let rest = &bytes[offset + 5..];
    let end = rest
        .iter()
        .position(|&b| super::lexer::is_whitespace(b))
        .unwrap_or(rest.len().min(8));
    let version = String::from_utf8_lossy(&rest[..end.min(8)]).into_owned();
    Ok((offset, version))
}

type LoadedObjects = (BTreeMap<ObjectId, PdfObject>, PdfDictionary);

fn load_via_xref(bytes: &[u8]) -> ParseResult<LoadedObjects> {
    let start = xref::find_startxref(bytes)?;
    let table = xref::read_xref_chain(bytes, start)?;
    let objects = materialize(bytes, &table)?;
    Ok((objects, table.trailer))
}

/// Loads every in-use object named by the xref table, then expands object
/// streams. `/Length` references are resolved against the same table.
fn materialize(bytes: &[u8], table: &XrefTable) -> ParseResult<BTreeMap<ObjectId, PdfObject>> {
    let resolve_length = |id: ObjectId| -> Option<i64> {
        let XrefEntry::InUse { offset, .. } = table.get(id.number)? else {
            return None;
        };
        let mut lexer = Lexer::at(bytes, *offset);
        parse_indirect_object(&mut lexer, &|_| None)
            .ok()
            .and_then(|(_, obj)| obj.as_integer())
    };

    let mut objects = BTreeMap::new();
    let mut in_stream = Vec::new();
    for (&number, entry) in &table.entries {
        match entry {
            XrefEntry::Free => {}
            XrefEntry::InUse { offset, generation } => {
                if *offset >= bytes.len() {
                    warn!(object = number, offset, "xref offset out of range, skipping");
                    continue;
                }
                let mut lexer = Lexer::at(bytes, *offset);
                match parse_indirect_object(&mut lexer, &resolve_length) {
                    Ok((id, object)) => {
                        // Tolerate ids that disagree with the table as long
                        // as the number matches; generation mismatches are
                        // a routine form of damage.
                        if id.number == number {
                            objects.insert(id, object);
                        } else {
                            warn!(
                                expected = number,
                                found = id.number,
                                "object header disagrees with xref, keeping found id"
                            );
                            objects.insert(id, object);
                        }
                    }
                    Err(err) => {
                        warn!(object = number, generation, error = %err, "unparsable object");
                    }
                }
            }
            XrefEntry::InStream { stream, .. } => in_stream.push((number, *stream)),
        }
    }

    // Expand object streams after direct objects so containers are present.
    let mut expanded: Vec<(ObjectId, PdfObject)> = Vec::new();
    for (number, container) in in_stream {
        let Some(container_obj) = objects.get(&ObjectId::new(container, 0)) else {
            warn!(object = number, container, "object stream missing");
            continue;
        };
        let Some(stream) = container_obj.as_stream() else {
            warn!(container, "ObjStm entry is not a stream");
            continue;
        };
        match xref::parse_object_stream(stream) {
            Ok(members) => {
                expanded.extend(members.into_iter().filter(|(id, _)| id.number == number))
            }
            Err(err) => warn!(container, error = %err, "unparsable object stream"),
        }
    }
    for (id, object) in expanded {
        objects.entry(id).or_insert(object);
    }
    Ok(objects)
}

/// Last-resort loading: scan the whole file for `N G obj` headers. The
/// newest occurrence of each object number wins, mirroring incremental
/// update order. The trailer is taken from the last `trailer` dictionary
/// or, failing that, reconstructed by finding a `/Type /Catalog` object.
fn load_via_scan(bytes: &[u8]) -> ParseResult<LoadedObjects> {
    let mut objects: BTreeMap<ObjectId, PdfObject> = BTreeMap::new();

    let mut pos = 0;
    while let Some(found) = find_from(bytes, b" obj", pos) {
        // Walk back over "N G " before the keyword.
        let header_start = object_header_start(bytes, found);
        if let Some(start) = header_start {
            let mut lexer = Lexer::at(bytes, start);
            if let Ok((id, object)) = parse_indirect_object(&mut lexer, &|_| None) {
                objects.insert(id, object);
                pos = lexer.position();
                continue;
            }
        }
        pos = found + 4;
    }

    if objects.is_empty() {
        return Err(ParseError::InvalidXref(
            "no parsable objects found by scan".to_string(),
        ));
    }

    // Prefer an explicit trailer; otherwise synthesize one around the
    // catalog we can see.
    let mut trailer = PdfDictionary::new();
    let mut tpos = 0;
    while let Some(found) = find_from(bytes, b"trailer", tpos) {
        let mut lexer = Lexer::at(bytes, found + 7);
        if let Ok(super::lexer::Token::DictStart) = lexer.next_token() {
            if let Ok(dict) = super::object::parse_dictionary(&mut lexer) {
                trailer = dict;
            }
        }
        tpos = found + 7;
    }
    if trailer.get("Root").is_none() {
        let catalog = objects.iter().find(|(_, obj)| {
            obj.as_dict()
                .map(|d| d.get_type() == Some("Catalog"))
                .unwrap_or(false)
        });
        if let Some((&id, _)) = catalog {
            trailer.insert("Root", PdfObject::Reference(id));
        }
    }
    trailer.insert("Size", PdfObject::Integer(objects.len() as i64 + 1));
    Ok((objects, trailer))
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Given the offset of `" obj"`, walks backwards over the generation and
/// object numbers to the start of the header. Returns `None` when the
/// preceding bytes are not two integers.
fn object_header_start(bytes: &[u8], obj_at: usize) -> Option<usize> {
    let mut i = obj_at;
    for _ in 0..2 {
        while i > 0 && bytes[i - 1] == b' ' {
            i -= 1;
        }
        let digits_end = i;
        while i > 0 && bytes[i - 1].is_ascii_digit() {
            i -= 1;
        }
        if i == digits_end {
            return None;
        }
    }
    Some(i)
}
