//! PDF object model
//!
//! One object representation shared by the parser, the grafter and the
//! writer. Documents hold their objects in an arena keyed by [`ObjectId`];
//! edges between objects are ids, never owning references, so the cyclic
//! graphs real PDFs contain (page -> parent -> kids -> page) need no special
//! treatment beyond a visited set when walking.
//!
//! Dictionaries are ordered maps so that re-serializing an untouched object
//! is deterministic; output bytes must not depend on worker scheduling.

use std::collections::BTreeMap;
use std::fmt;

/// Object number and generation, the identity of an indirect object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub number: u32,
    pub generation: u16,
}

impl ObjectId {
    pub fn new(number: u32, generation: u16) -> Self {
        Self { number, generation }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R", self.number, self.generation)
    }
}

/// PDF Name object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdfName(pub String);

impl PdfName {
    pub fn new(name: impl Into<String>) -> Self {
        PdfName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// PDF String object (byte string; not necessarily UTF-8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfString(pub Vec<u8>);

impl PdfString {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        PdfString(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes per PDF text-string rules: UTF-16BE when BOM-prefixed,
    /// PDFDocEncoding approximated as Latin-1 otherwise.
    pub fn to_text(&self) -> String {
        let b = &self.0;
        if b.len() >= 2 && b[0] == 0xFE && b[1] == 0xFF {
            let units: Vec<u16> = b[2..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            b.iter().map(|&c| c as char).collect()
        }
    }
}

/// PDF Array object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfArray(pub Vec<PdfObject>);

impl PdfArray {
    pub fn new() -> Self {
        PdfArray(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PdfObject> {
        self.0.get(index)
    }

    pub fn push(&mut self, obj: PdfObject) {
        self.0.push(obj);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PdfObject> {
        self.0.iter()
    }

    /// Interprets the array as a PDF rectangle `[llx lly urx ury]`.
    pub fn as_rectangle(&self) -> Option<crate::geometry::Rectangle> {
        if self.len() != 4 {
            return None;
        }
        let mut coords = [0.0; 4];
        for (i, c) in coords.iter_mut().enumerate() {
            *c = self.get(i)?.as_real()?;
        }
        // Normalize so lower-left really is lower-left.
        let (llx, urx) = (coords[0].min(coords[2]), coords[0].max(coords[2]));
        let (lly, ury) = (coords[1].min(coords[3]), coords[1].max(coords[3]));
        Some(crate::geometry::Rectangle::new(
            crate::geometry::Point::new(llx, lly),
            crate::geometry::Point::new(urx, ury),
        ))
    }
}

/// PDF Dictionary object. Keys are kept sorted; PDF readers treat
/// dictionaries as unordered, and a sorted map makes serialization
/// reproducible.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfDictionary(pub BTreeMap<PdfName, PdfObject>);

impl PdfDictionary {
    pub fn new() -> Self {
        PdfDictionary(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&PdfObject> {
        self.0.get(&PdfName(key.to_string()))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PdfObject) {
        self.0.insert(PdfName(key.into()), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<PdfObject> {
        self.0.remove(&PdfName(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&PdfName(key.to_string()))
    }

    /// The value of the `/Type` key, if present and a name.
    pub fn get_type(&self) -> Option<&str> {
        self.get("Type").and_then(|obj| obj.as_name()).map(|n| n.as_str())
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, PdfName, PdfObject> {
        self.0.iter()
    }
}

/// PDF Stream object: a dictionary plus raw (still encoded) data.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfStream {
    pub dict: PdfDictionary,
    pub data: Vec<u8>,
}

impl PdfStream {
    pub fn new(dict: PdfDictionary, data: Vec<u8>) -> Self {
        Self { dict, data }
    }

    /// The raw, still-encoded stream bytes.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// The `/Filter` entry as a list of filter names (a single name is
    /// treated as a one-element list).
    pub fn filters(&self) -> Vec<String> {
        match self.dict.get("Filter") {
            Some(PdfObject::Name(n)) => vec![n.as_str().to_string()],
            Some(PdfObject::Array(a)) => a
                .iter()
                .filter_map(|o| o.as_name().map(|n| n.as_str().to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// PDF Object types
#[derive(Debug, Clone, PartialEq)]
pub enum PdfObject {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(PdfString),
    Name(PdfName),
    Array(PdfArray),
    Dictionary(PdfDictionary),
    Stream(PdfStream),
    Reference(ObjectId),
}

impl PdfObject {
    pub fn reference(number: u32, generation: u16) -> Self {
        PdfObject::Reference(ObjectId::new(number, generation))
    }

    pub fn name(name: impl Into<String>) -> Self {
        PdfObject::Name(PdfName::new(name))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PdfObject::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PdfObject::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PdfObject::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            PdfObject::Real(r) => Some(*r),
            PdfObject::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&PdfString> {
        match self {
            PdfObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&PdfName> {
        match self {
            PdfObject::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&PdfArray> {
        match self {
            PdfObject::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Dictionaries and stream dictionaries both answer here; most walks do
    /// not care which one they landed on.
    pub fn as_dict(&self) -> Option<&PdfDictionary> {
        match self {
            PdfObject::Dictionary(d) => Some(d),
            PdfObject::Stream(s) => Some(&s.dict),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut PdfDictionary> {
        match self {
            PdfObject::Dictionary(d) => Some(d),
            PdfObject::Stream(s) => Some(&mut s.dict),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&PdfStream> {
        match self {
            PdfObject::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            PdfObject::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// Serializes this object into `out` in PDF syntax. Indirect object
    /// wrappers (`N G obj ... endobj`) are the writer's concern.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            PdfObject::Null => out.extend_from_slice(b"null"),
            PdfObject::Boolean(true) => out.extend_from_slice(b"true"),
            PdfObject::Boolean(false) => out.extend_from_slice(b"false"),
            PdfObject::Integer(i) => out.extend_from_slice(i.to_string().as_bytes()),
            PdfObject::Real(r) => {
                out.extend_from_slice(crate::geometry::fmt_coord(*r).as_bytes())
            }
            PdfObject::String(s) => write_literal_string(&s.0, out),
            PdfObject::Name(n) => write_name(n.as_str(), out),
            PdfObject::Array(a) => {
                out.push(b'[');
                for (i, obj) in a.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    obj.write_to(out);
                }
                out.push(b']');
            }
            PdfObject::Dictionary(d) => write_dictionary(d, out),
            PdfObject::Stream(s) => {
                write_dictionary(&s.dict, out);
                out.extend_from_slice(b"\nstream\n");
                out.extend_from_slice(&s.data);
                out.extend_from_slice(b"\nendstream");
            }
            PdfObject::Reference(id) => {
                out.extend_from_slice(format!("{id}").as_bytes());
            }
        }
    }
}

fn write_dictionary(dict: &PdfDictionary, out: &mut Vec<u8>) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        out.push(b' ');
        write_name(key.as_str(), out);
        out.push(b' ');
        value.write_to(out);
    }
    out.extend_from_slice(b" >>");
}

/// Names escape delimiters, whitespace and `#` itself as `#xx`.
fn write_name(name: &str, out: &mut Vec<u8>) {
    out.push(b'/');
    for &b in name.as_bytes() {
        let is_regular = !matches!(
            b,
            0..=32 | b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%' | b'#'
        ) && b < 127;
        if is_regular {
            out.push(b);
        } else {
            out.extend_from_slice(format!("#{b:02X}").as_bytes());
        }
    }
}

fn write_literal_string(data: &[u8], out: &mut Vec<u8>) {
    // Binary-heavy strings serialize smaller and safer as hex.
    let binary = data.iter().filter(|&&b| !(32..127).contains(&b)).count();
    if binary * 4 > data.len() {
        out.push(b'<');
        for b in data {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
        out.push(b'>');
        return;
    }
    out.push(b'(');
    for &b in data {
        match b {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0..=8 | 11 | 12 | 14..=31 | 127..=255 => {
                out.extend_from_slice(format!("\\{b:03o}").as_bytes())
            }
            _ => out.push(b),
        }
    }
    out.push(b')');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialized(obj: &PdfObject) -> String {
        let mut out = Vec::new();
        obj.write_to(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_scalar_serialization() {
        assert_eq!(serialized(&PdfObject::Null), "null");
        assert_eq!(serialized(&PdfObject::Boolean(true)), "true");
        assert_eq!(serialized(&PdfObject::Integer(-42)), "-42");
        assert_eq!(serialized(&PdfObject::Real(3.5)), "3.5");
        assert_eq!(serialized(&PdfObject::reference(7, 0)), "7 0 R");
    }

    #[test]
    fn test_name_escaping() {
        assert_eq!(serialized(&PdfObject::name("Type")), "/Type");
        assert_eq!(serialized(&PdfObject::name("A B")), "/A#20B");
        assert_eq!(serialized(&PdfObject::name("F#1")), "/F#231");
    }

    #[test]
    fn test_string_escaping() {
        let s = PdfObject::String(PdfString::new(b"a(b)c\\".to_vec()));
        assert_eq!(serialized(&s), "(a\\(b\\)c\\\\)");
    }

    #[test]
    fn test_binary_string_uses_hex() {
        let s = PdfObject::String(PdfString::new(vec![0xFE, 0xFF, 0x00, 0x41]));
        assert_eq!(serialized(&s), "<FEFF0041>");
    }

    #[test]
    fn test_dictionary_serialization_is_key_sorted() {
        let mut dict = PdfDictionary::new();
        dict.insert("Zebra", PdfObject::Integer(1));
        dict.insert("Alpha", PdfObject::Integer(2));
        assert_eq!(
            serialized(&PdfObject::Dictionary(dict)),
            "<< /Alpha 2 /Zebra 1 >>"
        );
    }

    #[test]
    fn test_rectangle_normalizes_corners() {
        let mut arr = PdfArray::new();
        for v in [612, 792, 0, 0] {
            arr.push(PdfObject::Integer(v));
        }
        let rect = arr.as_rectangle().unwrap();
        assert_eq!(rect.lower_left.x, 0.0);
        assert_eq!(rect.upper_right.y, 792.0);
    }

    #[test]
    fn test_text_string_utf16() {
        let s = PdfString::new(vec![0xFE, 0xFF, 0x00, b'H', 0x00, b'i']);
        assert_eq!(s.to_text(), "Hi");
    }

    #[test]
    fn test_stream_filters_single_and_array() {
        let mut dict = PdfDictionary::new();
        dict.insert("Filter", PdfObject::name("FlateDecode"));
        let stream = PdfStream::new(dict, vec![]);
        assert_eq!(stream.filters(), vec!["FlateDecode"]);

        let mut dict = PdfDictionary::new();
        let mut arr = PdfArray::new();
        arr.push(PdfObject::name("ASCIIHexDecode"));
        arr.push(PdfObject::name("FlateDecode"));
        dict.insert("Filter", PdfObject::Array(arr));
        let stream = PdfStream::new(dict, vec![]);
        assert_eq!(stream.filters(), vec!["ASCIIHexDecode", "FlateDecode"]);
    }
}
