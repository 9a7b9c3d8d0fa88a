//! PDF serialization
//!
//! Writes an object arena back out as a complete PDF file: header, body,
//! classic cross-reference table and trailer. Output is deterministic for
//! a given arena (objects in ascending id order, dictionary keys sorted),
//! so identical pipeline results serialize to identical bytes no matter
//! how many workers produced them.

use std::collections::BTreeMap;

use crate::error::{PdfError, Result};
use crate::objects::{ObjectId, PdfDictionary, PdfObject};

/// Serializes `objects` plus trailer entries into a PDF byte image.
/// `trailer` should carry at least `/Root`; `/Size` is computed here.
pub fn write_document(
    objects: &BTreeMap<ObjectId, PdfObject>,
    trailer: &PdfDictionary,
    version: &str,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("%PDF-{version}\n").as_bytes());
    // Binary marker comment so transports treat the file as binary.
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");

    let mut offsets: BTreeMap<u32, (usize, u16)> = BTreeMap::new();
    for (id, object) in objects {
        offsets.insert(id.number, (out.len(), id.generation));
        out.extend_from_slice(format!("{} {} obj\n", id.number, id.generation).as_bytes());
        object.write_to(&mut out);
        out.extend_from_slice(b"\nendobj\n");
    }

    let max_number = offsets.keys().next_back().copied().unwrap_or(0);
    let xref_offset = out.len();
    write_xref_table(&mut out, &offsets, max_number);

    let mut full_trailer = trailer.clone();
    full_trailer.insert("Size", PdfObject::Integer(max_number as i64 + 1));
    if full_trailer.get("Root").is_none() {
        return Err(PdfError::InvalidStructure(
            "cannot write a document without /Root".to_string(),
        ));
    }
    if full_trailer.get("ID").is_none() {
        full_trailer.insert("ID", file_id(&out));
    }
    out.extend_from_slice(b"trailer\n");
    PdfObject::Dictionary(full_trailer).write_to(&mut out);
    out.extend_from_slice(format!("\nstartxref\n{xref_offset}\n%%EOF\n").as_bytes());
    Ok(out)
}

fn write_xref_table(out: &mut Vec<u8>, offsets: &BTreeMap<u32, (usize, u16)>, max_number: u32) {
    out.extend_from_slice(b"xref\n");
    out.extend_from_slice(format!("0 {}\n", max_number + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for number in 1..=max_number {
        match offsets.get(&number) {
            Some((offset, generation)) => {
                out.extend_from_slice(format!("{offset:010} {generation:05} n \n").as_bytes())
            }
            None => out.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }
}

/// Deterministic file identifier derived from the serialized body; two
/// FNV-1a passes with different offsets stand in for the usual digest so
/// the writer needs no hashing dependency.
fn file_id(body: &[u8]) -> PdfObject {
    let h1 = fnv1a(body, 0xcbf29ce484222325);
    let h2 = fnv1a(body, 0x84222325cbf29ce4);
    let id = crate::objects::PdfString::new(
        h1.to_be_bytes()
            .into_iter()
            .chain(h2.to_be_bytes())
            .collect::<Vec<u8>>(),
    );
    let mut array = crate::objects::PdfArray::new();
    array.push(PdfObject::String(id.clone()));
    array.push(PdfObject::String(id));
    PdfObject::Array(array)
}

fn fnv1a(data: &[u8], offset_basis: u64) -> u64 {
    data.iter().fold(offset_basis, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Renumbers the arena so that the objects in `front` (the catalog and
/// the first page's closure, typically) receive the lowest ids and are
/// therefore written first. References everywhere are rewritten. This is
/// the streaming-friendly ordering behind `--fast-web-view`; readers that
/// want hint tables get them from an external linearizer.
pub fn renumber_for_streaming(
    objects: &BTreeMap<ObjectId, PdfObject>,
    trailer: &PdfDictionary,
    front: &[ObjectId],
) -> (BTreeMap<ObjectId, PdfObject>, PdfDictionary) {
    let mut mapping: BTreeMap<ObjectId, ObjectId> = BTreeMap::new();
    let mut next = 1u32;
    for id in front {
        if objects.contains_key(id) && !mapping.contains_key(id) {
            mapping.insert(*id, ObjectId::new(next, 0));
            next += 1;
        }
    }
    for id in objects.keys() {
        if !mapping.contains_key(id) {
            mapping.insert(*id, ObjectId::new(next, 0));
            next += 1;
        }
    }

    let mut renumbered = BTreeMap::new();
    for (id, object) in objects {
        renumbered.insert(mapping[id], rewrite_refs(object, &mapping));
    }
    let rewritten_trailer = match rewrite_refs(&PdfObject::Dictionary(trailer.clone()), &mapping) {
        PdfObject::Dictionary(d) => d,
        _ => unreachable!("dictionary rewrite yields a dictionary"),
    };
    (renumbered, rewritten_trailer)
}

fn rewrite_refs(object: &PdfObject, mapping: &BTreeMap<ObjectId, ObjectId>) -> PdfObject {
    match object {
        PdfObject::Reference(id) => {
            PdfObject::Reference(mapping.get(id).copied().unwrap_or(*id))
        }
        PdfObject::Array(a) => PdfObject::Array(crate::objects::PdfArray(
            a.iter().map(|o| rewrite_refs(o, mapping)).collect(),
        )),
        PdfObject::Dictionary(d) => PdfObject::Dictionary(rewrite_dict(d, mapping)),
        PdfObject::Stream(s) => PdfObject::Stream(crate::objects::PdfStream::new(
            rewrite_dict(&s.dict, mapping),
            s.data.clone(),
        )),
        other => other.clone(),
    }
}

fn rewrite_dict(dict: &PdfDictionary, mapping: &BTreeMap<ObjectId, ObjectId>) -> PdfDictionary {
    let mut out = PdfDictionary::new();
    for (key, value) in dict.iter() {
        out.0.insert(key.clone(), rewrite_refs(value, mapping));
    }
    out
}

/// Fixture builders shared by unit and integration tests.
#[doc(hidden)]
pub mod testing {
    use super::*;
    use crate::objects::{PdfArray, PdfStream, PdfString};

    /// A single-page PDF whose page shows one placed JPEG-less image
    /// XObject; the canonical "scanned page" shape.
    pub fn scanned_page_pdf(pages: usize) -> Vec<u8> {
        build_pdf(pages, |_| PageKind::Scanned)
    }

    /// A minimal valid one-page PDF with an empty content stream.
    pub fn minimal_pdf() -> Vec<u8> {
        build_pdf(1, |_| PageKind::Empty)
    }

    /// A PDF where the selected pages carry a real, ToUnicode-mapped text
    /// layer and the rest are scanned.
    pub fn mixed_pdf(pages: usize, text_pages: &[usize]) -> Vec<u8> {
        let text_pages = text_pages.to_vec();
        build_pdf(pages, move |i| {
            if text_pages.contains(&i) {
                PageKind::Text
            } else {
                PageKind::Scanned
            }
        })
    }

    #[derive(Clone, Copy, PartialEq)]
    pub enum PageKind {
        Empty,
        Scanned,
        Text,
    }

    pub fn build_pdf(pages: usize, kind: impl Fn(usize) -> PageKind) -> Vec<u8> {
        let mut objects: BTreeMap<ObjectId, PdfObject> = BTreeMap::new();
        let mut next = 1u32;
        let mut alloc = || {
            let id = ObjectId::new(next, 0);
            next += 1;
            id
        };

        let catalog_id = alloc();
        let pages_id = alloc();
        let font_id = alloc();

        let mut font = PdfDictionary::new();
        font.insert("Type", PdfObject::name("Font"));
        font.insert("Subtype", PdfObject::name("Type1"));
        font.insert("BaseFont", PdfObject::name("Helvetica"));
        font.insert("Encoding", PdfObject::name("WinAnsiEncoding"));
        objects.insert(font_id, PdfObject::Dictionary(font));

        let mut kids = PdfArray::new();
        for i in 0..pages {
            let page_id = alloc();
            let contents_id = alloc();

            let mut page = PdfDictionary::new();
            page.insert("Type", PdfObject::name("Page"));
            page.insert("Parent", PdfObject::Reference(pages_id));
            let mut mediabox = PdfArray::new();
            for v in [0, 0, 612, 792] {
                mediabox.push(PdfObject::Integer(v));
            }
            page.insert("MediaBox", PdfObject::Array(mediabox));
            page.insert("Contents", PdfObject::Reference(contents_id));

            let mut resources = PdfDictionary::new();
            let content: Vec<u8> = match kind(i) {
                PageKind::Empty => Vec::new(),
                PageKind::Scanned => {
                    let image_id = alloc();
                    let mut image = PdfDictionary::new();
                    image.insert("Type", PdfObject::name("XObject"));
                    image.insert("Subtype", PdfObject::name("Image"));
                    image.insert("Width", PdfObject::Integer(2550));
                    image.insert("Height", PdfObject::Integer(3300));
                    image.insert("ColorSpace", PdfObject::name("DeviceGray"));
                    image.insert("BitsPerComponent", PdfObject::Integer(8));
                    image.insert("Filter", PdfObject::name("DCTDecode"));
                    // A bare JPEG SOI/EOI pair; enough for structure tests.
                    let jpeg = vec![0xFF, 0xD8, 0xFF, 0xD9];
                    image.insert("Length", PdfObject::Integer(jpeg.len() as i64));
                    objects.insert(image_id, PdfObject::Stream(PdfStream::new(image, jpeg)));

                    let mut xobjects = PdfDictionary::new();
                    xobjects.insert("Im0", PdfObject::Reference(image_id));
                    resources.insert("XObject", PdfObject::Dictionary(xobjects));
                    b"q 612 0 0 792 0 0 cm /Im0 Do Q".to_vec()
                }
                PageKind::Text => {
                    let mut fonts = PdfDictionary::new();
                    fonts.insert("F1", PdfObject::Reference(font_id));
                    resources.insert("Font", PdfObject::Dictionary(fonts));
                    b"BT /F1 12 Tf 72 720 Td (Already searchable) Tj ET".to_vec()
                }
            };
            page.insert("Resources", PdfObject::Dictionary(resources));
            objects.insert(page_id, PdfObject::Dictionary(page));

            let mut contents_dict = PdfDictionary::new();
            contents_dict.insert("Length", PdfObject::Integer(content.len() as i64));
            objects.insert(
                contents_id,
                PdfObject::Stream(PdfStream::new(contents_dict, content)),
            );
            kids.push(PdfObject::Reference(page_id));
        }

        let mut pages_dict = PdfDictionary::new();
        pages_dict.insert("Type", PdfObject::name("Pages"));
        pages_dict.insert("Count", PdfObject::Integer(pages as i64));
        pages_dict.insert("Kids", PdfObject::Array(kids));
        objects.insert(pages_id, PdfObject::Dictionary(pages_dict));

        let mut catalog = PdfDictionary::new();
        catalog.insert("Type", PdfObject::name("Catalog"));
        catalog.insert("Pages", PdfObject::Reference(pages_id));
        objects.insert(catalog_id, PdfObject::Dictionary(catalog));

        let mut info = PdfDictionary::new();
        info.insert("Title", PdfObject::String(PdfString::new(b"Fixture".to_vec())));
        let info_id = alloc();
        objects.insert(info_id, PdfObject::Dictionary(info));

        let mut trailer = PdfDictionary::new();
        trailer.insert("Root", PdfObject::Reference(catalog_id));
        trailer.insert("Info", PdfObject::Reference(info_id));
        write_document(&objects, &trailer, "1.7").expect("fixture serialization")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PdfReader;

    #[test]
    fn test_writes_parsable_document() {
        let bytes = testing::minimal_pdf();
        let reader = PdfReader::from_bytes(bytes).unwrap();
        assert_eq!(reader.catalog().unwrap().get_type(), Some("Catalog"));
    }

    #[test]
    fn test_output_is_deterministic() {
        assert_eq!(testing::scanned_page_pdf(3), testing::scanned_page_pdf(3));
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let objects = BTreeMap::new();
        let trailer = PdfDictionary::new();
        assert!(write_document(&objects, &trailer, "1.7").is_err());
    }

    #[test]
    fn test_renumber_preserves_graph() {
        let reader = PdfReader::from_bytes(testing::scanned_page_pdf(2)).unwrap();
        let (_, version, objects, trailer) = reader.into_parts();
        let root = trailer.get("Root").and_then(|r| r.as_reference()).unwrap();
        let (renumbered, new_trailer) = renumber_for_streaming(&objects, &trailer, &[root]);
        let bytes = write_document(&renumbered, &new_trailer, &version).unwrap();

        let reparsed = PdfReader::from_bytes(bytes).unwrap();
        // Catalog moved to object 1 but the graph still resolves.
        let root = reparsed.trailer().get("Root").unwrap().as_reference().unwrap();
        assert_eq!(root.number, 1);
        assert_eq!(reparsed.catalog().unwrap().get_type(), Some("Catalog"));
    }

    #[test]
    fn test_xref_offsets_point_at_objects() {
        let bytes = testing::minimal_pdf();
        let start = crate::parser::xref::find_startxref(&bytes).unwrap();
        let table = crate::parser::xref::read_xref_chain(&bytes, start).unwrap();
        for (&num, entry) in &table.entries {
            if let crate::parser::xref::XrefEntry::InUse { offset, .. } = entry {
                let tail = &bytes[*offset..];
                let header = format!("{num} 0 obj");
                assert!(tail.starts_with(header.as_bytes()), "object {num}");
            }
        }
    }
}
