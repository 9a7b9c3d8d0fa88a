//! Document model
//!
//! A [`Document`] is the pipeline's handle on one opened PDF: the original
//! byte image, the object arena, the ordered page list and the aggregated
//! metadata. Pages are identified by 1-based index for the whole run;
//! rotation and cropping are expressed as matrices downstream, never by
//! renumbering.
//!
//! Mutation discipline: workers get read-only access; every change flows
//! through the assembler's single writer, which replaces page object
//! closures wholesale (copy-on-write at page granularity).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::warn;

use crate::analysis::PageAnalysis;
use crate::error::{SandwichError, SandwichResult};
use crate::geometry::{Point, Rectangle};
use crate::objects::{ObjectId, PdfDictionary, PdfObject};
use crate::parser::{filters, PdfReader};
use crate::policy::PageAction;

/// Id range reserved for each page's grafted objects, so id allocation is
/// a pure function of page index and output bytes do not depend on worker
/// scheduling.
pub const PAGE_ID_STRIDE: u32 = 16;

/// Aggregated document-level metadata from the `/Info` dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub language: Option<String>,
}

/// The grafted replacement for one page: the objects to install in the
/// output arena (page dictionary plus its new dependents), the plain OCR
/// text for the sidecar, and whether the visible raster was replaced.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub objects: Vec<(ObjectId, PdfObject)>,
    pub ocr_text_plain: String,
    pub replaced_image: bool,
}

/// One page, tracked by stable 1-based index across all pipeline stages.
#[derive(Debug, Clone)]
pub struct PageHandle {
    pub index: usize,
    pub object_id: ObjectId,
    pub analysis: Option<PageAnalysis>,
    pub action: Option<PageAction>,
    pub result: Option<PageResult>,
}

/// An opened, parsed PDF document.
#[derive(Debug)]
pub struct Document {
    bytes: Vec<u8>,
    version: String,
    objects: BTreeMap<ObjectId, PdfObject>,
    trailer: PdfDictionary,
    page_ids: Vec<ObjectId>,
    metadata: DocumentMetadata,
    encrypted: bool,
    signed: bool,
    acroform: bool,
    xfa_dynamic: bool,
}

impl Document {
    pub fn open(path: impl AsRef<Path>) -> SandwichResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> SandwichResult<Self> {
        let reader = PdfReader::from_bytes(bytes).map_err(|e| match e {
            crate::parser::ParseError::NotAPdf => {
                SandwichError::InputNotPdf("missing %PDF signature".to_string())
            }
            other => SandwichError::InputNotPdf(other.to_string()),
        })?;

        let encrypted = reader.is_encrypted();
        let (bytes, version, objects, trailer) = reader.into_parts();

        let mut doc = Self {
            bytes,
            version,
            objects,
            trailer,
            page_ids: Vec::new(),
            metadata: DocumentMetadata::default(),
            encrypted,
            signed: false,
            acroform: false,
            xfa_dynamic: false,
        };
        doc.page_ids = doc.collect_page_ids()?;
        doc.metadata = doc.read_metadata();
        doc.inspect_forms();
        Ok(doc)
    }

    /// Fresh [`PageHandle`]s for every page, in index order.
    pub fn page_handles(&self) -> Vec<PageHandle> {
        self.page_ids
            .iter()
            .enumerate()
            .map(|(i, &object_id)| PageHandle {
                index: i + 1,
                object_id,
                analysis: None,
                action: None,
                result: None,
            })
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    pub fn page_id(&self, index: usize) -> Option<ObjectId> {
        self.page_ids.get(index.checked_sub(1)?).copied()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn objects(&self) -> &BTreeMap<ObjectId, PdfObject> {
        &self.objects
    }

    pub fn trailer(&self) -> &PdfDictionary {
        &self.trailer
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn has_acroform(&self) -> bool {
        self.acroform
    }

    pub fn has_dynamic_xfa(&self) -> bool {
        self.xfa_dynamic
    }

    /// Highest allocated object number; grafted pages allocate above this.
    pub fn max_object_number(&self) -> u32 {
        self.objects.keys().next_back().map(|id| id.number).unwrap_or(0)
    }

    /// The first object id reserved for page `index`'s grafted objects.
    pub fn graft_id_base(&self, index: usize) -> u32 {
        self.max_object_number() + 1 + (index as u32 - 1) * PAGE_ID_STRIDE
    }

    pub fn resolve<'a>(&'a self, object: &'a PdfObject) -> &'a PdfObject {
        match object {
            PdfObject::Reference(id) => self.objects.get(id).unwrap_or(&PdfObject::Null),
            other => other,
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&PdfObject> {
        self.objects.get(&id)
    }

    pub fn catalog(&self) -> SandwichResult<&PdfDictionary> {
        let root = self
            .trailer
            .get("Root")
            .ok_or_else(|| SandwichError::InputNotPdf("trailer has no /Root".to_string()))?;
        self.resolve(root)
            .as_dict()
            .ok_or_else(|| SandwichError::InputNotPdf("/Root is not a dictionary".to_string()))
    }

    pub fn page_dict(&self, index: usize) -> Option<&PdfDictionary> {
        let id = self.page_id(index)?;
        self.objects.get(&id)?.as_dict()
    }

    /// A page attribute, honoring page-tree inheritance (`/Resources`,
    /// `/MediaBox`, `/Rotate`, `/CropBox`).
    pub fn page_attr(&self, index: usize, key: &str) -> Option<&PdfObject> {
        let mut current = self.page_id(index)?;
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(current) {
                return None;
            }
            let dict = self.objects.get(&current)?.as_dict()?;
            if let Some(value) = dict.get(key) {
                return Some(value);
            }
            current = dict.get("Parent")?.as_reference()?;
        }
    }

    /// Page media box; letter-sized fallback when absent, which mirrors
    /// what viewers do with such files.
    pub fn mediabox(&self, index: usize) -> Rectangle {
        self.page_attr(index, "MediaBox")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_array())
            .and_then(|a| a.as_rectangle())
            .unwrap_or_else(|| Rectangle::new(Point::origin(), Point::new(612.0, 792.0)))
    }

    /// Page rotation normalized into {0, 90, 180, 270}.
    pub fn rotation(&self, index: usize) -> i32 {
        let raw = self
            .page_attr(index, "Rotate")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_integer())
            .unwrap_or(0);
        (raw.rem_euclid(360) / 90 * 90) as i32
    }

    /// Effective resource dictionary (inherited when the page has none).
    pub fn resources(&self, index: usize) -> PdfDictionary {
        self.page_attr(index, "Resources")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_dict())
            .cloned()
            .unwrap_or_default()
    }

    /// All content streams of a page, decoded and concatenated in order.
    pub fn content_bytes(&self, index: usize) -> SandwichResult<Vec<u8>> {
        let mut out = Vec::new();
        for stream in self.content_streams(index) {
            match filters::decode_stream(&stream) {
                Ok(mut data) => {
                    if !out.is_empty() {
                        out.push(b'\n');
                    }
                    out.append(&mut data);
                }
                Err(err) => {
                    warn!(page = index, error = %err, "undecodable content stream");
                }
            }
        }
        Ok(out)
    }

    /// The raw (still encoded) content stream payloads of a page; the
    /// copy-only invariant is checked on these bytes.
    pub fn raw_content_bytes(&self, index: usize) -> Vec<Vec<u8>> {
        self.content_streams(index)
            .iter()
            .map(|s| s.raw_data().to_vec())
            .collect()
    }

    fn content_streams(&self, index: usize) -> Vec<crate::objects::PdfStream> {
        let Some(dict) = self.page_dict(index) else {
            return Vec::new();
        };
        let Some(contents) = dict.get("Contents") else {
            return Vec::new();
        };
        match self.resolve(contents) {
            PdfObject::Stream(s) => vec![s.clone()],
            PdfObject::Array(a) => a
                .iter()
                .filter_map(|o| self.resolve(o).as_stream().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn collect_page_ids(&self) -> SandwichResult<Vec<ObjectId>> {
        let catalog = self.catalog()?;
        let Some(pages_ref) = catalog.get("Pages") else {
            return Err(SandwichError::InputNotPdf(
                "catalog has no /Pages".to_string(),
            ));
        };
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let root_id = pages_ref.as_reference();
        if let Some(id) = root_id {
            self.walk_page_tree(id, &mut visited, &mut out);
        }
        if out.is_empty() {
            return Err(SandwichError::InputNotPdf("document has no pages".to_string()));
        }
        Ok(out)
    }

    fn walk_page_tree(
        &self,
        node_id: ObjectId,
        visited: &mut HashSet<ObjectId>,
        out: &mut Vec<ObjectId>,
    ) {
        if !visited.insert(node_id) {
            warn!(node = %node_id, "cycle in page tree");
            return;
        }
        let Some(dict) = self.objects.get(&node_id).and_then(PdfObject::as_dict) else {
            return;
        };
        match dict.get_type() {
            Some("Pages") => {
                if let Some(kids) = dict.get("Kids").map(|o| self.resolve(o)) {
                    if let Some(kids) = kids.as_array() {
                        for kid in kids.iter() {
                            if let Some(id) = kid.as_reference() {
                                self.walk_page_tree(id, visited, out);
                            }
                        }
                    }
                }
            }
            // Type-less nodes holding /Contents are treated as pages;
            // damaged files drop /Type more often than structure.
            Some("Page") => out.push(node_id),
            None if dict.contains_key("Contents") => out.push(node_id),
            _ => {}
        }
    }

    fn read_metadata(&self) -> DocumentMetadata {
        let mut meta = DocumentMetadata::default();
        let Some(info) = self
            .trailer
            .get("Info")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_dict())
        else {
            return meta;
        };
        let text = |key: &str| {
            info.get(key)
                .map(|o| self.resolve(o))
                .and_then(|o| o.as_string())
                .map(|s| s.to_text())
        };
        meta.title = text("Title");
        meta.author = text("Author");
        meta.subject = text("Subject");
        meta.keywords = text("Keywords");
        meta.creator = text("Creator");
        meta.producer = text("Producer");
        meta.creation_date = text("CreationDate");
        meta.modification_date = text("ModDate");
        meta.language = self
            .catalog()
            .ok()
            .and_then(|c| c.get("Lang").map(|o| self.resolve(o)))
            .and_then(|o| o.as_string())
            .map(|s| s.to_text());
        meta
    }

    /// AcroForm, signature and XFA detection. Signed means at least one
    /// signature field carries a value; XFA is dynamic when its packet
    /// stream contains event scripting.
    fn inspect_forms(&mut self) {
        let Some(acroform) = self
            .catalog()
            .ok()
            .and_then(|catalog| catalog.get("AcroForm"))
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_dict())
            .cloned()
        else {
            return;
        };

        let sig_flags = acroform
            .get("SigFlags")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_integer())
            .unwrap_or(0);
        let signed = sig_flags & 1 != 0 && self.any_signed_field(&acroform);
        let xfa_dynamic = acroform
            .get("XFA")
            .map(|xfa| self.xfa_has_events(self.resolve(xfa)))
            .unwrap_or(false);

        self.acroform = true;
        self.signed = signed;
        self.xfa_dynamic = xfa_dynamic;
    }

    fn any_signed_field(&self, acroform: &PdfDictionary) -> bool {
        let Some(fields) = acroform
            .get("Fields")
            .map(|o| self.resolve(o))
            .and_then(|o| o.as_array())
        else {
            return false;
        };
        fields.iter().any(|f| {
            self.resolve(f)
                .as_dict()
                .map(|d| {
                    d.get("FT").and_then(|o| o.as_name()).map(|n| n.as_str()) == Some("Sig")
                        && d.contains_key("V")
                })
                .unwrap_or(false)
        })
    }

    fn xfa_has_events(&self, xfa: &PdfObject) -> bool {
        let streams: Vec<&crate::objects::PdfStream> = match xfa {
            PdfObject::Stream(s) => vec![s],
            PdfObject::Array(a) => a
                .iter()
                .filter_map(|o| self.resolve(o).as_stream())
                .collect(),
            _ => return false,
        };
        streams.iter().any(|s| {
            filters::decode_stream(s)
                .map(|data| {
                    data.windows(6).any(|w| w == b"<event")
                        || data.windows(7).any(|w| w == b"<script")
                })
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::testing::{minimal_pdf, mixed_pdf, scanned_page_pdf};

    #[test]
    fn test_open_counts_pages() {
        let doc = Document::from_bytes(scanned_page_pdf(3)).unwrap();
        assert_eq!(doc.page_count(), 3);
        let handles = doc.page_handles();
        assert_eq!(handles[0].index, 1);
        assert_eq!(handles[2].index, 3);
    }

    #[test]
    fn test_rejects_non_pdf_bytes() {
        let err = Document::from_bytes(b"plain text".to_vec()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_mediabox_and_rotation_defaults() {
        let doc = Document::from_bytes(minimal_pdf()).unwrap();
        let mb = doc.mediabox(1);
        assert_eq!(mb.width(), 612.0);
        assert_eq!(mb.height(), 792.0);
        assert_eq!(doc.rotation(1), 0);
    }

    #[test]
    fn test_content_bytes_decodes_streams() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let content = doc.content_bytes(1).unwrap();
        assert!(content.windows(3).any(|w| w == b"/Im"));
    }

    #[test]
    fn test_metadata_title() {
        let doc = Document::from_bytes(minimal_pdf()).unwrap();
        assert_eq!(doc.metadata().title.as_deref(), Some("Fixture"));
    }

    #[test]
    fn test_resources_lookup() {
        let doc = Document::from_bytes(mixed_pdf(2, &[0])).unwrap();
        assert!(doc.resources(1).contains_key("Font"));
        assert!(doc.resources(2).contains_key("XObject"));
    }

    #[test]
    fn test_graft_id_bases_do_not_collide() {
        let doc = Document::from_bytes(scanned_page_pdf(4)).unwrap();
        let bases: Vec<u32> = (1..=4).map(|i| doc.graft_id_base(i)).collect();
        for pair in bases.windows(2) {
            assert!(pair[1] - pair[0] == PAGE_ID_STRIDE);
        }
        assert!(bases[0] > doc.max_object_number());
    }
}
