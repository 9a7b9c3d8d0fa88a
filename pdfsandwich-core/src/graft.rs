//! Text-layer grafting
//!
//! Attaches a rendered invisible text layer (and, when preprocessing
//! produced one, a replacement page raster) to the original page object
//! without disturbing anything else on it. Annotations, bookmarks and the
//! rest of the page dictionary ride along untouched; only `/Contents`,
//! `/Resources` and `/Rotate` are rewritten, and the original content
//! stream objects are kept byte-identical by sandwiching them between a
//! new prefix and suffix stream instead of editing them.

use crate::document::{Document, PageResult};
use crate::error::{PdfError, Result};
use crate::geometry::Matrix;
use crate::objects::{ObjectId, PdfArray, PdfDictionary, PdfObject, PdfStream};
use crate::parser::content::{ContentOp, ContentParser, OperatorClass};
use crate::textlayer::TextLayer;

/// Offsets within a page's reserved id range (`Document::graft_id_base`).
/// The renderer's four font objects occupy 0..=3.
const PREFIX_STREAM_SLOT: u32 = 4;
const SUFFIX_STREAM_SLOT: u32 = 5;
const REPLACEMENT_IMAGE_SLOT: u32 = 6;
const REWRITTEN_CONTENT_SLOT: u32 = 7;

/// A preprocessed page raster that replaces the page's visible content.
#[derive(Debug, Clone)]
pub struct ReplacementImage {
    pub width_px: u32,
    pub height_px: u32,
    /// Already-encoded stream payload.
    pub data: Vec<u8>,
    /// The `/Filter` name matching `data` (e.g. `DCTDecode`), or `None`
    /// for raw samples.
    pub filter: Option<String>,
    /// `DeviceGray` or `DeviceRGB`.
    pub colorspace: String,
    pub bits_per_component: u8,
}

pub struct Grafter<'a> {
    document: &'a Document,
}

impl<'a> Grafter<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    /// A font resource name unused by the page's existing resources. The
    /// pipeline asks for this before rendering so the emitted `Tf`
    /// operators and the merged resource dictionary agree.
    pub fn unique_font_name(&self, page_index: usize) -> String {
        let resources = self.document.resources(page_index);
        let taken: Vec<String> = resources
            .get("Font")
            .map(|o| self.document.resolve(o))
            .and_then(|o| o.as_dict())
            .map(|fonts| fonts.iter().map(|(k, _)| k.as_str().to_string()).collect())
            .unwrap_or_default();
        unique_name("F-OCR", &taken)
    }

    /// Grafts `layer` onto page `page_index`. `stripped_content` replaces
    /// the original streams when the redo-ocr path removed a previous
    /// text layer; `replacement` swaps the visible content for a cleaned
    /// raster.
    pub fn graft(
        &self,
        page_index: usize,
        layer: &TextLayer,
        replacement: Option<&ReplacementImage>,
        stripped_content: Option<Vec<u8>>,
        ocr_text_plain: String,
    ) -> Result<PageResult> {
        let page_id = self
            .document
            .page_id(page_index)
            .ok_or(PdfError::InvalidPageNumber(page_index as u32))?;
        let original = self
            .document
            .page_dict(page_index)
            .ok_or(PdfError::InvalidPageNumber(page_index as u32))?
            .clone();

        let base = self.document.graft_id_base(page_index);
        let mediabox = self.document.mediabox(page_index);
        let rotation = self.document.rotation(page_index);

        let mut page = original.clone();
        let mut objects: Vec<(ObjectId, PdfObject)> = layer.font_objects.clone();

        // Fold /Rotate into the content so the text layer's coordinates
        // match the displayed orientation and the output page reads
        // /Rotate 0.
        let fold = if rotation != 0 {
            page.insert("Rotate", PdfObject::Integer(0));
            if rotation == 90 || rotation == 270 {
                let mut swapped = PdfArray::new();
                for v in [
                    mediabox.lower_left.y,
                    mediabox.lower_left.x,
                    mediabox.upper_right.y,
                    mediabox.upper_right.x,
                ] {
                    swapped.push(PdfObject::Real(v));
                }
                page.insert("MediaBox", PdfObject::Array(swapped));
                page.remove("CropBox");
            }
            Some(Matrix::for_page_rotation(
                rotation,
                mediabox.width(),
                mediabox.height(),
            ))
        } else {
            None
        };

        let mut resources = self.document.resources(page_index);
        let display_width = if rotation == 90 || rotation == 270 {
            mediabox.height()
        } else {
            mediabox.width()
        };
        let display_height = if rotation == 90 || rotation == 270 {
            mediabox.width()
        } else {
            mediabox.height()
        };

        let contents = match (replacement, stripped_content) {
            (Some(image), _) => {
                // Fresh content: the cleaned raster fills the page, the
                // text layer sits on top. The original streams drop out;
                // the page dictionary (annotations included) survives.
                let image_id = ObjectId::new(base + REPLACEMENT_IMAGE_SLOT, 0);
                objects.push((image_id, image_xobject(image)));

                let image_name = {
                    let taken = xobject_names(&resources, self.document);
                    unique_name("Im-OCR", &taken)
                };
                insert_resource(&mut resources, "XObject", &image_name, image_id);

                let mut content = Vec::new();
                content.extend_from_slice(b"q\n");
                content.extend_from_slice(
                    format!(
                        "{} 0 0 {} 0 0 cm /{image_name} Do\n",
                        crate::geometry::fmt_coord(display_width),
                        crate::geometry::fmt_coord(display_height),
                    )
                    .as_bytes(),
                );
                content.extend_from_slice(b"Q\n");
                content.extend_from_slice(&layer.content);

                let content_id = ObjectId::new(base + REWRITTEN_CONTENT_SLOT, 0);
                objects.push((content_id, content_stream(content)));
                PdfObject::Reference(content_id)
            }
            (None, Some(stripped)) => {
                // Redo path: the page's own streams are replaced by the
                // stripped copy, then the new layer is appended.
                let mut content = Vec::new();
                content.extend_from_slice(b"q\n");
                if let Some(m) = fold {
                    content
                        .extend_from_slice(format!("{} cm\n", m.to_operands()).as_bytes());
                }
                content.extend_from_slice(&stripped);
                content.extend_from_slice(b"\nQ\n");
                content.extend_from_slice(&layer.content);

                let content_id = ObjectId::new(base + REWRITTEN_CONTENT_SLOT, 0);
                objects.push((content_id, content_stream(content)));
                PdfObject::Reference(content_id)
            }
            (None, None) => {
                // Plain graft: sandwich the untouched original streams.
                let mut prefix = b"q\n".to_vec();
                if let Some(m) = fold {
                    prefix.extend_from_slice(format!("{} cm\n", m.to_operands()).as_bytes());
                }
                let mut suffix = b"\nQ\n".to_vec();
                suffix.extend_from_slice(&layer.content);

                let prefix_id = ObjectId::new(base + PREFIX_STREAM_SLOT, 0);
                let suffix_id = ObjectId::new(base + SUFFIX_STREAM_SLOT, 0);
                objects.push((prefix_id, content_stream(prefix)));
                objects.push((suffix_id, content_stream(suffix)));

                let mut array = PdfArray::new();
                array.push(PdfObject::Reference(prefix_id));
                match original.get("Contents") {
                    Some(PdfObject::Array(a)) => {
                        for item in a.iter() {
                            array.push(item.clone());
                        }
                    }
                    Some(other) => array.push(other.clone()),
                    None => {}
                }
                array.push(PdfObject::Reference(suffix_id));
                PdfObject::Array(array)
            }
        };
        page.insert("Contents", contents);

        insert_resource(&mut resources, "Font", &layer.font_name, layer.font_id);
        page.insert("Resources", PdfObject::Dictionary(resources));

        objects.push((page_id, PdfObject::Dictionary(page)));
        Ok(PageResult {
            objects,
            ocr_text_plain,
            replaced_image: replacement.is_some(),
        })
    }
}

/// Removes previously grafted invisible text (render mode 3 inside
/// BT..ET) from a content stream; everything else is re-serialized
/// verbatim. Feeds the redo-ocr path.
pub fn strip_invisible_text(content: &[u8]) -> Result<Vec<u8>> {
    let ops = ContentParser::parse(content).map_err(PdfError::from)?;

    let mut kept: Vec<ContentOp> = Vec::new();
    let mut block: Vec<ContentOp> = Vec::new();
    let mut in_text = false;
    let mut invisible = false;

    for op in ops {
        match op.operator.as_str() {
            "BT" => {
                in_text = true;
                invisible = false;
                block.clear();
                block.push(op);
            }
            "ET" if in_text => {
                block.push(op);
                if !invisible {
                    kept.append(&mut block);
                } else {
                    block.clear();
                }
                in_text = false;
            }
            "Tr" if in_text => {
                if op.operands.first().and_then(|o| o.as_integer()) == Some(3) {
                    invisible = true;
                }
                block.push(op);
            }
            _ => {
                if in_text {
                    block.push(op);
                } else {
                    kept.push(op);
                }
            }
        }
    }
    // An unterminated text block is kept as-is rather than dropped.
    kept.append(&mut block);
    Ok(ContentParser::serialize(&kept))
}

/// Removes every text-showing block, leaving only graphics; rasterizing
/// the result gives the redo-ocr engine an image with the existing
/// visible text masked out.
pub fn mask_all_text(content: &[u8]) -> Result<Vec<u8>> {
    let ops = ContentParser::parse(content).map_err(PdfError::from)?;
    let mut kept: Vec<ContentOp> = Vec::new();
    let mut in_text = false;
    for op in ops {
        match op.operator.as_str() {
            "BT" => in_text = true,
            "ET" => in_text = false,
            _ if in_text => {}
            _ => {
                if op.class() != OperatorClass::TextShow {
                    kept.push(op);
                }
            }
        }
    }
    Ok(ContentParser::serialize(&kept))
}

fn content_stream(data: Vec<u8>) -> PdfObject {
    let mut dict = PdfDictionary::new();
    dict.insert("Length", PdfObject::Integer(data.len() as i64));
    PdfObject::Stream(PdfStream::new(dict, data))
}

fn image_xobject(image: &ReplacementImage) -> PdfObject {
    let mut dict = PdfDictionary::new();
    dict.insert("Type", PdfObject::name("XObject"));
    dict.insert("Subtype", PdfObject::name("Image"));
    dict.insert("Width", PdfObject::Integer(image.width_px as i64));
    dict.insert("Height", PdfObject::Integer(image.height_px as i64));
    dict.insert("ColorSpace", PdfObject::name(image.colorspace.clone()));
    dict.insert(
        "BitsPerComponent",
        PdfObject::Integer(image.bits_per_component as i64),
    );
    if let Some(filter) = &image.filter {
        dict.insert("Filter", PdfObject::name(filter.clone()));
    }
    dict.insert("Length", PdfObject::Integer(image.data.len() as i64));
    PdfObject::Stream(PdfStream::new(dict, image.data.clone()))
}

fn insert_resource(resources: &mut PdfDictionary, category: &str, name: &str, id: ObjectId) {
    let mut dict = match resources.get(category) {
        Some(PdfObject::Dictionary(d)) => d.clone(),
        // An indirect resource sub-dictionary is replaced by a direct one
        // carrying only our entry plus nothing; merging through the
        // reference would mutate a shared object.
        _ => PdfDictionary::new(),
    };
    dict.insert(name, PdfObject::Reference(id));
    resources.insert(category, PdfObject::Dictionary(dict));
}

fn xobject_names(resources: &PdfDictionary, document: &Document) -> Vec<String> {
    resources
        .get("XObject")
        .map(|o| document.resolve(o))
        .and_then(|o| o.as_dict())
        .map(|d| d.iter().map(|(k, _)| k.as_str().to_string()).collect())
        .unwrap_or_default()
}

fn unique_name(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == base) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{base}{i}");
        if !taken.iter().any(|t| t == &candidate) {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{BoundingBox, Line, OcrPage, Paragraph, Word};
    use crate::textlayer::{TargetPage, TextLayerRenderer};
    use crate::writer::testing::scanned_page_pdf;

    fn sample_layer(doc: &Document, page: usize) -> TextLayer {
        let word = Word::new("Hello", BoundingBox::new(100.0, 100.0, 500.0, 150.0)).unwrap();
        let bbox = word.bbox;
        let line = Line::new(bbox, vec![word]).unwrap();
        let paragraph = Paragraph::new(bbox, vec![line]).unwrap();
        let ocr = OcrPage::new(2550, 3300, 300.0, vec![paragraph]).unwrap();
        let grafter = Grafter::new(doc);
        let name = grafter.unique_font_name(page);
        TextLayerRenderer::new(TargetPage {
            width_pt: 612.0,
            height_pt: 792.0,
        })
        .render(&ocr, &name, doc.graft_id_base(page))
    }

    #[test]
    fn test_plain_graft_keeps_original_streams() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let layer = sample_layer(&doc, 1);
        let result = Grafter::new(&doc)
            .graft(1, &layer, None, None, "Hello".to_string())
            .unwrap();

        let (_, page_obj) = result
            .objects
            .iter()
            .find(|(id, _)| *id == doc.page_id(1).unwrap())
            .unwrap();
        let page = page_obj.as_dict().unwrap();
        let contents = page.get("Contents").unwrap().as_array().unwrap();
        // prefix + one original + suffix
        assert_eq!(contents.len(), 3);
        // The middle entry still points at the original stream object.
        let original_contents = doc.page_dict(1).unwrap().get("Contents").unwrap();
        assert_eq!(contents.get(1).unwrap(), original_contents);
        assert!(!result.replaced_image);
    }

    #[test]
    fn test_graft_merges_font_resource_under_unused_name() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let layer = sample_layer(&doc, 1);
        let result = Grafter::new(&doc)
            .graft(1, &layer, None, None, String::new())
            .unwrap();
        let (_, page_obj) = result
            .objects
            .iter()
            .find(|(id, _)| *id == doc.page_id(1).unwrap())
            .unwrap();
        let resources = page_obj.as_dict().unwrap().get("Resources").unwrap().as_dict().unwrap();
        let fonts = resources.get("Font").unwrap().as_dict().unwrap();
        assert!(fonts.contains_key(&layer.font_name));
        // Pre-existing XObject entries survive the merge.
        assert!(resources.contains_key("XObject"));
    }

    #[test]
    fn test_replacement_image_builds_fresh_content() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let layer = sample_layer(&doc, 1);
        let replacement = ReplacementImage {
            width_px: 2550,
            height_px: 3300,
            data: vec![0xFF, 0xD8, 0xFF, 0xD9],
            filter: Some("DCTDecode".to_string()),
            colorspace: "DeviceGray".to_string(),
            bits_per_component: 8,
        };
        let result = Grafter::new(&doc)
            .graft(1, &layer, Some(&replacement), None, String::new())
            .unwrap();
        assert!(result.replaced_image);
        let (_, page_obj) = result
            .objects
            .iter()
            .find(|(id, _)| *id == doc.page_id(1).unwrap())
            .unwrap();
        let page = page_obj.as_dict().unwrap();
        // Single fresh content stream, not the sandwich array.
        assert!(page.get("Contents").unwrap().as_reference().is_some());
    }

    #[test]
    fn test_mediabox_preserved_without_rotation() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let layer = sample_layer(&doc, 1);
        let result = Grafter::new(&doc)
            .graft(1, &layer, None, None, String::new())
            .unwrap();
        let (_, page_obj) = result
            .objects
            .iter()
            .find(|(id, _)| *id == doc.page_id(1).unwrap())
            .unwrap();
        let mb = page_obj
            .as_dict()
            .unwrap()
            .get("MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .as_rectangle()
            .unwrap();
        assert_eq!(mb.width(), 612.0);
        assert_eq!(mb.height(), 792.0);
    }

    #[test]
    fn test_strip_invisible_text_removes_mode3_blocks() {
        let content = b"q Q\nBT 3 Tr (ocr) Tj ET\nBT 0 Tr (visible) Tj ET\n0 0 10 10 re f";
        let stripped = strip_invisible_text(content).unwrap();
        let text = String::from_utf8_lossy(&stripped);
        assert!(!text.contains("ocr"));
        assert!(text.contains("visible"));
        assert!(text.contains("re"));
    }

    #[test]
    fn test_mask_all_text_leaves_graphics_only() {
        let content = b"BT 0 Tr (visible) Tj ET\n0 0 10 10 re f";
        let masked = mask_all_text(content).unwrap();
        let text = String::from_utf8_lossy(&masked);
        assert!(!text.contains("visible"));
        assert!(!text.contains("BT"));
        assert!(text.contains("re"));
    }

    #[test]
    fn test_unique_name_avoids_collisions() {
        let taken = vec!["F-OCR".to_string(), "F-OCR1".to_string()];
        assert_eq!(unique_name("F-OCR", &taken), "F-OCR2");
        assert_eq!(unique_name("F-OCR", &[]), "F-OCR");
    }
}
