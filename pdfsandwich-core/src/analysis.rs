//! Page content analysis
//!
//! Classifies what one PDF page actually contains so the policy layer can
//! decide what to do with it: does it carry a real (Unicode-mapped) text
//! layer, unmappable glyph soup, text drawn as outlines, vector art, and
//! which raster images placed at what effective resolution.
//!
//! Analysis is pure with respect to the page's bytes; it never mutates
//! the document and is safe to run on every page in parallel.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::document::Document;
use crate::geometry::{Matrix, Rectangle};
use crate::objects::{ObjectId, PdfDictionary, PdfObject};
use crate::parser::content::{shown_strings, ContentOp, ContentParser, OperatorClass};

/// How many text-showing operators are inspected per page before
/// classification stops. Decoding every string on a 10,000-op page buys
/// nothing; presence and mappability are established long before that.
const TEXT_SAMPLE_LIMIT: usize = 100;

/// Colorspace family of an image XObject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Mono,
    Gray,
    Indexed,
    Rgb,
    Cmyk,
    Other,
}

/// Compression currently applied to an image XObject's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Flate,
    Dct,
    Ccitt,
    Jbig2,
    Jpx,
    Raw,
}

/// One image XObject as placed on a page. The same object may be placed
/// several times; every placement matrix is recorded because each
/// contributes its own area-weighted DPI sample.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub object_id: ObjectId,
    pub width_px: u32,
    pub height_px: u32,
    pub colorspace: Colorspace,
    pub bits_per_component: u8,
    pub encoding: ImageEncoding,
    pub is_mask: bool,
    pub is_smask: bool,
    pub placed_transforms: Vec<Matrix>,
}

impl ImageRef {
    /// Effective DPI of one placement: pixels divided by drawn inches.
    pub fn placement_dpi(&self, ctm: &Matrix) -> f64 {
        let w_in = ctm.x_scale() / 72.0;
        let h_in = ctm.y_scale() / 72.0;
        if w_in <= 0.0 || h_in <= 0.0 {
            return 0.0;
        }
        let dpi_x = self.width_px as f64 / w_in;
        let dpi_y = self.height_px as f64 / h_in;
        dpi_x.max(dpi_y)
    }

    pub fn megapixels(&self) -> f64 {
        (self.width_px as f64 * self.height_px as f64) / 1.0e6
    }
}

/// Rotation hint produced by orientation detection during preprocessing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationHint {
    /// Suggested clockwise correction, a multiple of 90.
    pub angle: i32,
    /// Detector confidence, engine-specific scale.
    pub score: f32,
}

/// Immutable classification record for one page.
#[derive(Debug, Clone)]
pub struct PageAnalysis {
    /// Text shown with a real, Unicode-mapped font (a usable text layer).
    pub has_text_non_vector: bool,
    /// Text drawn as Type3 glyph procedures or charpath outlines.
    pub has_text_vector_outlines: bool,
    /// Text shown with fonts that map to no known Unicode (copying it
    /// yields gibberish).
    pub has_unmappable_text: bool,
    pub has_vector_graphics: bool,
    pub images: Vec<ImageRef>,
    /// Area-weighted page DPI, already clamped to the oversample floor.
    pub effective_dpi: f64,
    /// The largest single placement DPI seen on the page.
    pub max_dpi: f64,
    pub user_rotation: i32,
    pub mediabox: Rectangle,
    pub is_acroform_host: bool,
    pub is_xfa_dynamic: bool,
    pub orientation: Option<OrientationHint>,
    /// Set when the content stream was malformed beyond parsing; the
    /// text flags are then best-effort and policy should not OCR blindly.
    pub content_parse_failed: bool,
}

impl PageAnalysis {
    /// Largest placed image in megapixels, for `--skip-big`.
    pub fn largest_image_mpix(&self) -> f64 {
        self.images
            .iter()
            .map(ImageRef::megapixels)
            .fold(0.0, f64::max)
    }
}

/// Tunables for the analyzer.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Minimum rasterization DPI (`--oversample`).
    pub oversample_dpi: Option<u32>,
    /// Weighted-mean wins over the max when the max exceeds
    /// `weighted_mean * dpi_safety_factor`; stops one high-DPI sprite from
    /// forcing an enormous page rasterization. Tunable because the exact
    /// threshold is a judgment call, not a spec.
    pub dpi_safety_factor: f64,
    /// Fallback DPI for pages without raster content.
    pub default_dpi: f64,
    /// Hard ceiling on the chosen rasterization DPI.
    pub max_raster_dpi: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            oversample_dpi: None,
            dpi_safety_factor: 1.5,
            default_dpi: 300.0,
            max_raster_dpi: 1200.0,
        }
    }
}

/// Analyzes pages of one document. Holds only read access; one analyzer
/// is shared by all workers.
pub struct PageAnalyzer<'a> {
    document: &'a Document,
    options: AnalysisOptions,
}

impl<'a> PageAnalyzer<'a> {
    pub fn new(document: &'a Document, options: AnalysisOptions) -> Self {
        Self { document, options }
    }

    pub fn analyze(&self, index: usize) -> PageAnalysis {
        let mediabox = self.document.mediabox(index);
        let user_rotation = self.document.rotation(index);
        let resources = self.document.resources(index);

        let (ops, content_parse_failed) = match self.document.content_bytes(index) {
            Ok(bytes) => match ContentParser::parse(&bytes) {
                Ok(ops) => (ops, false),
                Err(err) => {
                    warn!(page = index, error = %err, "content stream malformed, classification is best-effort");
                    (Vec::new(), true)
                }
            },
            Err(err) => {
                warn!(page = index, error = %err, "content stream unreadable");
                (Vec::new(), true)
            }
        };

        let text = self.classify_text(&ops, &resources);
        let has_vector_graphics = has_vector_art(&ops);
        let images = self.collect_images(&ops, &resources, 0);

        let (effective_dpi, max_dpi) = self.page_dpi(&images);

        debug!(
            page = index,
            mapped = text.mapped,
            unmappable = text.unmappable,
            outlines = text.outlines,
            images = images.len(),
            effective_dpi,
            "page analyzed"
        );

        PageAnalysis {
            has_text_non_vector: text.mapped,
            has_text_vector_outlines: text.outlines,
            has_unmappable_text: text.unmappable,
            has_vector_graphics,
            images,
            effective_dpi,
            max_dpi,
            user_rotation,
            mediabox,
            is_acroform_host: self.document.has_acroform(),
            is_xfa_dynamic: self.document.has_dynamic_xfa(),
            orientation: None,
            content_parse_failed,
        }
    }

    /// Samples text-showing operators and classifies the fonts they use.
    fn classify_text(&self, ops: &[ContentOp], resources: &PdfDictionary) -> TextClassification {
        let mut result = TextClassification::default();
        let mut current_font: Option<String> = None;
        let mut sampled = 0usize;

        for op in ops {
            match op.operator.as_str() {
                "Tf" => {
                    current_font = op.name_operand().map(str::to_string);
                }
                _ if op.class() == OperatorClass::TextShow => {
                    if sampled >= TEXT_SAMPLE_LIMIT {
                        break;
                    }
                    if shown_strings(op).iter().all(|s| s.as_bytes().is_empty()) {
                        continue;
                    }
                    sampled += 1;
                    match self.font_kind(current_font.as_deref(), resources) {
                        FontKind::Mapped => result.mapped = true,
                        FontKind::Unmappable => result.unmappable = true,
                        FontKind::Outlines => result.outlines = true,
                    }
                }
                _ => {}
            }
        }
        result
    }

    fn font_kind(&self, name: Option<&str>, resources: &PdfDictionary) -> FontKind {
        let Some(name) = name else {
            // Text shown with no font set is broken; treat as unmappable.
            return FontKind::Unmappable;
        };
        let font = resources
            .get("Font")
            .map(|o| self.document.resolve(o))
            .and_then(|o| o.as_dict())
            .and_then(|fonts| fonts.get(name))
            .map(|o| self.document.resolve(o))
            .and_then(|o| o.as_dict());
        let Some(font) = font else {
            return FontKind::Unmappable;
        };

        if font.get("Subtype").and_then(|o| o.as_name()).map(|n| n.as_str()) == Some("Type3") {
            return FontKind::Outlines;
        }
        if font.contains_key("ToUnicode") {
            return FontKind::Mapped;
        }
        // Standard encodings (or the standard-14 base fonts) map through
        // well-known tables even without a ToUnicode CMap.
        let encoding_name = match font.get("Encoding").map(|o| self.document.resolve(o)) {
            Some(PdfObject::Name(n)) => Some(n.as_str().to_string()),
            Some(PdfObject::Dictionary(d)) => d
                .get("BaseEncoding")
                .and_then(|o| o.as_name())
                .map(|n| n.as_str().to_string()),
            _ => None,
        };
        if matches!(
            encoding_name.as_deref(),
            Some("WinAnsiEncoding") | Some("MacRomanEncoding") | Some("StandardEncoding")
        ) {
            return FontKind::Mapped;
        }
        if let Some(base) = font.get("BaseFont").and_then(|o| o.as_name()) {
            if is_standard_14(base.as_str()) {
                return FontKind::Mapped;
            }
        }
        FontKind::Unmappable
    }

    /// Walks the operator list with a CTM stack, recording every image
    /// placement. Form XObjects are entered once (`depth` guard); deeper
    /// nesting is rare enough that sampling the outer level suffices.
    fn collect_images(
        &self,
        ops: &[ContentOp],
        resources: &PdfDictionary,
        depth: usize,
    ) -> Vec<ImageRef> {
        let mut images: Vec<ImageRef> = Vec::new();
        self.walk_placements(ops, resources, Matrix::identity(), depth, &mut |id, dict, ctm| {
            if let Some(existing) = images.iter_mut().find(|i| i.object_id == id) {
                existing.placed_transforms.push(ctm);
                return;
            }
            if let Some(mut image) = self.image_ref(id, dict) {
                image.placed_transforms.push(ctm);
                images.push(image);
            }
        });

        // Soft masks are attached via /SMask rather than drawn; flag any
        // collected image that some other image uses as its mask.
        let smask_targets: HashSet<ObjectId> = images
            .iter()
            .filter_map(|i| {
                self.document
                    .get(i.object_id)
                    .and_then(PdfObject::as_dict)
                    .and_then(|d| d.get("SMask"))
                    .and_then(PdfObject::as_reference)
            })
            .collect();
        for image in &mut images {
            if smask_targets.contains(&image.object_id) {
                image.is_smask = true;
            }
        }
        images
    }

    fn walk_placements(
        &self,
        ops: &[ContentOp],
        resources: &PdfDictionary,
        base_ctm: Matrix,
        depth: usize,
        record: &mut dyn FnMut(ObjectId, &PdfDictionary, Matrix),
    ) {
        let mut ctm = base_ctm;
        let mut stack: Vec<Matrix> = Vec::new();

        for op in ops {
            match op.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => {
                    ctm = stack.pop().unwrap_or(base_ctm);
                }
                "cm" => {
                    if let Some(m) = op.matrix_operand() {
                        ctm = m.then(&ctm);
                    }
                }
                "Do" => {
                    let Some(name) = op.name_operand() else {
                        continue;
                    };
                    let Some((id, dict)) = self.xobject(resources, name) else {
                        continue;
                    };
                    match dict.get("Subtype").and_then(|o| o.as_name()).map(|n| n.as_str()) {
                        Some("Image") => record(id, &dict, ctm),
                        Some("Form") if depth == 0 => {
                            if let Some(stream) =
                                self.document.get(id).and_then(PdfObject::as_stream)
                            {
                                let form_resources = dict
                                    .get("Resources")
                                    .map(|o| self.document.resolve(o))
                                    .and_then(|o| o.as_dict())
                                    .cloned()
                                    .unwrap_or_else(|| resources.clone());
                                let form_matrix = dict
                                    .get("Matrix")
                                    .and_then(|o| o.as_array())
                                    .and_then(array_matrix)
                                    .unwrap_or_else(Matrix::identity);
                                if let Ok(data) = crate::parser::filters::decode_stream(stream) {
                                    if let Ok(form_ops) = ContentParser::parse(&data) {
                                        self.walk_placements(
                                            &form_ops,
                                            &form_resources,
                                            form_matrix.then(&ctm),
                                            depth + 1,
                                            record,
                                        );
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    fn xobject(&self, resources: &PdfDictionary, name: &str) -> Option<(ObjectId, PdfDictionary)> {
        let xobjects = resources
            .get("XObject")
            .map(|o| self.document.resolve(o))
            .and_then(|o| o.as_dict())?;
        let id = xobjects.get(name)?.as_reference()?;
        let dict = self.document.get(id)?.as_dict()?.clone();
        Some((id, dict))
    }

    fn image_ref(&self, id: ObjectId, dict: &PdfDictionary) -> Option<ImageRef> {
        let width_px = dict.get("Width").map(|o| self.document.resolve(o))?.as_integer()? as u32;
        let height_px = dict.get("Height").map(|o| self.document.resolve(o))?.as_integer()? as u32;
        let bits_per_component = dict
            .get("BitsPerComponent")
            .map(|o| self.document.resolve(o))
            .and_then(|o| o.as_integer())
            .unwrap_or(8) as u8;
        let is_mask = dict
            .get("ImageMask")
            .and_then(|o| o.as_bool())
            .unwrap_or(false);
        let colorspace = if is_mask || bits_per_component == 1 {
            Colorspace::Mono
        } else {
            self.classify_colorspace(dict.get("ColorSpace"))
        };
        let encoding = classify_encoding(
            &dict
                .get("Filter")
                .map(|f| match f {
                    PdfObject::Name(n) => vec![n.as_str().to_string()],
                    PdfObject::Array(a) => a
                        .iter()
                        .filter_map(|o| o.as_name().map(|n| n.as_str().to_string()))
                        .collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default(),
        );
        Some(ImageRef {
            object_id: id,
            width_px,
            height_px,
            colorspace,
            bits_per_component,
            encoding,
            is_mask,
            is_smask: false,
            placed_transforms: Vec::new(),
        })
    }

    fn classify_colorspace(&self, cs: Option<&PdfObject>) -> Colorspace {
        let Some(cs) = cs.map(|o| self.document.resolve(o)) else {
            return Colorspace::Other;
        };
        match cs {
            PdfObject::Name(n) => match n.as_str() {
                "DeviceGray" | "CalGray" => Colorspace::Gray,
                "DeviceRGB" | "CalRGB" | "Lab" => Colorspace::Rgb,
                "DeviceCMYK" => Colorspace::Cmyk,
                _ => Colorspace::Other,
            },
            PdfObject::Array(a) => match a.get(0).and_then(|o| o.as_name()).map(|n| n.as_str()) {
                Some("Indexed") => Colorspace::Indexed,
                Some("ICCBased") => {
                    let n = a
                        .get(1)
                        .map(|o| self.document.resolve(o))
                        .and_then(|o| o.as_dict())
                        .and_then(|d| d.get("N"))
                        .and_then(|o| o.as_integer());
                    match n {
                        Some(1) => Colorspace::Gray,
                        Some(3) => Colorspace::Rgb,
                        Some(4) => Colorspace::Cmyk,
                        _ => Colorspace::Other,
                    }
                }
                Some("DeviceN") | Some("Separation") => Colorspace::Other,
                _ => Colorspace::Other,
            },
            _ => Colorspace::Other,
        }
    }

    /// Area-weighted mean DPI vs the maximum, with the safety-factor
    /// arbitration and the oversample floor applied.
    fn page_dpi(&self, images: &[ImageRef]) -> (f64, f64) {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut max_dpi: f64 = 0.0;

        for image in images {
            if image.is_mask || image.is_smask {
                continue;
            }
            for ctm in &image.placed_transforms {
                let dpi = image.placement_dpi(ctm);
                if dpi <= 0.0 || !dpi.is_finite() {
                    continue;
                }
                let area = ctm.unit_area();
                weighted_sum += dpi * area;
                weight_total += area;
                max_dpi = max_dpi.max(dpi);
            }
        }

        let mut effective = if weight_total > 0.0 {
            let mean = weighted_sum / weight_total;
            if max_dpi > mean * self.options.dpi_safety_factor {
                mean
            } else {
                max_dpi
            }
        } else {
            self.options.default_dpi
        };

        if let Some(floor) = self.options.oversample_dpi {
            effective = effective.max(floor as f64);
        }
        effective = effective.min(self.options.max_raster_dpi).max(1.0);
        (effective.round(), max_dpi)
    }
}

#[derive(Default)]
struct TextClassification {
    mapped: bool,
    unmappable: bool,
    outlines: bool,
}

enum FontKind {
    Mapped,
    Unmappable,
    Outlines,
}

/// The standard 14 base fonts every reader maps without embedded tables.
/// Subset-tagged names (`ABCDEF+Helvetica`) count too.
fn is_standard_14(base_font: &str) -> bool {
    let name = base_font.rsplit('+').next().unwrap_or(base_font);
    let family = name.split(['-', ',']).next().unwrap_or(name);
    matches!(
        family,
        "Helvetica" | "Courier" | "Times" | "TimesNewRoman" | "Arial" | "Symbol" | "ZapfDingbats"
    )
}

fn array_matrix(a: &crate::objects::PdfArray) -> Option<Matrix> {
    if a.len() != 6 {
        return None;
    }
    let mut v = [0.0; 6];
    for (slot, obj) in v.iter_mut().zip(a.iter()) {
        *slot = obj.as_real()?;
    }
    Some(Matrix::new(v[0], v[1], v[2], v[3], v[4], v[5]))
}

/// Vector art means a painted, non-degenerate path outside text blocks.
fn has_vector_art(ops: &[ContentOp]) -> bool {
    let mut constructed = false;
    for op in ops {
        match op.class() {
            OperatorClass::PathConstruct => constructed = true,
            OperatorClass::PathPaint => {
                if constructed && op.operator != "n" {
                    return true;
                }
                constructed = false;
            }
            _ => {}
        }
    }
    false
}

fn classify_encoding(filters: &[String]) -> ImageEncoding {
    // The last image filter in the chain determines the stored encoding.
    for filter in filters.iter().rev() {
        match filter.as_str() {
            "DCTDecode" => return ImageEncoding::Dct,
            "CCITTFaxDecode" => return ImageEncoding::Ccitt,
            "JBIG2Decode" => return ImageEncoding::Jbig2,
            "JPXDecode" => return ImageEncoding::Jpx,
            "FlateDecode" | "Fl" => return ImageEncoding::Flate,
            _ => {}
        }
    }
    ImageEncoding::Raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::testing::{mixed_pdf, scanned_page_pdf};

    fn analyze(bytes: Vec<u8>, page: usize) -> PageAnalysis {
        let doc = Document::from_bytes(bytes).unwrap();
        PageAnalyzer::new(&doc, AnalysisOptions::default()).analyze(page)
    }

    #[test]
    fn test_scanned_page_has_image_no_text() {
        let analysis = analyze(scanned_page_pdf(1), 1);
        assert!(!analysis.has_text_non_vector);
        assert_eq!(analysis.images.len(), 1);
        assert_eq!(analysis.images[0].encoding, ImageEncoding::Dct);
        assert_eq!(analysis.images[0].colorspace, Colorspace::Gray);
    }

    #[test]
    fn test_text_page_is_detected_as_mapped() {
        let analysis = analyze(mixed_pdf(2, &[0]), 1);
        assert!(analysis.has_text_non_vector);
        assert!(!analysis.has_unmappable_text);
    }

    #[test]
    fn test_effective_dpi_of_full_page_scan() {
        // 2550x3300 px drawn over 612x792 pt = 300 dpi.
        let analysis = analyze(scanned_page_pdf(1), 1);
        assert_eq!(analysis.effective_dpi, 300.0);
        assert_eq!(analysis.max_dpi.round(), 300.0);
    }

    #[test]
    fn test_oversample_floor_applies() {
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let options = AnalysisOptions {
            oversample_dpi: Some(400),
            ..Default::default()
        };
        let analysis = PageAnalyzer::new(&doc, options).analyze(1);
        assert_eq!(analysis.effective_dpi, 400.0);
    }

    #[test]
    fn test_weighted_mean_beats_sprite_outlier() {
        // One dominant 300-dpi placement and a tiny 2400-dpi sprite: the
        // area-weighted mean must win.
        let page_image = ImageRef {
            object_id: ObjectId::new(10, 0),
            width_px: 2550,
            height_px: 3300,
            colorspace: Colorspace::Gray,
            bits_per_component: 8,
            encoding: ImageEncoding::Dct,
            is_mask: false,
            is_smask: false,
            placed_transforms: vec![Matrix::scaling(612.0, 792.0)],
        };
        let sprite = ImageRef {
            object_id: ObjectId::new(11, 0),
            width_px: 400,
            height_px: 400,
            colorspace: Colorspace::Gray,
            bits_per_component: 8,
            encoding: ImageEncoding::Flate,
            is_mask: false,
            is_smask: false,
            placed_transforms: vec![Matrix::scaling(12.0, 12.0)],
        };
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let analyzer = PageAnalyzer::new(&doc, AnalysisOptions::default());
        let (effective, max) = analyzer.page_dpi(&[page_image, sprite]);
        assert!(max > 2000.0);
        assert!(effective < 400.0, "effective {effective} should be near 300");
    }

    #[test]
    fn test_masks_do_not_drive_dpi() {
        let mask = ImageRef {
            object_id: ObjectId::new(12, 0),
            width_px: 10000,
            height_px: 10000,
            colorspace: Colorspace::Mono,
            bits_per_component: 1,
            encoding: ImageEncoding::Ccitt,
            is_mask: true,
            is_smask: false,
            placed_transforms: vec![Matrix::scaling(10.0, 10.0)],
        };
        let doc = Document::from_bytes(scanned_page_pdf(1)).unwrap();
        let analyzer = PageAnalyzer::new(&doc, AnalysisOptions::default());
        let (effective, max) = analyzer.page_dpi(&[mask]);
        assert_eq!(max, 0.0);
        assert_eq!(effective, 300.0); // default for no countable raster
    }

    #[test]
    fn test_vector_art_detection() {
        assert!(has_vector_art(
            &ContentParser::parse(b"0 0 100 100 re f").unwrap()
        ));
        assert!(!has_vector_art(
            &ContentParser::parse(b"0 0 100 100 re n").unwrap()
        ));
        assert!(!has_vector_art(
            &ContentParser::parse(b"BT (x) Tj ET").unwrap()
        ));
    }

    #[test]
    fn test_malformed_content_sets_flag() {
        // Build a doc then truncate its content stream object by hand is
        // involved; instead feed the parser garbage directly.
        let ops = ContentParser::parse(b"\x01\x02\x03").unwrap();
        assert!(ops.is_empty());
    }
}
