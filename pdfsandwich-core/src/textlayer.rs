//! Invisible text layer rendering
//!
//! Turns an [`OcrPage`] into a PDF content stream of rendering-mode-3
//! glyphs positioned so that selecting the visible raster selects the
//! matching invisible text, in reading order, including skewed baselines
//! and right-to-left runs.
//!
//! Glyphs are shown with a synthetic CID font whose every glyph has the
//! same advance (`GLYPH_ADVANCE` thousandths of an em) and whose encoding
//! is the identity map over UTF-16 code units. Font size per word is
//! therefore a closed-form function of the OCR box width, and a
//! `ToUnicode` CMap makes extraction trivial for any reader.

use std::f64::consts::PI;

use crate::geometry::{fmt_coord, Matrix};
use crate::objects::{ObjectId, PdfDictionary, PdfObject, PdfStream, PdfString};
use crate::ocr::{Direction, OcrPage, Word};

/// Uniform glyph advance in 1/1000 em.
pub const GLYPH_ADVANCE: i64 = 500;

/// Font size clamp; below the floor selection rectangles degenerate,
/// above the ceiling a single mis-measured box would dominate the page.
pub const MIN_FONT_SIZE: f64 = 2.0;
pub const MAX_FONT_SIZE: f64 = 72.0;

/// Geometry of the page the layer will be grafted onto, after any
/// `/Rotate` folding: the rasterized image and these points describe the
/// same upright space.
#[derive(Debug, Clone, Copy)]
pub struct TargetPage {
    pub width_pt: f64,
    pub height_pt: f64,
}

/// A rendered text layer: the content stream plus the font objects it
/// needs. The font resource name is chosen by the grafter; the stream
/// refers to it via the placeholder passed to [`TextLayerRenderer::render`].
#[derive(Debug, Clone)]
pub struct TextLayer {
    pub content: Vec<u8>,
    pub font_name: String,
    pub font_id: ObjectId,
    pub font_objects: Vec<(ObjectId, PdfObject)>,
}

pub struct TextLayerRenderer {
    target: TargetPage,
}

impl TextLayerRenderer {
    pub fn new(target: TargetPage) -> Self {
        Self { target }
    }

    /// Renders the page's words into an invisible text layer. `font_name`
    /// is the resource name the grafter will register the font under;
    /// `id_base` is the first object number available for font objects.
    pub fn render(&self, ocr: &OcrPage, font_name: &str, id_base: u32) -> TextLayer {
        let mut out = Vec::new();
        out.extend_from_slice(b"q\n");

        for paragraph in &ocr.paragraphs {
            for line in &paragraph.lines {
                self.render_line(&line.words, ocr, font_name, &mut out);
            }
        }

        out.extend_from_slice(b"Q\n");

        let (font_id, font_objects) = invisible_font_objects(id_base);
        TextLayer {
            content: out,
            font_name: font_name.to_string(),
            font_id,
            font_objects,
        }
    }

    fn render_line(&self, words: &[Word], ocr: &OcrPage, font_name: &str, out: &mut Vec<u8>) {
        if words.is_empty() {
            return;
        }
        let dpi = ocr.dpi;
        let page_h = self.target.height_pt;

        // Baseline origin: left edge of the first word's box, at its
        // bottom (PDF text renders on the baseline; OCR boxes bound the
        // ink, so the box bottom is the closest stable proxy).
        let first_pt = words[0].bbox.to_pdf_points(dpi, page_h);
        let origin_x = first_pt.left;
        let origin_y = first_pt.top; // after flip, "top" is the lower y

        // A reported baseline slope rotates the whole line's text space.
        let angle = words[0]
            .baseline
            .map(|b| (-b.slope).atan())
            .filter(|a| a.is_finite() && a.abs() < PI / 4.0)
            .unwrap_or(0.0);
        let tm = Matrix::rotation(angle).then(&Matrix::translation(origin_x, origin_y));

        out.extend_from_slice(b"BT\n3 Tr\n");
        out.extend_from_slice(tm.to_operands().as_bytes());
        out.extend_from_slice(b" Tm\n");

        // Cursor position along the baseline, in text-space points.
        let mut cursor_x = 0.0;

        for (i, word) in words.iter().enumerate() {
            let box_pt = word.bbox.to_pdf_points(dpi, page_h);
            let width_pt = box_pt.width();
            let units = utf16_units(&word.text);
            if units.is_empty() || width_pt <= 0.0 {
                continue;
            }

            let size = font_size_for(width_pt, units.len());
            let advance_pt = units.len() as f64 * GLYPH_ADVANCE as f64 / 1000.0 * size;

            out.extend_from_slice(format!("/{font_name} {} Tf\n", fmt_coord(size)).as_bytes());

            match word.direction {
                Direction::Ltr => {
                    let dx = (box_pt.left - origin_x) - cursor_x;
                    move_cursor(dx, out);
                    cursor_x += dx;
                    show_hex(&units, out);
                    out.extend_from_slice(b" Tj\n");
                    cursor_x += advance_pt;
                }
                Direction::Rtl => {
                    // Visual right-to-left: start one advance short of the
                    // right edge and step left after every glyph, so the
                    // string stays in logical order in the stream.
                    let glyph_pt = GLYPH_ADVANCE as f64 / 1000.0 * size;
                    let start = (box_pt.right - origin_x) - glyph_pt;
                    let dx = start - cursor_x;
                    move_cursor(dx, out);
                    cursor_x += dx;
                    show_rtl(&units, out);
                    // After N glyphs each followed by a -advance step, the
                    // cursor sits one advance left of where it started,
                    // except the final glyph advances normally.
                    cursor_x += glyph_pt - (units.len() as f64 - 1.0) * glyph_pt;
                }
            }

            // An explicit space after each word keeps naive extractors
            // from gluing adjacent words into one token. Its size is
            // chosen so the advance spans the gap to the next word.
            if i + 1 < words.len() {
                let next_pt = words[i + 1].bbox.to_pdf_points(dpi, page_h);
                let gap = (next_pt.left - origin_x) - cursor_x;
                if gap > 0.01 {
                    let space_size = font_size_for(gap, 1);
                    out.extend_from_slice(
                        format!("/{font_name} {} Tf\n", fmt_coord(space_size)).as_bytes(),
                    );
                    show_hex(&[0x0020], out);
                    out.extend_from_slice(b" Tj\n");
                    cursor_x += GLYPH_ADVANCE as f64 / 1000.0 * space_size;
                } else {
                    show_hex(&[0x0020], out);
                    out.extend_from_slice(b" Tj\n");
                    cursor_x += GLYPH_ADVANCE as f64 / 1000.0 * size;
                }
            }
        }
        out.extend_from_slice(b"ET\n");
    }
}

/// Size such that `n` uniform-advance glyphs span `width_pt`.
pub fn font_size_for(width_pt: f64, glyph_count: usize) -> f64 {
    let raw = width_pt * 1000.0 / (glyph_count.max(1) as f64 * GLYPH_ADVANCE as f64);
    raw.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

fn move_cursor(dx: f64, out: &mut Vec<u8>) {
    if dx.abs() > 1e-4 {
        out.extend_from_slice(format!("{} 0 Td\n", fmt_coord(dx)).as_bytes());
    }
}

fn utf16_units(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

fn show_hex(units: &[u16], out: &mut Vec<u8>) {
    out.push(b'<');
    for unit in units {
        out.extend_from_slice(format!("{unit:04X}").as_bytes());
    }
    out.push(b'>');
}

fn show_rtl(units: &[u16], out: &mut Vec<u8>) {
    out.push(b'[');
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            // 2 * GLYPH_ADVANCE: cancel the glyph's own advance and step
            // one further advance to the left.
            out.extend_from_slice(format!(" {} ", 2 * GLYPH_ADVANCE).as_bytes());
        }
        show_hex(&[*unit], out);
    }
    out.extend_from_slice(b"] TJ\n");
}

/// Builds the glyphless identity-encoded Type0 font: Type0 dictionary,
/// CIDFontType2 descendant with a uniform default width, a descriptor and
/// an identity `ToUnicode` CMap.
pub fn invisible_font_objects(id_base: u32) -> (ObjectId, Vec<(ObjectId, PdfObject)>) {
    let font_id = ObjectId::new(id_base, 0);
    let descendant_id = ObjectId::new(id_base + 1, 0);
    let descriptor_id = ObjectId::new(id_base + 2, 0);
    let tounicode_id = ObjectId::new(id_base + 3, 0);

    let mut font = PdfDictionary::new();
    font.insert("Type", PdfObject::name("Font"));
    font.insert("Subtype", PdfObject::name("Type0"));
    font.insert("BaseFont", PdfObject::name("GlyphlessSandwich"));
    font.insert("Encoding", PdfObject::name("Identity-H"));
    let mut descendants = crate::objects::PdfArray::new();
    descendants.push(PdfObject::Reference(descendant_id));
    font.insert("DescendantFonts", PdfObject::Array(descendants));
    font.insert("ToUnicode", PdfObject::Reference(tounicode_id));

    let mut descendant = PdfDictionary::new();
    descendant.insert("Type", PdfObject::name("Font"));
    descendant.insert("Subtype", PdfObject::name("CIDFontType2"));
    descendant.insert("BaseFont", PdfObject::name("GlyphlessSandwich"));
    let mut system_info = PdfDictionary::new();
    system_info.insert("Registry", PdfObject::String(PdfString::new(b"Adobe".to_vec())));
    system_info.insert("Ordering", PdfObject::String(PdfString::new(b"Identity".to_vec())));
    system_info.insert("Supplement", PdfObject::Integer(0));
    descendant.insert("CIDSystemInfo", PdfObject::Dictionary(system_info));
    descendant.insert("FontDescriptor", PdfObject::Reference(descriptor_id));
    descendant.insert("DW", PdfObject::Integer(GLYPH_ADVANCE));
    descendant.insert("CIDToGIDMap", PdfObject::name("Identity"));

    let mut descriptor = PdfDictionary::new();
    descriptor.insert("Type", PdfObject::name("FontDescriptor"));
    descriptor.insert("FontName", PdfObject::name("GlyphlessSandwich"));
    // Symbolic, per CID font convention; nothing here is ever painted.
    descriptor.insert("Flags", PdfObject::Integer(4));
    let mut bbox = crate::objects::PdfArray::new();
    for v in [0, -200, GLYPH_ADVANCE, 800] {
        bbox.push(PdfObject::Integer(v));
    }
    descriptor.insert("FontBBox", PdfObject::Array(bbox));
    descriptor.insert("ItalicAngle", PdfObject::Integer(0));
    descriptor.insert("Ascent", PdfObject::Integer(800));
    descriptor.insert("Descent", PdfObject::Integer(-200));
    descriptor.insert("CapHeight", PdfObject::Integer(800));
    descriptor.insert("StemV", PdfObject::Integer(80));

    let cmap = identity_tounicode_cmap();
    let mut cmap_dict = PdfDictionary::new();
    cmap_dict.insert("Length", PdfObject::Integer(cmap.len() as i64));
    let tounicode = PdfStream::new(cmap_dict, cmap);

    let objects = vec![
        (font_id, PdfObject::Dictionary(font)),
        (descendant_id, PdfObject::Dictionary(descendant)),
        (descriptor_id, PdfObject::Dictionary(descriptor)),
        (tounicode_id, PdfObject::Stream(tounicode)),
    ];
    (font_id, objects)
}

/// The identity CMap: every 2-byte CID is its own UTF-16 code unit.
fn identity_tounicode_cmap() -> Vec<u8> {
    let mut s = String::new();
    s.push_str("/CIDInit /ProcSet findresource begin\n");
    s.push_str("12 dict begin\nbegincmap\n");
    s.push_str("/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n");
    s.push_str("/CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n");
    s.push_str("1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n");
    s.push_str("1 beginbfrange\n<0000> <FFFF> <0000>\nendbfrange\n");
    s.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    s.into_bytes()
}

/// A word recovered from an emitted layer: its text and the axis-aligned
/// box its glyph advances cover in page points. Exists for the renderer's
/// own invariants and for diagnostics; only handles the operator subset
/// the renderer emits.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWord {
    pub text: String,
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub size: f64,
}

/// Decodes a rendered layer back into positioned words.
pub fn decode_layer(content: &[u8]) -> Vec<DecodedWord> {
    use crate::parser::content::ContentParser;

    let mut words = Vec::new();
    let mut tm = Matrix::identity();
    let mut cursor_x = 0.0;
    let mut size = 0.0f64;
    let mut pending: Option<DecodedWord> = None;

    let ops = ContentParser::parse(content).unwrap_or_default();
    for op in ops {
        match op.operator.as_str() {
            "Tm" => {
                if let Some(m) = op.matrix_operand() {
                    tm = m;
                    cursor_x = 0.0;
                }
            }
            "Td" => {
                if let (Some(dx), Some(_)) = (
                    op.operands.first().and_then(|o| o.as_real()),
                    op.operands.get(1).and_then(|o| o.as_real()),
                ) {
                    cursor_x += dx;
                }
            }
            "Tf" => {
                size = op.operands.get(1).and_then(|o| o.as_real()).unwrap_or(size);
            }
            "Tj" | "TJ" => {
                let (text, advance_units) = decode_shown(&op);
                if text == " " {
                    if let Some(word) = pending.take() {
                        words.push(word);
                    }
                    cursor_x += advance_units as f64 / 1000.0 * size;
                    continue;
                }
                if text.is_empty() {
                    continue;
                }
                let start = tm.apply(crate::geometry::Point::new(cursor_x, 0.0));
                let advance_pt = advance_units as f64 / 1000.0 * size;
                let word = DecodedWord {
                    text,
                    left: start.x,
                    bottom: start.y,
                    right: start.x + advance_pt,
                    size,
                };
                match pending.take() {
                    // Consecutive shows without a separating space glyph
                    // belong to the same token.
                    Some(mut prev) => {
                        prev.text.push_str(&word.text);
                        prev.right = word.right;
                        pending = Some(prev);
                    }
                    None => pending = Some(word),
                }
                cursor_x += advance_pt;
            }
            "ET" => {
                if let Some(word) = pending.take() {
                    words.push(word);
                }
            }
            _ => {}
        }
    }
    if let Some(word) = pending.take() {
        words.push(word);
    }
    words
}

/// Text and net advance (in 1/1000 em units) of one show operator.
fn decode_shown(op: &crate::parser::content::ContentOp) -> (String, i64) {
    let mut units: Vec<u16> = Vec::new();
    let mut advance = 0i64;
    let mut eat = |obj: &PdfObject| match obj {
        PdfObject::String(s) => {
            for pair in s.as_bytes().chunks_exact(2) {
                units.push(u16::from_be_bytes([pair[0], pair[1]]));
                advance += GLYPH_ADVANCE;
            }
        }
        PdfObject::Integer(_) | PdfObject::Real(_) => {
            advance -= obj.as_real().unwrap_or(0.0) as i64;
        }
        _ => {}
    };
    match op.operator.as_str() {
        "Tj" => {
            for operand in &op.operands {
                eat(operand);
            }
        }
        "TJ" => {
            if let Some(array) = op.operands.first().and_then(PdfObject::as_array) {
                for item in array.iter() {
                    eat(item);
                }
            }
        }
        _ => {}
    }
    (String::from_utf16_lossy(&units), advance)
}
