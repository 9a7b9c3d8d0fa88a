//! Engine-agnostic OCR result tree: page → paragraph → line → word, each
//! carrying an axis-aligned bounding box in pixels relative to a declared DPI.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OcrModelError {
    #[error("word text contains a NUL byte")]
    NulInText,
    #[error("word box is not contained in its line's box")]
    WordOutsideLine,
    #[error("line box is not contained in its paragraph's box")]
    LineOutsideParagraph,
    #[error("paragraph box is not contained in the page's box")]
    ParagraphOutsidePage,
}

/// Axis-aligned box in pixel space, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl BoundingBox {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f64 {
        (self.width().max(0.0)) * (self.height().max(0.0))
    }

    /// Whether `self` fully contains `other`, within a small epsilon to
    /// tolerate floating-point rounding from DPI conversions.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        const EPS: f64 = 0.5;
        other.left >= self.left - EPS
            && other.top >= self.top - EPS
            && other.right <= self.right + EPS
            && other.bottom <= self.bottom + EPS
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);

        let intersection = if right > left && bottom > top {
            (right - left) * (bottom - top)
        } else {
            0.0
        };
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Converts this pixel-space box to PDF points given a DPI and flips the
    /// y-axis (OCR origin top-left, PDF origin bottom-left) against a page
    /// of `page_height_pt` points.
    pub fn to_pdf_points(&self, dpi: f64, page_height_pt: f64) -> BoundingBox {
        let scale = 72.0 / dpi;
        let left = self.left * scale;
        let right = self.right * scale;
        let top_pt = page_height_pt - self.top * scale;
        let bottom_pt = page_height_pt - self.bottom * scale;
        BoundingBox::new(left, bottom_pt, right, top_pt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ltr,
    Rtl,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub slope: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StyleHints {
    pub bold: bool,
    pub italic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    pub bbox: BoundingBox,
    pub direction: Direction,
    pub language_hint: Option<String>,
    pub confidence: Option<f32>,
    pub baseline: Option<Baseline>,
    pub style_hints: StyleHints,
}

impl Word {
    pub fn new(text: impl Into<String>, bbox: BoundingBox) -> Result<Self, OcrModelError> {
        let text = text.into();
        if text.bytes().any(|b| b == 0) {
            return Err(OcrModelError::NulInText);
        }
        Ok(Self {
            text,
            bbox,
            direction: Direction::Ltr,
            language_hint: None,
            confidence: None,
            baseline: None,
            style_hints: StyleHints::default(),
        })
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Some(baseline);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub bbox: BoundingBox,
    pub words: Vec<Word>,
}

impl Line {
    pub fn new(bbox: BoundingBox, words: Vec<Word>) -> Result<Self, OcrModelError> {
        for word in &words {
            if !bbox.contains(&word.bbox) {
                return Err(OcrModelError::WordOutsideLine);
            }
        }
        Ok(Self { bbox, words })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paragraph {
    pub bbox: BoundingBox,
    pub lines: Vec<Line>,
}

impl Paragraph {
    pub fn new(bbox: BoundingBox, lines: Vec<Line>) -> Result<Self, OcrModelError> {
        for line in &lines {
            if !bbox.contains(&line.bbox) {
                return Err(OcrModelError::LineOutsideParagraph);
            }
        }
        Ok(Self { bbox, lines })
    }
}

/// The OCR result for a single page, referenced to a declared DPI and pixel
/// page size.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPage {
    pub bbox: BoundingBox,
    pub dpi: f64,
    pub width_px: u32,
    pub height_px: u32,
    pub paragraphs: Vec<Paragraph>,
}

impl OcrPage {
    pub fn new(
        width_px: u32,
        height_px: u32,
        dpi: f64,
        paragraphs: Vec<Paragraph>,
    ) -> Result<Self, OcrModelError> {
        let bbox = BoundingBox::new(0.0, 0.0, width_px as f64, height_px as f64);
        for paragraph in &paragraphs {
            if !bbox.contains(&paragraph.bbox) {
                return Err(OcrModelError::ParagraphOutsidePage);
            }
        }
        Ok(Self {
            bbox,
            dpi,
            width_px,
            height_px,
            paragraphs,
        })
    }

    pub fn empty(width_px: u32, height_px: u32, dpi: f64) -> Self {
        Self {
            bbox: BoundingBox::new(0.0, 0.0, width_px as f64, height_px as f64),
            dpi,
            width_px,
            height_px,
            paragraphs: Vec::new(),
        }
    }

    /// Every word in document reading order (paragraph, then line, then word).
    pub fn words_in_reading_order(&self) -> Vec<&Word> {
        self.paragraphs
            .iter()
            .flat_map(|p| p.lines.iter())
            .flat_map(|l| l.words.iter())
            .collect()
    }

    pub fn plain_text(&self) -> String {
        self.words_in_reading_order()
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
