//! Renderer invariants: box alignment (IoU) and reading-order fidelity,
//! checked over generated word layouts.

use proptest::prelude::*;

use pdfsandwich_core::ocr::{BoundingBox, Direction, Line, OcrPage, Paragraph, Word};
use pdfsandwich_core::textlayer::{decode_layer, TargetPage, TextLayerRenderer};

const DPI: f64 = 300.0;
const PAGE_W_PT: f64 = 612.0;
const PAGE_H_PT: f64 = 792.0;

fn page_of_lines(lines: Vec<Vec<Word>>) -> OcrPage {
    let built: Vec<Line> = lines
        .into_iter()
        .map(|words| {
            let bbox = union(words.iter().map(|w| w.bbox));
            Line::new(bbox, words).unwrap()
        })
        .collect();
    let bbox = union(built.iter().map(|l| l.bbox));
    let paragraph = Paragraph::new(bbox, built).unwrap();
    OcrPage::new(
        (PAGE_W_PT / 72.0 * DPI) as u32,
        (PAGE_H_PT / 72.0 * DPI) as u32,
        DPI,
        vec![paragraph],
    )
    .unwrap()
}

fn union(boxes: impl Iterator<Item = BoundingBox>) -> BoundingBox {
    boxes.fold(
        BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN),
        |acc, b| {
            BoundingBox::new(
                acc.left.min(b.left),
                acc.top.min(b.top),
                acc.right.max(b.right),
                acc.bottom.max(b.bottom),
            )
        },
    )
}

fn render(page: &OcrPage) -> Vec<u8> {
    TextLayerRenderer::new(TargetPage {
        width_pt: PAGE_W_PT,
        height_pt: PAGE_H_PT,
    })
    .render(page, "F-OCR", 1000)
    .content
}

/// A line of words with realistic geometry: per-glyph widths in the
/// range a 300-dpi scan produces, left-to-right with gaps. Keeping the
/// width proportional to the glyph count keeps the computed font size
/// inside the renderer's clamp, as real OCR boxes do.
fn arb_line(y: f64) -> impl Strategy<Value = Vec<Word>> {
    prop::collection::vec(("[a-zA-Z]{1,12}", 20.0f64..120.0, 10.0f64..60.0), 1..8).prop_map(
        move |specs| {
            let mut x = 100.0;
            let mut words = Vec::new();
            for (text, char_width, gap) in specs {
                let chars = text.chars().count() as f64;
                let width = chars * char_width;
                let bbox = BoundingBox::new(x, y, x + width, y + 60.0);
                words.push(Word::new(text, bbox).unwrap());
                x += width + gap;
            }
            words
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant: every emitted word's horizontal extent overlaps its
    /// source OCR box with IoU >= 0.95 on unskewed pages.
    #[test]
    fn word_boxes_meet_iou_bound(words in arb_line(600.0)) {
        let expected: Vec<BoundingBox> = words
            .iter()
            .map(|w| w.bbox.to_pdf_points(DPI, PAGE_H_PT))
            .collect();
        let page = page_of_lines(vec![words]);
        let decoded = decode_layer(&render(&page));
        prop_assert_eq!(decoded.len(), expected.len());

        for (got, want) in decoded.iter().zip(&expected) {
            let overlap = (got.right.min(want.right) - got.left.max(want.left)).max(0.0);
            let span = (got.right.max(want.right) - got.left.min(want.left)).max(1e-9);
            prop_assert!(
                overlap / span >= 0.95,
                "word '{}': IoU {} below bound (got {}..{}, want {}..{})",
                got.text, overlap / span, got.left, got.right, want.left, want.right
            );
        }
    }

    /// Invariant: extracting the layer in content-stream order yields the
    /// same token sequence as the OCR model's reading order.
    #[test]
    fn extraction_matches_reading_order(
        line1 in arb_line(300.0),
        line2 in arb_line(900.0),
    ) {
        let page = page_of_lines(vec![line1, line2]);
        let expected: Vec<String> = page
            .words_in_reading_order()
            .iter()
            .map(|w| w.text.clone())
            .collect();
        let decoded = decode_layer(&render(&page));
        let tokens: Vec<String> = decoded.into_iter().map(|w| w.text).collect();
        prop_assert_eq!(tokens, expected);
    }

    /// RTL words keep their logical text in the stream.
    #[test]
    fn rtl_words_extract_logically(text in "[\\u{5d0}-\\u{5ea}]{2,8}") {
        let chars = text.chars().count() as f64;
        let bbox = BoundingBox::new(400.0, 600.0, 400.0 + chars * 40.0, 660.0);
        let word = Word::new(text.clone(), bbox).unwrap().with_direction(Direction::Rtl);
        let page = page_of_lines(vec![vec![word]]);
        let decoded = decode_layer(&render(&page));
        prop_assert_eq!(decoded.len(), 1);
        prop_assert_eq!(&decoded[0].text, &text);
    }
}
