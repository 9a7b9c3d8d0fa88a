//! Property tests for the OCR result tree invariants.

use proptest::prelude::*;

use pdfsandwich_core::ocr::{BoundingBox, Line, OcrPage, Paragraph, Word};

fn arb_box_within(limit: f64) -> impl Strategy<Value = BoundingBox> {
    (0.0..limit, 0.0..limit, 1.0..200.0, 1.0..60.0).prop_map(move |(x, y, w, h): (f64, f64, f64, f64)| {
        BoundingBox::new(x, y, (x + w).min(limit), (y + h).min(limit))
    })
}

proptest! {
    /// Word text never contains NUL.
    #[test]
    fn words_reject_nul(text in "\\PC*") {
        let result = Word::new(text.clone(), BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        prop_assert_eq!(result.is_ok(), !text.contains('\u{0}'));
    }

    /// A line built from a union box always contains its words, and the
    /// assembled page preserves reading order.
    #[test]
    fn tree_containment_holds(boxes in prop::collection::vec(arb_box_within(2000.0), 1..12)) {
        let words: Vec<Word> = boxes
            .iter()
            .enumerate()
            .map(|(i, b)| Word::new(format!("w{i}"), *b).unwrap())
            .collect();
        let union = boxes.iter().fold(
            BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN),
            |acc, b| BoundingBox::new(
                acc.left.min(b.left),
                acc.top.min(b.top),
                acc.right.max(b.right),
                acc.bottom.max(b.bottom),
            ),
        );
        let expected: Vec<String> = words.iter().map(|w| w.text.clone()).collect();

        let line = Line::new(union, words).unwrap();
        let paragraph = Paragraph::new(union, vec![line]).unwrap();
        let page = OcrPage::new(2048, 2048, 300.0, vec![paragraph]).unwrap();

        let read: Vec<String> = page
            .words_in_reading_order()
            .iter()
            .map(|w| w.text.clone())
            .collect();
        prop_assert_eq!(read, expected);
    }

    /// A word outside its line's box is refused.
    #[test]
    fn containment_violations_are_refused(
        inner in arb_box_within(100.0),
        shift in 200.0f64..500.0,
    ) {
        let outside = BoundingBox::new(
            inner.left + shift,
            inner.top + shift,
            inner.right + shift,
            inner.bottom + shift,
        );
        let word = Word::new("stray", outside).unwrap();
        prop_assert!(Line::new(inner, vec![word]).is_err());
    }

    /// Pixel-to-point conversion preserves box width under scaling and
    /// keeps the flipped box well-formed.
    #[test]
    fn pdf_point_conversion_is_well_formed(
        bbox in arb_box_within(3000.0),
        dpi in 72.0f64..600.0,
    ) {
        let page_height = 792.0;
        let converted = bbox.to_pdf_points(dpi, page_height);
        prop_assert!(converted.right >= converted.left);
        // After the y-flip the box stays well-formed: height non-negative.
        prop_assert!(converted.height() >= 0.0);
        let expected_width = bbox.width() * 72.0 / dpi;
        prop_assert!((converted.width() - expected_width).abs() < 1e-6);
    }

    /// IoU is symmetric and bounded.
    #[test]
    fn iou_is_symmetric(a in arb_box_within(500.0), b in arb_box_within(500.0)) {
        let ab = a.iou(&b);
        let ba = b.iou(&a);
        prop_assert!((ab - ba).abs() < 1e-9);
        prop_assert!((0.0..=1.0).contains(&ab));
    }
}
