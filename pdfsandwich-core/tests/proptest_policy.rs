//! Property tests for the page decision table.

use proptest::prelude::*;

use pdfsandwich_core::analysis::PageAnalysis;
use pdfsandwich_core::geometry::{Point, Rectangle};
use pdfsandwich_core::options::Options;
use pdfsandwich_core::policy::{decide, PageAction, RejectReason};

fn arb_analysis() -> impl Strategy<Value = PageAnalysis> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        50.0f64..1200.0,
        prop_oneof![Just(0), Just(90), Just(180), Just(270)],
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(mapped, outlines, unmappable, vector, dpi, rotation, xfa, parse_failed)| {
                PageAnalysis {
                    has_text_non_vector: mapped,
                    has_text_vector_outlines: outlines,
                    has_unmappable_text: unmappable,
                    has_vector_graphics: vector,
                    images: Vec::new(),
                    effective_dpi: dpi,
                    max_dpi: dpi,
                    user_rotation: rotation,
                    mediabox: Rectangle::new(Point::origin(), Point::new(612.0, 792.0)),
                    is_acroform_host: false,
                    is_xfa_dynamic: xfa,
                    orientation: None,
                    content_parse_failed: parse_failed,
                }
            },
        )
}

fn arb_options() -> impl Strategy<Value = Options> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        prop_oneof![Just(0.0f64), Just(180.0)],
    )
        .prop_map(|(skip_text, force_ocr, redo_ocr, ocr_timeout)| Options {
            skip_text,
            force_ocr,
            redo_ocr,
            ocr_timeout,
            ..Default::default()
        })
}

proptest! {
    /// XFA dynamic pages are rejected no matter which flags are set.
    #[test]
    fn xfa_always_rejects(analysis in arb_analysis(), options in arb_options()) {
        prop_assume!(analysis.is_xfa_dynamic);
        prop_assert_eq!(
            decide(&analysis, &options, 1),
            PageAction::Reject { reason: RejectReason::XfaDynamic }
        );
    }

    /// No page is ever sent to OCR while OCR is disabled wholesale.
    #[test]
    fn disabled_ocr_never_produces_ocr_actions(
        analysis in arb_analysis(),
        options in arb_options(),
    ) {
        prop_assume!(options.ocr_timeout == 0.0);
        let action = decide(&analysis, &options, 1);
        prop_assert!(!action.needs_ocr(), "got {action:?}");
    }

    /// force-ocr outranks redo-ocr and skip-text: with OCR enabled and no
    /// XFA, the page always takes the full rasterize path.
    #[test]
    fn force_ocr_wins_ties(analysis in arb_analysis(), options in arb_options()) {
        prop_assume!(options.force_ocr && options.ocr_timeout > 0.0);
        prop_assume!(!analysis.is_xfa_dynamic);
        let action = decide(&analysis, &options, 1);
        prop_assert!(
            matches!(action, PageAction::RasterizeAndOcr { .. }),
            "got {action:?}"
        );
    }

    /// AlreadyHasText rejection happens only in plain mode on pages with
    /// a mapped text layer.
    #[test]
    fn already_has_text_only_in_plain_mode(
        analysis in arb_analysis(),
        options in arb_options(),
    ) {
        let action = decide(&analysis, &options, 1);
        if action == (PageAction::Reject { reason: RejectReason::AlreadyHasText }) {
            prop_assert!(analysis.has_text_non_vector);
            prop_assert!(!options.skip_text && !options.force_ocr && !options.redo_ocr);
        }
    }

    /// The chosen rasterization DPI always mirrors the analysis.
    #[test]
    fn raster_dpi_tracks_analysis(analysis in arb_analysis(), options in arb_options()) {
        match decide(&analysis, &options, 1) {
            PageAction::RasterizeAndOcr { rasterize_dpi, .. }
            | PageAction::RedoOcr { rasterize_dpi } => {
                prop_assert_eq!(rasterize_dpi, analysis.effective_dpi.round() as u32);
            }
            _ => {}
        }
    }

    /// Every decision is one of the closed set; decide never panics.
    #[test]
    fn decide_is_total(analysis in arb_analysis(), options in arb_options()) {
        let _ = decide(&analysis, &options, 1);
    }
}
