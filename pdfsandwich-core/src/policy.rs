//! Per-page decision policy
//!
//! A pure function from (analysis, options) to the action the pipeline
//! takes on a page. Everything here is a closed sum type dispatched by
//! match; there is deliberately no I/O and no state, which is what makes
//! the decision table property-testable.

use tracing::warn;

use crate::analysis::PageAnalysis;
use crate::options::{OcrMode, Options};

/// Why a page (or the whole run) was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// XFA dynamic forms cannot be represented as static pages.
    XfaDynamic,
    /// The page already carries a usable text layer and no override was
    /// given; maps to exit code 6.
    AlreadyHasText,
}

/// One preprocessing step applied to the rasterized page image before
/// OCR. The order of application is fixed; user flags only toggle
/// presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessStep {
    /// Correct 90-degree orientation per the detector's hint.
    Rotate,
    RemoveBackground,
    Deskew,
    /// Clean the image fed to OCR only.
    CleanForOcr,
    /// Clean the image that ends up in the output too.
    CleanForOutput,
}

/// Ordered preprocessing plan: rotate, then remove background, then
/// deskew, then clean.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreprocessPlan {
    steps: Vec<PreprocessStep>,
}

impl PreprocessPlan {
    pub fn from_options(options: &Options) -> Self {
        let mut steps = Vec::new();
        if options.rotate_pages {
            steps.push(PreprocessStep::Rotate);
        }
        if options.remove_background {
            steps.push(PreprocessStep::RemoveBackground);
        }
        if options.deskew {
            steps.push(PreprocessStep::Deskew);
        }
        if options.clean {
            steps.push(PreprocessStep::CleanForOcr);
        }
        if options.clean_final {
            steps.push(PreprocessStep::CleanForOutput);
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[PreprocessStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether any step alters the image that lands in the output (as
    /// opposed to the OCR-only working copy).
    pub fn alters_output_image(&self) -> bool {
        self.steps.iter().any(|s| {
            matches!(
                s,
                PreprocessStep::Rotate
                    | PreprocessStep::RemoveBackground
                    | PreprocessStep::Deskew
                    | PreprocessStep::CleanForOutput
            )
        })
    }
}

/// What the pipeline does with one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    /// Outside the `--pages` selection; pass through byte-identical.
    Skip,
    /// Keep the page as-is (no OCR), but run it through assembly.
    CopyOnly,
    /// Rasterize, preprocess, OCR and graft a text layer.
    RasterizeAndOcr {
        preprocess: PreprocessPlan,
        rasterize_dpi: u32,
    },
    /// Strip previously grafted invisible text, then rasterize with the
    /// remaining visible text masked out and OCR what is left.
    RedoOcr { rasterize_dpi: u32 },
    Reject { reason: RejectReason },
}

impl PageAction {
    pub fn needs_ocr(&self) -> bool {
        matches!(
            self,
            PageAction::RasterizeAndOcr { .. } | PageAction::RedoOcr { .. }
        )
    }
}

/// The decision table. `page_index` is used only for log attribution.
pub fn decide(analysis: &PageAnalysis, options: &Options, page_index: usize) -> PageAction {
    if let Some(pages) = &options.pages {
        if !pages.contains(page_index) {
            return PageAction::Skip;
        }
    }

    if analysis.is_xfa_dynamic {
        return PageAction::Reject {
            reason: RejectReason::XfaDynamic,
        };
    }

    let dpi = analysis.effective_dpi.round().max(1.0) as u32;
    let mode = options.mode();

    // force-ocr takes the full rasterization path no matter what the page
    // holds; existing text is discarded with the rest of the rendering.
    if mode == OcrMode::ForceOcr {
        return match ocr_obstacle(analysis, options, page_index) {
            Some(action) => action,
            None => PageAction::RasterizeAndOcr {
                preprocess: PreprocessPlan::from_options(options),
                rasterize_dpi: dpi,
            },
        };
    }

    if mode == OcrMode::RedoOcr {
        if let Some(action) = ocr_obstacle(analysis, options, page_index) {
            return action;
        }
        return if analysis.has_text_non_vector || analysis.has_unmappable_text {
            PageAction::RedoOcr { rasterize_dpi: dpi }
        } else {
            PageAction::RasterizeAndOcr {
                preprocess: PreprocessPlan::from_options(options),
                rasterize_dpi: dpi,
            }
        };
    }

    if analysis.has_unmappable_text {
        // OCR output would be grafted under gibberish glyphs; selecting
        // text would interleave both layers. Doing nothing beats that.
        warn!(
            page = page_index,
            "page has text without a Unicode mapping, copying through unchanged"
        );
        return PageAction::CopyOnly;
    }

    if analysis.has_text_non_vector {
        return match mode {
            OcrMode::SkipText => PageAction::CopyOnly,
            _ => PageAction::Reject {
                reason: RejectReason::AlreadyHasText,
            },
        };
    }

    if analysis.content_parse_failed {
        warn!(
            page = page_index,
            "unparsable page content, copying through unchanged"
        );
        return PageAction::CopyOnly;
    }

    match ocr_obstacle(analysis, options, page_index) {
        Some(action) => action,
        None => PageAction::RasterizeAndOcr {
            preprocess: PreprocessPlan::from_options(options),
            rasterize_dpi: dpi,
        },
    }
}

/// Conditions that demote an OCR-bound page to CopyOnly regardless of
/// mode: OCR disabled wholesale, or the page's raster is too large.
fn ocr_obstacle(
    analysis: &PageAnalysis,
    options: &Options,
    page_index: usize,
) -> Option<PageAction> {
    if options.ocr_disabled() {
        return Some(PageAction::CopyOnly);
    }
    if let Some(limit) = options.skip_big_mpix {
        let largest = analysis.largest_image_mpix();
        if largest > limit {
            warn!(
                page = page_index,
                largest_mpix = largest,
                limit_mpix = limit,
                "largest image exceeds --skip-big, skipping OCR"
            );
            return Some(PageAction::CopyOnly);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PageAnalysis;
    use crate::geometry::{Point, Rectangle};
    use crate::options::PageRangeSet;

    fn blank_analysis() -> PageAnalysis {
        PageAnalysis {
            has_text_non_vector: false,
            has_text_vector_outlines: false,
            has_unmappable_text: false,
            has_vector_graphics: false,
            images: Vec::new(),
            effective_dpi: 300.0,
            max_dpi: 300.0,
            user_rotation: 0,
            mediabox: Rectangle::new(Point::origin(), Point::new(612.0, 792.0)),
            is_acroform_host: false,
            is_xfa_dynamic: false,
            orientation: None,
            content_parse_failed: false,
        }
    }

    #[test]
    fn test_scanned_page_gets_ocr() {
        let action = decide(&blank_analysis(), &Options::default(), 1);
        assert!(matches!(
            action,
            PageAction::RasterizeAndOcr {
                rasterize_dpi: 300,
                ..
            }
        ));
    }

    #[test]
    fn test_existing_text_rejects_by_default() {
        let analysis = PageAnalysis {
            has_text_non_vector: true,
            ..blank_analysis()
        };
        assert_eq!(
            decide(&analysis, &Options::default(), 1),
            PageAction::Reject {
                reason: RejectReason::AlreadyHasText
            }
        );
    }

    #[test]
    fn test_skip_text_copies_text_pages() {
        let analysis = PageAnalysis {
            has_text_non_vector: true,
            ..blank_analysis()
        };
        let options = Options {
            skip_text: true,
            ..Default::default()
        };
        assert_eq!(decide(&analysis, &options, 1), PageAction::CopyOnly);
    }

    #[test]
    fn test_force_ocr_overrides_existing_text() {
        let analysis = PageAnalysis {
            has_text_non_vector: true,
            has_unmappable_text: true,
            ..blank_analysis()
        };
        let options = Options {
            force_ocr: true,
            ..Default::default()
        };
        assert!(decide(&analysis, &options, 1).needs_ocr());
    }

    #[test]
    fn test_redo_ocr_on_previously_ocred_page() {
        let analysis = PageAnalysis {
            has_text_non_vector: true,
            ..blank_analysis()
        };
        let options = Options {
            redo_ocr: true,
            ..Default::default()
        };
        assert_eq!(
            decide(&analysis, &options, 1),
            PageAction::RedoOcr { rasterize_dpi: 300 }
        );
    }

    #[test]
    fn test_redo_ocr_without_text_falls_back_to_plain_ocr() {
        let options = Options {
            redo_ocr: true,
            ..Default::default()
        };
        assert!(matches!(
            decide(&blank_analysis(), &options, 1),
            PageAction::RasterizeAndOcr { .. }
        ));
    }

    #[test]
    fn test_unmappable_text_copies_with_warning() {
        let analysis = PageAnalysis {
            has_unmappable_text: true,
            ..blank_analysis()
        };
        assert_eq!(decide(&analysis, &Options::default(), 1), PageAction::CopyOnly);
    }

    #[test]
    fn test_xfa_dynamic_rejects_in_every_mode() {
        let analysis = PageAnalysis {
            is_xfa_dynamic: true,
            ..blank_analysis()
        };
        for options in [
            Options::default(),
            Options {
                force_ocr: true,
                ..Default::default()
            },
            Options {
                skip_text: true,
                ..Default::default()
            },
        ] {
            assert_eq!(
                decide(&analysis, &options, 1),
                PageAction::Reject {
                    reason: RejectReason::XfaDynamic
                }
            );
        }
    }

    #[test]
    fn test_pages_selection_skips_outside() {
        let options = Options {
            pages: Some(PageRangeSet::parse("2-3").unwrap()),
            ..Default::default()
        };
        assert_eq!(decide(&blank_analysis(), &options, 1), PageAction::Skip);
        assert!(decide(&blank_analysis(), &options, 2).needs_ocr());
    }

    #[test]
    fn test_ocr_timeout_zero_demotes_to_copy() {
        let options = Options {
            ocr_timeout: 0.0,
            ..Default::default()
        };
        assert_eq!(decide(&blank_analysis(), &options, 1), PageAction::CopyOnly);
    }

    #[test]
    fn test_skip_big_demotes_to_copy() {
        use crate::analysis::{Colorspace, ImageEncoding, ImageRef};
        use crate::geometry::Matrix;
        let analysis = PageAnalysis {
            images: vec![ImageRef {
                object_id: crate::objects::ObjectId::new(9, 0),
                width_px: 20000,
                height_px: 20000,
                colorspace: Colorspace::Gray,
                bits_per_component: 8,
                encoding: ImageEncoding::Dct,
                is_mask: false,
                is_smask: false,
                placed_transforms: vec![Matrix::scaling(612.0, 792.0)],
            }],
            ..blank_analysis()
        };
        let options = Options {
            skip_big_mpix: Some(100.0),
            ..Default::default()
        };
        assert_eq!(decide(&analysis, &options, 1), PageAction::CopyOnly);
    }

    #[test]
    fn test_malformed_content_copies() {
        let analysis = PageAnalysis {
            content_parse_failed: true,
            ..blank_analysis()
        };
        assert_eq!(decide(&analysis, &Options::default(), 1), PageAction::CopyOnly);
    }

    #[test]
    fn test_preprocess_plan_order_is_fixed() {
        let options = Options {
            clean: true,
            deskew: true,
            rotate_pages: true,
            remove_background: true,
            clean_final: true,
            ..Default::default()
        };
        let plan = PreprocessPlan::from_options(&options);
        assert_eq!(
            plan.steps(),
            &[
                PreprocessStep::Rotate,
                PreprocessStep::RemoveBackground,
                PreprocessStep::Deskew,
                PreprocessStep::CleanForOcr,
                PreprocessStep::CleanForOutput,
            ]
        );
        assert!(plan.alters_output_image());
    }

    #[test]
    fn test_clean_for_ocr_only_keeps_output_image() {
        let options = Options {
            clean: true,
            ..Default::default()
        };
        let plan = PreprocessPlan::from_options(&options);
        assert!(!plan.alters_output_image());
    }
}
