//! # pdfsandwich-core
//!
//! The OCR sandwich pipeline: take a scanned PDF, add an invisible,
//! selectable text layer aligned with the visible glyphs, and write a
//! visually identical (optionally PDF/A) result.
//!
//! ## How a page flows through
//!
//! 1. [`analysis`] classifies the page: does it already carry a real text
//!    layer, unmappable glyph soup or text outlines; which raster images
//!    are placed at what effective DPI.
//! 2. [`policy`] maps that classification plus the user's [`options`]
//!    onto a [`policy::PageAction`] (copy through, rasterize-and-OCR,
//!    redo a previous OCR, or reject).
//! 3. [`pipeline`] drives pages through rasterization, preprocessing
//!    ([`preprocess`]), the OCR engine ([`ocr`]), text-layer rendering
//!    ([`textlayer`]) and grafting ([`graft`]) with bounded parallelism,
//!    per-page timeouts and cooperative cancellation.
//! 4. [`assemble`] is the single writer: it installs grafted pages in
//!    index order, stamps metadata, runs the [`optimize`] pass over the
//!    page images, and self-checks the serialized result.
//!
//! External tools (OCR engine, rasterizer, image cleaner, PDF/A
//! converter, optional encoders) enter through the trait objects bundled
//! in [`collaborators::Collaborators`]; everything else is this crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pdfsandwich_core::collaborators::Collaborators;
//! use pdfsandwich_core::options::Options;
//! use pdfsandwich_core::pipeline::PipelineEngine;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = Options {
//!     languages: vec!["eng".to_string()],
//!     deskew: true,
//!     ..Default::default()
//! };
//! let engine = PipelineEngine::new(options, Collaborators::detect())?;
//! let summary = engine.run(Path::new("scan.pdf"), Some(Path::new("searchable.pdf")))?;
//! eprintln!("grafted {} of {} pages", summary.pages_grafted, summary.pages_total);
//! # Ok(())
//! # }
//! ```
//!
//! The PDF object-model substrate lives in [`objects`], [`parser`] and
//! [`writer`]: an arena of objects addressed by id (PDF object graphs
//! contain cycles; edges are ids, never owning references), a lenient
//! reader, and a deterministic serializer.

pub mod analysis;
pub mod assemble;
pub mod collaborators;
pub mod compression;
pub mod document;
pub mod error;
pub mod geometry;
pub mod graft;
pub mod objects;
pub mod ocr;
pub mod optimize;
pub mod options;
pub mod parser;
pub mod pipeline;
pub mod policy;
pub mod preprocess;
pub mod raster;
pub mod textlayer;
pub mod workdir;
pub mod writer;

// The types most integrations touch.
pub use analysis::{PageAnalysis, PageAnalyzer};
pub use collaborators::Collaborators;
pub use document::{Document, DocumentMetadata, PageHandle, PageResult};
pub use error::{PdfError, Result, SandwichError, SandwichResult};
pub use geometry::{Matrix, Point, Rectangle};
pub use ocr::{MockOcrProvider, OcrOptions, OcrPage, OcrProvider, SubprocessOcrProvider};
pub use options::{OcrMode, Options, OutputType, PageRangeSet};
pub use pipeline::{PipelineEngine, RunSummary};
pub use policy::{PageAction, PreprocessPlan};

/// Current version of pdfsandwich
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_options_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn test_module_exports() {
        let _point = Point::new(1.0, 2.0);
        let _matrix = Matrix::identity();
        let _options = Options::default();
        let _mode = OcrMode::Normal;
        let _provider = MockOcrProvider::new();
    }
}
