//! External collaborator wiring
//!
//! All subprocess-backed capabilities the pipeline consumes, bundled into
//! one struct assembled at startup: OCR engine, rasterizer, image
//! cleaner, PDF/A converter and the optional encoders the optimizer can
//! fall back from. Implementations are trait objects; swapping one means
//! constructing a different bundle, never patching the pipeline.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{SandwichError, SandwichResult};
use crate::ocr::{MockOcrProvider, OcrProvider, SubprocessOcrProvider};
use crate::options::Options;
use crate::preprocess::{ImageCleaner, MockCleaner, UnpaperCleaner};
use crate::raster::{MockRasterizer, PdftoppmRasterizer, Rasterizer};

/// PDF/A conformance collaborator: consumes a regular PDF, produces a
/// PDF/A of the requested part, or fails with a classified error.
pub trait PdfaConverter: Send + Sync {
    fn generate_pdfa(&self, input_pdf: &Path, output_pdf: &Path, part: u8) -> SandwichResult<()>;

    fn tool_name(&self) -> &str;
}

/// Ghostscript-backed PDF/A conversion.
pub struct GhostscriptPdfaConverter {
    binary: String,
}

impl GhostscriptPdfaConverter {
    pub fn new() -> Self {
        Self {
            binary: "gs".to_string(),
        }
    }
}

impl Default for GhostscriptPdfaConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfaConverter for GhostscriptPdfaConverter {
    fn generate_pdfa(&self, input_pdf: &Path, output_pdf: &Path, part: u8) -> SandwichResult<()> {
        let output = Command::new(&self.binary)
            .arg(format!("-dPDFA={part}"))
            .arg("-dBATCH")
            .arg("-dNOPAUSE")
            .arg("-dPDFACompatibilityPolicy=1")
            .arg("-sColorConversionStrategy=RGB")
            .arg("-sDEVICE=pdfwrite")
            .arg(format!("-sOutputFile={}", output_pdf.display()))
            .arg(input_pdf)
            .output()
            .map_err(|e| SandwichError::MissingDependency(format!("{}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(SandwichError::PdfaConversionFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn tool_name(&self) -> &str {
        &self.binary
    }
}

/// Always-succeeds converter for tests: copies the input through.
pub struct MockPdfaConverter;

impl PdfaConverter for MockPdfaConverter {
    fn generate_pdfa(&self, input_pdf: &Path, output_pdf: &Path, _part: u8) -> SandwichResult<()> {
        std::fs::copy(input_pdf, output_pdf)?;
        Ok(())
    }

    fn tool_name(&self) -> &str {
        "mock"
    }
}

/// The capability bundle handed to the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub ocr: Arc<dyn OcrProvider>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub cleaner: Option<Arc<dyn ImageCleaner>>,
    pub pdfa: Option<Arc<dyn PdfaConverter>>,
    /// `jbig2enc` binary when present; the optimizer falls back to CCITT
    /// G4 without it.
    pub jbig2_encoder: Option<PathBuf>,
    /// `pngquant` binary when present; palette re-quantization is skipped
    /// without it.
    pub pngquant: Option<PathBuf>,
}

impl Collaborators {
    /// Probes the environment and wires the stock tools.
    pub fn detect() -> Self {
        let jbig2_encoder = find_in_path("jbig2");
        let pngquant = find_in_path("pngquant");
        let cleaner: Option<Arc<dyn ImageCleaner>> = find_in_path("unpaper")
            .map(|_| Arc::new(UnpaperCleaner::new()) as Arc<dyn ImageCleaner>);
        let pdfa: Option<Arc<dyn PdfaConverter>> = find_in_path("gs")
            .map(|_| Arc::new(GhostscriptPdfaConverter::new()) as Arc<dyn PdfaConverter>);

        if jbig2_encoder.is_none() {
            debug!("jbig2 encoder not found, monochrome images will use CCITT G4");
        }
        if pngquant.is_none() {
            debug!("pngquant not found, palette re-quantization disabled");
        }

        Self {
            ocr: Arc::new(SubprocessOcrProvider::new()),
            rasterizer: Arc::new(PdftoppmRasterizer::new()),
            cleaner,
            pdfa,
            jbig2_encoder,
            pngquant,
        }
    }

    /// Deterministic all-mock bundle for tests and dry runs.
    pub fn mock() -> Self {
        Self {
            ocr: Arc::new(MockOcrProvider::new()),
            rasterizer: Arc::new(MockRasterizer::new()),
            cleaner: Some(Arc::new(MockCleaner)),
            pdfa: Some(Arc::new(MockPdfaConverter)),
            jbig2_encoder: None,
            pngquant: None,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrProvider>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    /// Verifies that every collaborator the given options require is
    /// actually runnable; maps to exit code 3 when one is not.
    pub fn require_for(&self, options: &Options) -> SandwichResult<()> {
        if !options.ocr_disabled() {
            probe(self.ocr.engine_name())
                .map_err(|e| SandwichError::MissingDependency(format!("OCR engine: {e}")))?;
            probe(self.rasterizer.tool_name())
                .map_err(|e| SandwichError::MissingDependency(format!("rasterizer: {e}")))?;
        }
        if (options.deskew || options.clean || options.clean_final) && self.cleaner.is_none() {
            return Err(SandwichError::MissingDependency(
                "image cleaner required by --deskew/--clean but not found".to_string(),
            ));
        }
        if options.output_type.is_pdfa() && self.pdfa.is_none() {
            return Err(SandwichError::MissingDependency(
                "PDF/A converter required by --output-type but not found".to_string(),
            ));
        }
        info!(
            ocr = self.ocr.engine_name(),
            rasterizer = self.rasterizer.tool_name(),
            "collaborators ready"
        );
        Ok(())
    }
}

/// `--version`-probes a tool, accepting "mock" unconditionally so test
/// bundles need no processes.
fn probe(binary: &str) -> Result<(), String> {
    if binary == "mock" {
        return Ok(());
    }
    match Command::new(binary).arg("--version").output() {
        Ok(_) => Ok(()),
        Err(e) => Err(format!("{binary}: {e}")),
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
