//! Page rasterization collaborator
//!
//! The pipeline renders pages to PNG through the [`Rasterizer`] trait. The
//! stock implementation shells out to `pdftoppm`; tests and dry runs use
//! the deterministic mock. Errors distinguish transient failures (worth a
//! page-level downgrade) from fatal ones (abort the run).

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::debug;

pub type RasterResult<T> = Result<T, RasterError>;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("rasterizer not available: {0}")]
    NotAvailable(String),
    /// The page failed to render but the tool itself is healthy; the
    /// pipeline may downgrade the page and continue.
    #[error("page failed to rasterize: {0}")]
    Transient(String),
    #[error("rasterizer failed fatally: {0}")]
    Fatal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface: render one page of a PDF to a PNG at a DPI.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        input_pdf: &Path,
        page_index: usize,
        dpi: u32,
        output_png: &Path,
    ) -> RasterResult<()>;

    fn tool_name(&self) -> &str;
}

/// Shells out to poppler's `pdftoppm`.
pub struct PdftoppmRasterizer {
    binary: String,
}

impl PdftoppmRasterizer {
    pub fn new() -> Self {
        Self {
            binary: "pdftoppm".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn rasterize(
        &self,
        input_pdf: &Path,
        page_index: usize,
        dpi: u32,
        output_png: &Path,
    ) -> RasterResult<()> {
        // pdftoppm appends the extension itself.
        let prefix = output_png.with_extension("");
        let page = page_index.to_string();
        debug!(page = page_index, dpi, "rasterizing page");
        let output = Command::new(&self.binary)
            .arg("-f")
            .arg(&page)
            .arg("-l")
            .arg(&page)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-png")
            .arg("-singlefile")
            .arg(input_pdf)
            .arg(&prefix)
            .output()
            .map_err(|e| RasterError::NotAvailable(format!("{}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Poppler reports per-page rendering problems on stderr but
            // keeps exit 0; a non-zero exit with "Syntax" chatter is a
            // damaged page, anything else is the tool misbehaving.
            return if stderr.contains("Syntax") || stderr.contains("Corrupt") {
                Err(RasterError::Transient(stderr.trim().to_string()))
            } else {
                Err(RasterError::Fatal(stderr.trim().to_string()))
            };
        }
        if !output_png.exists() {
            return Err(RasterError::Transient(format!(
                "no output produced for page {page_index}"
            )));
        }
        Ok(())
    }

    fn tool_name(&self) -> &str {
        &self.binary
    }
}

/// Deterministic stand-in: writes a blank gray page at the requested
/// geometry. Used by tests and by `Collaborators::mock`.
pub struct MockRasterizer {
    /// Pixels per inch of letter-size output; the image dimensions follow
    /// the requested DPI like a real renderer's would.
    pub fill: u8,
}

impl MockRasterizer {
    pub fn new() -> Self {
        Self { fill: 0xF0 }
    }
}

impl Default for MockRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for MockRasterizer {
    fn rasterize(
        &self,
        _input_pdf: &Path,
        _page_index: usize,
        dpi: u32,
        output_png: &Path,
    ) -> RasterResult<()> {
        let width = (8.5 * dpi as f64) as u32;
        let height = (11.0 * dpi as f64) as u32;
        let image = image::GrayImage::from_pixel(width.max(1), height.max(1), image::Luma([self.fill]));
        image
            .save_with_format(output_png, image::ImageFormat::Png)
            .map_err(|e| RasterError::Fatal(e.to_string()))?;
        Ok(())
    }

    fn tool_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_rasterizer_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("0001_rasterize.png");
        MockRasterizer::new()
            .rasterize(Path::new("ignored.pdf"), 1, 50, &out)
            .unwrap();
        let img = image::open(&out).unwrap();
        assert_eq!(img.width(), 425);
        assert_eq!(img.height(), 550);
    }

    #[test]
    fn test_missing_binary_reports_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x.png");
        let err = PdftoppmRasterizer::with_binary("definitely-not-a-real-tool-7q")
            .rasterize(Path::new("in.pdf"), 1, 100, &out)
            .unwrap_err();
        assert!(matches!(err, RasterError::NotAvailable(_)));
    }
}
