//! Pipeline configuration
//!
//! One field per user-facing knob plus the internal tunables. The CLI
//! builds an [`Options`] from its arguments (optionally merged with a
//! TOML config file via serde); the pipeline itself never sees argv.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{SandwichError, SandwichResult};

/// The mutually-exclusive OCR policy modes. When several are requested,
/// force beats redo beats skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrMode {
    /// Reject pages that already carry a text layer.
    Normal,
    /// Leave pages with existing text untouched, OCR the rest.
    SkipText,
    /// Rasterize and OCR everything, discarding existing text.
    ForceOcr,
    /// Strip previous invisible OCR text and run OCR again.
    RedoOcr,
}

/// Assembler output profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    Pdf,
    /// Alias for the newest supported PDF/A part.
    #[default]
    Pdfa,
    Pdfa1,
    Pdfa2,
    Pdfa3,
    /// Run the pipeline but write no output PDF (sidecar-only runs).
    None,
}

impl OutputType {
    pub fn is_pdfa(&self) -> bool {
        matches!(
            self,
            OutputType::Pdfa | OutputType::Pdfa1 | OutputType::Pdfa2 | OutputType::Pdfa3
        )
    }

    pub fn parse(s: &str) -> SandwichResult<Self> {
        match s {
            "pdf" => Ok(OutputType::Pdf),
            "pdfa" => Ok(OutputType::Pdfa),
            "pdfa-1" => Ok(OutputType::Pdfa1),
            "pdfa-2" => Ok(OutputType::Pdfa2),
            "pdfa-3" => Ok(OutputType::Pdfa3),
            "none" => Ok(OutputType::None),
            other => Err(SandwichError::BadArguments(format!(
                "unknown output type '{other}'"
            ))),
        }
    }
}

/// A parsed `--pages` selection: 1-based inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRangeSet {
    ranges: Vec<(usize, usize)>,
}

impl PageRangeSet {
    /// Parses forms like `3`, `1-5`, `1-3,7,12-14`.
    pub fn parse(spec: &str) -> SandwichResult<Self> {
        let mut ranges = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (lo, hi) = match part.split_once('-') {
                Some((a, b)) => (parse_page_number(a)?, parse_page_number(b)?),
                None => {
                    let n = parse_page_number(part)?;
                    (n, n)
                }
            };
            if lo > hi {
                return Err(SandwichError::BadArguments(format!(
                    "backwards page range '{part}'"
                )));
            }
            ranges.push((lo, hi));
        }
        if ranges.is_empty() {
            return Err(SandwichError::BadArguments(format!(
                "empty page range '{spec}'"
            )));
        }
        Ok(Self { ranges })
    }

    pub fn contains(&self, page: usize) -> bool {
        self.ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&page))
    }

    pub fn max_page(&self) -> usize {
        self.ranges.iter().map(|&(_, hi)| hi).max().unwrap_or(0)
    }
}

fn parse_page_number(s: &str) -> SandwichResult<usize> {
    let n: usize = s
        .trim()
        .parse()
        .map_err(|_| SandwichError::BadArguments(format!("bad page number '{s}'")))?;
    if n == 0 {
        return Err(SandwichError::BadArguments(
            "page numbers are 1-based".to_string(),
        ));
    }
    Ok(n)
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_rotate_threshold() -> f32 {
    14.0
}

fn default_ocr_timeout() -> f64 {
    180.0
}

fn default_non_ocr_timeout() -> f64 {
    600.0
}

fn default_dpi_safety_factor() -> f64 {
    1.5
}

fn default_max_raster_dpi() -> u32 {
    1200
}

fn default_jbig2_group_size() -> usize {
    10
}

fn default_max_image_mpix() -> f64 {
    250.0
}

/// Everything the pipeline needs to know about a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// OCR language list, engine syntax (`eng`, `deu`, ...).
    pub languages: Vec<String>,
    /// Worker thread cap; `None` means one per CPU.
    pub jobs: Option<usize>,

    pub skip_text: bool,
    pub force_ocr: bool,
    pub redo_ocr: bool,

    pub rotate_pages: bool,
    /// Minimum orientation-detector confidence before a page is rotated.
    pub rotate_pages_threshold: f32,
    pub deskew: bool,
    pub remove_background: bool,
    pub clean: bool,
    pub clean_final: bool,

    /// Minimum rasterization DPI.
    pub oversample: Option<u32>,
    /// Skip OCR on pages whose largest image exceeds this many megapixels.
    pub skip_big_mpix: Option<f64>,

    /// Per-page OCR wall-clock bound in seconds; 0 skips OCR outright.
    pub ocr_timeout: f64,
    /// Per-page bound on everything that is not OCR; exceeding it is fatal.
    pub non_ocr_timeout: f64,

    pub output_type: OutputType,
    /// Image optimization aggressiveness, 0 (off) to 3.
    pub optimize: u8,
    /// Linearize when the output exceeds this many bytes.
    pub fast_web_view: Option<u64>,

    #[serde(skip)]
    pub pages: Option<PageRangeSet>,
    pub sidecar: Option<PathBuf>,
    /// Override for the output modification date (a PDF date string);
    /// makes runs byte-reproducible. Not a CLI flag.
    #[serde(skip)]
    pub timestamp: Option<String>,
    pub keep_temporary_files: bool,
    pub invalidate_digital_signatures: bool,
    /// Downgrade pages whose render/OCR stage fails instead of aborting.
    pub continue_on_soft_render_error: bool,

    // Internal tunables; config-file only.
    pub dpi_safety_factor: f64,
    pub max_raster_dpi: u32,
    /// Pages per shared-dictionary JBIG2 segment group.
    pub jbig2_page_group_size: usize,
    /// Optimizer leaves images alone above this decoded size.
    pub max_image_mpix: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            jobs: None,
            skip_text: false,
            force_ocr: false,
            redo_ocr: false,
            rotate_pages: false,
            rotate_pages_threshold: default_rotate_threshold(),
            deskew: false,
            remove_background: false,
            clean: false,
            clean_final: false,
            oversample: None,
            skip_big_mpix: None,
            ocr_timeout: default_ocr_timeout(),
            non_ocr_timeout: default_non_ocr_timeout(),
            output_type: OutputType::default(),
            optimize: 1,
            fast_web_view: None,
            pages: None,
            sidecar: None,
            timestamp: None,
            keep_temporary_files: false,
            invalidate_digital_signatures: false,
            continue_on_soft_render_error: false,
            dpi_safety_factor: default_dpi_safety_factor(),
            max_raster_dpi: default_max_raster_dpi(),
            jbig2_page_group_size: default_jbig2_group_size(),
            max_image_mpix: default_max_image_mpix(),
        }
    }
}

impl Options {
    /// The effective policy mode, applying the force > redo > skip
    /// tie-break when flags were combined.
    pub fn mode(&self) -> OcrMode {
        if self.force_ocr {
            OcrMode::ForceOcr
        } else if self.redo_ocr {
            OcrMode::RedoOcr
        } else if self.skip_text {
            OcrMode::SkipText
        } else {
            OcrMode::Normal
        }
    }

    pub fn effective_jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Whether OCR is disabled wholesale (`--ocr-timeout 0`).
    pub fn ocr_disabled(&self) -> bool {
        self.ocr_timeout == 0.0
    }

    /// Rejects contradictory or out-of-range combinations up front.
    pub fn validate(&self) -> SandwichResult<()> {
        let modes = [self.skip_text, self.force_ocr, self.redo_ocr]
            .iter()
            .filter(|&&b| b)
            .count();
        if modes > 1 {
            return Err(SandwichError::BadArguments(
                "--skip-text, --force-ocr and --redo-ocr are mutually exclusive".to_string(),
            ));
        }
        if self.optimize > 3 {
            return Err(SandwichError::BadArguments(format!(
                "--optimize must be 0..=3, got {}",
                self.optimize
            )));
        }
        if let Some(0) = self.jobs {
            return Err(SandwichError::BadArguments(
                "--jobs must be at least 1".to_string(),
            ));
        }
        if self.languages.is_empty() {
            return Err(SandwichError::BadArguments(
                "at least one OCR language is required".to_string(),
            ));
        }
        if self.ocr_timeout < 0.0 || self.non_ocr_timeout <= 0.0 {
            return Err(SandwichError::BadArguments(
                "timeouts must be non-negative (non-OCR timeout positive)".to_string(),
            ));
        }
        if self.dpi_safety_factor < 1.0 {
            return Err(SandwichError::InvalidConfig(
                "dpi_safety_factor below 1.0 would prefer the outlier".to_string(),
            ));
        }
        Ok(())
    }

    pub fn analysis_options(&self) -> crate::analysis::AnalysisOptions {
        crate::analysis::AnalysisOptions {
            oversample_dpi: self.oversample,
            dpi_safety_factor: self.dpi_safety_factor,
            default_dpi: 300.0,
            max_raster_dpi: self.max_raster_dpi as f64,
        }
    }
}
