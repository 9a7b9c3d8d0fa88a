//! OCR engine collaborator: the pipeline core only depends on the
//! [`OcrProvider`] trait, not on any particular OCR binary. A
//! subprocess-backed implementation invokes an external OCR engine (e.g. the
//! `tesseract` CLI) and parses its TSV output into an [`OcrPage`]; a mock
//! implementation is used in tests and as a default when no engine is
//! configured.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::model::{BoundingBox, Line, OcrModelError, OcrPage, Paragraph, Word};
use crate::analysis::OrientationHint;

pub type OcrResult<T> = Result<T, OcrError>;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine not available: {0}")]
    ProviderNotAvailable(String),
    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),
    #[error("invalid image data: {0}")]
    InvalidImageData(String),
    #[error("OCR processing failed: {0}")]
    ProcessingFailed(String),
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
    #[error("OCR cancelled")]
    Cancelled,
    #[error("malformed OCR model: {0}")]
    Model(#[from] OcrModelError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine tuning knobs passed to [`OcrProvider::ocr`].
#[derive(Debug, Clone)]
pub struct OcrOptions {
    /// Minimum confidence to keep a word (others are dropped).
    pub min_confidence: f32,
    /// Hard wall-clock bound for one page's OCR; the pipeline also enforces
    /// its own `ocr_timeout`, this is a defensive inner bound.
    pub timeout: Duration,
    /// Cooperative cancel flag. Subprocess-backed engines poll it while
    /// waiting and kill the in-flight child when it flips.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Extra engine-specific flags (e.g. page segmentation mode).
    pub engine_options: HashMap<String, String>,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.0,
            timeout: Duration::from_secs(120),
            cancel: None,
            engine_options: HashMap::new(),
        }
    }
}

/// Capability interface for an OCR engine (§6 external collaborator
/// contract: `ocr(image_path, languages, options) -> OcrModel`).
pub trait OcrProvider: Send + Sync {
    /// Runs OCR on a single rasterized page image and returns its text tree.
    fn ocr(
        &self,
        image_path: &Path,
        languages: &[String],
        options: &OcrOptions,
    ) -> OcrResult<OcrPage>;

    /// Estimates page orientation (for `--rotate-pages`); engines without
    /// orientation detection return `None` and no rotation happens.
    fn detect_orientation(&self, _image_path: &Path) -> Option<OrientationHint> {
        None
    }

    fn engine_name(&self) -> &str;
}

/// Invokes an external OCR binary (the `tesseract` CLI by default) and
/// parses its `--tsv` output into an [`OcrPage`].
pub struct SubprocessOcrProvider {
    binary: String,
    extra_args: Vec<String>,
}

impl SubprocessOcrProvider {
    pub fn new() -> Self {
        Self {
            binary: "tesseract".to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn spawn(&self, image_path: &Path, languages: &[String]) -> OcrResult<Child> {
        let lang_arg = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };

        Command::new(&self.binary)
            .arg(image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&lang_arg)
            .arg("tsv")
            .args(&self.extra_args)
            // One engine thread per invocation; the pipeline provides the
            // parallelism, and jobs x engine-threads must not exceed CPUs.
            .env("OMP_THREAD_LIMIT", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OcrError::ProviderNotAvailable(format!("{}: {e}", self.binary)))
    }

    /// Waits for `child` to exit, polling so the timeout and the
    /// cooperative cancel flag can both be enforced without
    /// platform-specific wait primitives. On timeout or cancel the child
    /// is killed and reaped before the error is returned, so no engine
    /// process outlives its page. The output pipes are drained from
    /// separate threads while waiting, otherwise an engine producing more
    /// than a pipe buffer of output would stall forever.
    fn wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> OcrResult<std::process::Output> {
        use std::io::Read;

        let drain = |pipe: Option<Box<dyn Read + Send>>| {
            std::thread::spawn(move || {
                let mut buffer = Vec::new();
                if let Some(mut pipe) = pipe {
                    let _ = pipe.read_to_end(&mut buffer);
                }
                buffer
            })
        };
        let stdout_reader = drain(
            child
                .stdout
                .take()
                .map(|p| Box::new(p) as Box<dyn Read + Send>),
        );
        let stderr_reader = drain(
            child
                .stderr
                .take()
                .map(|p| Box::new(p) as Box<dyn Read + Send>),
        );

        let start = Instant::now();
        let status = loop {
            let abort = if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                Some(OcrError::Cancelled)
            } else if start.elapsed() > timeout {
                Some(OcrError::Timeout(timeout))
            } else {
                None
            };
            if let Some(err) = abort {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(err);
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            std::thread::sleep(Duration::from_millis(25));
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok(std::process::Output {
            status,
            stdout,
            stderr,
        })
    }
}

impl Default for SubprocessOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrProvider for SubprocessOcrProvider {
    fn ocr(
        &self,
        image_path: &Path,
        languages: &[String],
        options: &OcrOptions,
    ) -> OcrResult<OcrPage> {
        let child = self.spawn(image_path, languages)?;
        let output = self.wait_with_timeout(child, options.timeout, options.cancel.as_deref())?;

        if !output.status.success() {
            return Err(OcrError::ProcessingFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        parse_tesseract_tsv(&tsv, options.min_confidence)
    }

    /// Runs the engine's orientation-and-script detection pass (`--psm 0`)
    /// and parses the `Rotate:` / `Orientation confidence:` report lines.
    fn detect_orientation(&self, image_path: &Path) -> Option<OrientationHint> {
        let output = Command::new(&self.binary)
            .arg(image_path)
            .arg("stdout")
            .arg("--psm")
            .arg("0")
            .output()
            .ok()?;
        let report = String::from_utf8_lossy(&output.stdout).into_owned()
            + &String::from_utf8_lossy(&output.stderr);
        parse_osd_report(&report)
    }

    fn engine_name(&self) -> &str {
        &self.binary
    }
}

fn parse_osd_report(report: &str) -> Option<OrientationHint> {
    let mut angle = None;
    let mut score = None;
    for line in report.lines() {
        if let Some(rest) = line.strip_prefix("Rotate:") {
            angle = rest.trim().parse::<i32>().ok();
        }
        if let Some(rest) = line.strip_prefix("Orientation confidence:") {
            score = rest.trim().parse::<f32>().ok();
        }
    }
    Some(OrientationHint {
        angle: angle?,
        score: score?,
    })
}

/// One row of tesseract's `--tsv` output.
struct TsvRow {
    level: u8,
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    conf: f32,
    text: String,
}

fn parse_tsv_row(line: &str) -> Option<TsvRow> {
    let cols: Vec<&str> = line.split('\t').collect();
    // level page_num block_num par_num line_num word_num left top width height conf text
    if cols.len() < 12 {
        return None;
    }
    Some(TsvRow {
        level: cols[0].parse().ok()?,
        left: cols[6].parse().ok()?,
        top: cols[7].parse().ok()?,
        width: cols[8].parse().ok()?,
        height: cols[9].parse().ok()?,
        conf: cols[10].parse::<f32>().ok()? / 100.0,
        text: cols[11].to_string(),
    })
}

/// Reconstructs the paragraph/line/word tree from a flat tesseract TSV
/// stream. Level 5 rows are words; their enclosing line/paragraph boxes are
/// derived as the union of their children's boxes (tesseract emits level
/// 3/4 summary rows too, but recomputing is simpler than trusting them and
/// keeps the page→word containment invariant true by construction).
fn parse_tesseract_tsv(tsv: &str, min_confidence: f32) -> OcrResult<OcrPage> {
    let mut max_right = 0.0_f64;
    let mut max_bottom = 0.0_f64;
    let mut words: Vec<Word> = Vec::new();

    for line in tsv.lines().skip(1) {
        let Some(row) = parse_tsv_row(line) else {
            continue;
        };
        if row.level != 5 || row.text.trim().is_empty() {
            continue;
        }
        if row.conf >= 0.0 && row.conf < min_confidence {
            continue;
        }
        let bbox = BoundingBox::new(row.left, row.top, row.left + row.width, row.top + row.height);
        max_right = max_right.max(bbox.right);
        max_bottom = max_bottom.max(bbox.bottom);

        let confidence = if row.conf >= 0.0 { Some(row.conf) } else { None };
        let mut word = Word::new(row.text, bbox)?;
        word.confidence = confidence;
        words.push(word);
    }

    if words.is_empty() {
        debug!("tesseract produced no words above the confidence floor");
        return Ok(OcrPage::empty(
            max_right.ceil() as u32,
            max_bottom.ceil() as u32,
            300.0,
        ));
    }

    // Group words into a single synthetic line/paragraph per contiguous run
    // sharing the same top coordinate within a small tolerance; this is a
    // simplification of tesseract's own line grouping, sufficient because
    // the renderer only needs correctly-nested boxes, not exact reading
    // structure beyond word order.
    let mut lines: Vec<Line> = Vec::new();
    let mut current: Vec<Word> = Vec::new();
    let mut current_top = words[0].bbox.top;

    for word in words {
        if (word.bbox.top - current_top).abs() > word.bbox.height().max(1.0) * 0.5
            && !current.is_empty()
        {
            lines.push(build_line(std::mem::take(&mut current)));
            current_top = word.bbox.top;
        }
        current_top = current_top.min(word.bbox.top);
        current.push(word);
    }
    if !current.is_empty() {
        lines.push(build_line(current));
    }

    let para_bbox = union_bbox(lines.iter().map(|l| l.bbox));
    let paragraph = Paragraph::new(para_bbox, lines)?;

    let width_px = max_right.ceil() as u32;
    let height_px = max_bottom.ceil() as u32;
    OcrPage::new(width_px, height_px, 300.0, vec![paragraph]).map_err(OcrError::from)
}

fn build_line(words: Vec<Word>) -> Line {
    let bbox = union_bbox(words.iter().map(|w| w.bbox));
    Line::new(bbox, words).expect("union bbox contains its own members")
}

fn union_bbox(boxes: impl Iterator<Item = BoundingBox>) -> BoundingBox {
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

/// Deterministic OCR provider for tests and CI, and as a documentation
/// example of the [`OcrProvider`] contract.
pub struct MockOcrProvider {
    text: String,
    confidence: f32,
}

impl MockOcrProvider {
    pub fn new() -> Self {
        Self {
            text: "Hello world".to_string(),
            confidence: 0.95,
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 0.95,
        }
    }
}

impl Default for MockOcrProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrProvider for MockOcrProvider {
    fn ocr(
        &self,
        _image_path: &Path,
        _languages: &[String],
        _options: &OcrOptions,
    ) -> OcrResult<OcrPage> {
        let mut x = 50.0;
        let y = 700.0;
        let mut words = Vec::new();
        for token in self.text.split_whitespace() {
            let width = token.len() as f64 * 12.0;
            let bbox = BoundingBox::new(x, y, x + width, y + 14.0);
            let mut word = Word::new(token, bbox)?;
            word.confidence = Some(self.confidence);
            words.push(word);
            x += width + 6.0;
        }
        if words.is_empty() {
            return Ok(OcrPage::empty(850, 1100, 300.0));
        }
        let line_bbox = union_bbox(words.iter().map(|w| w.bbox));
        let line = Line::new(line_bbox, words)?;
        let paragraph = Paragraph::new(line_bbox, vec![line])?;
        OcrPage::new(850, 1100, 300.0, vec![paragraph]).map_err(OcrError::from)
    }

    fn engine_name(&self) -> &str {
        "mock"
    }
}
