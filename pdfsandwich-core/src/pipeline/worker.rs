//! Worker pool and per-page processing
//!
//! A fixed pool of threads draws page jobs from a shared channel and
//! drives each page through its remaining states: rasterize, preprocess,
//! OCR, render, graft. Outcomes flow to the collector; the first fatal
//! error poisons the run, flips the cancel flag, and lets every worker
//! drain out at the next stage boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, debug_span, warn};

use crate::analysis::PageAnalysis;
use crate::collaborators::Collaborators;
use crate::document::Document;
use crate::error::{SandwichError, SandwichResult};
use crate::graft::{Grafter, ReplacementImage};
use crate::ocr::OcrOptions;
use crate::options::Options;
use crate::pipeline::progress::Progress;
use crate::pipeline::state::{OutcomeStatus, PageOutcome, PageState, PageTracker};
use crate::policy::PageAction;
use crate::preprocess::Preprocessor;
use crate::raster::RasterError;
use crate::textlayer::{TargetPage, TextLayerRenderer};
use crate::workdir::WorkingDir;

/// Read-only context shared by all workers.
pub struct PageContext {
    pub document: Arc<Document>,
    pub options: Options,
    pub collaborators: Collaborators,
    pub workdir: Arc<WorkingDir>,
    /// The input PDF materialized inside the working directory; this is
    /// what the rasterizer reads.
    pub origin_pdf: std::path::PathBuf,
    pub cancel: Arc<AtomicBool>,
    pub progress: Arc<Progress>,
}

/// One page's work order. `analysis_elapsed` is what the analysis phase
/// already spent on this page; it counts against the non-OCR budget.
pub struct PageJob {
    pub index: usize,
    pub action: PageAction,
    pub analysis: PageAnalysis,
    pub analysis_elapsed: Duration,
}

/// The per-page `non_ocr_timeout` ledger: analyze, rasterize, preprocess,
/// render and graft all draw from one budget, while the OCR wait is
/// credited back afterwards so only `ocr_timeout` bounds the engine.
struct NonOcrBudget<'a> {
    deadline: Instant,
    cancel: &'a AtomicBool,
    index: usize,
}

impl<'a> NonOcrBudget<'a> {
    fn new(total: Duration, already_spent: Duration, cancel: &'a AtomicBool, index: usize) -> Self {
        Self {
            deadline: Instant::now() + total.saturating_sub(already_spent),
            cancel,
            index,
        }
    }

    fn check(&self, stage: &str) -> SandwichResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SandwichError::Cancelled);
        }
        if Instant::now() > self.deadline {
            return Err(SandwichError::Other(format!(
                "page {} exceeded the non-OCR timeout during {stage}",
                self.index
            )));
        }
        Ok(())
    }

    /// Moves the deadline out by time spent in a stage the budget does
    /// not cover.
    fn credit(&mut self, elapsed: Duration) {
        self.deadline += elapsed;
    }
}

enum WorkerMessage {
    Job(PageJob),
    Shutdown,
}

/// Drives `jobs` through `worker_count` threads; outcomes are sent to
/// `outcome_tx` as pages finish, in arbitrary order. Returns the first
/// fatal error, if any.
pub fn run_pool(
    ctx: Arc<PageContext>,
    jobs: Vec<PageJob>,
    worker_count: usize,
    outcome_tx: mpsc::Sender<PageOutcome>,
) -> Option<SandwichError> {
    let (job_tx, job_rx) = mpsc::channel::<WorkerMessage>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let fatal: Arc<Mutex<Option<SandwichError>>> = Arc::new(Mutex::new(None));

    let worker_count = worker_count.max(1).min(jobs.len().max(1));
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let job_rx = Arc::clone(&job_rx);
        let ctx = Arc::clone(&ctx);
        let outcome_tx = outcome_tx.clone();
        let fatal = Arc::clone(&fatal);
        handles.push(thread::spawn(move || loop {
            let message = {
                let guard = job_rx.lock().expect("job queue lock");
                guard.recv()
            };
            let Ok(WorkerMessage::Job(job)) = message else {
                break;
            };
            if ctx.cancel.load(Ordering::SeqCst) {
                continue; // drain without processing
            }
            let span = debug_span!("page", index = job.index, worker = worker_id);
            let _enter = span.enter();
            match process_page(&ctx, job) {
                Ok(outcome) => {
                    ctx.progress.page_completed();
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // First fatal error wins; everyone else winds down.
                    let mut slot = fatal.lock().expect("fatal slot lock");
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    ctx.cancel.store(true, Ordering::SeqCst);
                }
            }
        }));
    }

    for job in jobs {
        if job_tx.send(WorkerMessage::Job(job)).is_err() {
            break;
        }
    }
    for _ in 0..worker_count {
        let _ = job_tx.send(WorkerMessage::Shutdown);
    }
    drop(job_tx);
    for handle in handles {
        let _ = handle.join();
    }

    Arc::try_unwrap(fatal)
        .map(|m| m.into_inner().expect("fatal slot lock"))
        .unwrap_or(None)
}

/// Runs one page through its post-decision stages.
fn process_page(ctx: &PageContext, job: PageJob) -> SandwichResult<PageOutcome> {
    let mut tracker = PageTracker::new(job.index);
    tracker.advance(PageState::Analyzing);
    tracker.advance(PageState::Decided);

    match &job.action {
        PageAction::Skip | PageAction::CopyOnly => {
            tracker.advance(PageState::Done);
            Ok(PageOutcome::copied(job.index))
        }
        PageAction::Reject { .. } => unreachable!("rejects abort before the pool runs"),
        PageAction::RasterizeAndOcr {
            preprocess,
            rasterize_dpi,
        } => ocr_page(
            ctx,
            &mut tracker,
            job.index,
            &job.analysis,
            job.analysis_elapsed,
            preprocess.clone(),
            *rasterize_dpi,
            false,
        ),
        PageAction::RedoOcr { rasterize_dpi } => ocr_page(
            ctx,
            &mut tracker,
            job.index,
            &job.analysis,
            job.analysis_elapsed,
            crate::policy::PreprocessPlan::default(),
            *rasterize_dpi,
            true,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn ocr_page(
    ctx: &PageContext,
    tracker: &mut PageTracker,
    index: usize,
    analysis: &PageAnalysis,
    analysis_elapsed: Duration,
    plan: crate::policy::PreprocessPlan,
    dpi: u32,
    redo: bool,
) -> SandwichResult<PageOutcome> {
    let mut budget = NonOcrBudget::new(
        Duration::from_secs_f64(ctx.options.non_ocr_timeout),
        analysis_elapsed,
        &ctx.cancel,
        index,
    );

    // Rasterize. The redo path first writes a single-page PDF with all
    // text removed so the raster hands the OCR engine a page where the
    // existing visible text is masked out.
    tracker.advance(PageState::Rasterizing);
    budget.check("rasterize")?;
    let raster_path = ctx.workdir.page_file(index, "rasterize", "png")?;
    let (raster_source, stripped_content) = if redo {
        let stripped = crate::graft::strip_invisible_text(&ctx.document.content_bytes(index)?)?;
        let masked = crate::graft::mask_all_text(&stripped)?;
        let masked_pdf = ctx.workdir.page_file(index, "mask", "pdf")?;
        write_single_page_override(&ctx.document, index, &masked, &masked_pdf)?;
        (masked_pdf, Some(stripped))
    } else {
        (ctx.origin_pdf.clone(), None)
    };
    // The masked temp PDF holds a single page; the original keeps its
    // native index.
    let raster_page = if redo { 1 } else { index };
    match ctx
        .collaborators
        .rasterizer
        .rasterize(&raster_source, raster_page, dpi, &raster_path)
    {
        Ok(()) => {}
        Err(RasterError::NotAvailable(msg)) => {
            return Err(SandwichError::MissingDependency(msg));
        }
        Err(RasterError::Transient(msg)) if ctx.options.continue_on_soft_render_error => {
            warn!(page = index, error = %msg, "render failed, passing page through");
            ctx.progress.page_downgraded();
            return Ok(PageOutcome {
                index,
                status: OutcomeStatus::SoftFailed(msg),
                result: None,
                sidecar_text: String::new(),
            });
        }
        Err(other) => return Err(SandwichError::ChildProcessError(other.to_string())),
    }

    // Preprocess.
    budget.check("preprocess")?;
    let orientation = if plan
        .steps()
        .contains(&crate::policy::PreprocessStep::Rotate)
    {
        ctx.collaborators
            .ocr
            .detect_orientation(&raster_path)
            .or(analysis.orientation)
    } else {
        None
    };
    let cleaner = ctx.collaborators.cleaner.as_deref();
    let preprocessed = Preprocessor::new(cleaner, ctx.options.rotate_pages_threshold)
        .run(&plan, &raster_path, orientation, &ctx.workdir, index)
        .map_err(|e| SandwichError::ChildProcessError(e.to_string()))?;

    // OCR. Only `ocr_timeout` bounds this stage; its wall-clock time is
    // credited back to the non-OCR budget afterwards.
    tracker.advance(PageState::OcrRunning);
    budget.check("ocr")?;
    let ocr_options = OcrOptions {
        timeout: Duration::from_secs_f64(ctx.options.ocr_timeout),
        cancel: Some(Arc::clone(&ctx.cancel)),
        ..Default::default()
    };
    let ocr_started = Instant::now();
    let ocr_result = ctx.collaborators.ocr.ocr(
        &preprocessed.ocr_image,
        &ctx.options.languages,
        &ocr_options,
    );
    budget.credit(ocr_started.elapsed());
    let mut recognized = match ocr_result {
        Ok(page) => page,
        Err(crate::ocr::OcrError::Cancelled) => return Err(SandwichError::Cancelled),
        Err(crate::ocr::OcrError::Timeout(elapsed)) => {
            warn!(page = index, ?elapsed, "OCR timed out, passing page through");
            tracker.advance(PageState::TimedOut);
            ctx.progress.page_downgraded();
            return Ok(PageOutcome::copied(index));
        }
        Err(err) if ctx.options.continue_on_soft_render_error => {
            warn!(page = index, error = %err, "OCR failed, passing page through");
            ctx.progress.page_downgraded();
            return Ok(PageOutcome {
                index,
                status: OutcomeStatus::SoftFailed(err.to_string()),
                result: None,
                sidecar_text: String::new(),
            });
        }
        Err(err) => return Err(SandwichError::ChildProcessError(err.to_string())),
    };
    // The engine reports geometry against its own raster; trust the
    // pipeline's DPI so box conversion matches the page size.
    recognized.dpi = dpi as f64;
    std::fs::write(
        ctx.workdir.page_file(index, "ocr_tess", "txt")?,
        recognized.plain_text(),
    )?;
    ctx.progress.page_ocr_done();

    // Render the invisible layer.
    tracker.advance(PageState::Rendering);
    budget.check("render")?;
    let mediabox = ctx.document.mediabox(index);
    let rotation = ctx.document.rotation(index);
    let (width_pt, height_pt) = if rotation == 90 || rotation == 270 {
        (mediabox.height(), mediabox.width())
    } else {
        (mediabox.width(), mediabox.height())
    };
    let grafter = Grafter::new(&ctx.document);
    let font_name = grafter.unique_font_name(index);
    let layer = TextLayerRenderer::new(TargetPage {
        width_pt,
        height_pt,
    })
    .render(&recognized, &font_name, ctx.document.graft_id_base(index));

    // Graft.
    tracker.advance(PageState::Grafting);
    budget.check("graft")?;
    let replacement = match preprocessed.output_image.as_deref() {
        Some(path) => Some(encode_replacement(path)?),
        None => None,
    };
    let sidecar_text = recognized.plain_text();
    let result = grafter
        .graft(
            index,
            &layer,
            replacement.as_ref(),
            stripped_content,
            sidecar_text.clone(),
        )
        .map_err(SandwichError::Pdf)?;

    tracker.advance(PageState::Done);
    debug!(page = index, words = recognized.words_in_reading_order().len(), "page grafted");
    Ok(PageOutcome {
        index,
        status: OutcomeStatus::Grafted,
        result: Some(result),
        sidecar_text,
    })
}

/// Writes a one-page PDF whose single page is `page_index` of `document`
/// with its content replaced; the rasterizer consumes it for the redo
/// path.
fn write_single_page_override(
    document: &Document,
    page_index: usize,
    content: &[u8],
    path: &std::path::Path,
) -> SandwichResult<()> {
    use crate::objects::{ObjectId, PdfArray, PdfDictionary, PdfObject, PdfStream};
    use std::collections::BTreeMap;

    let mut objects: BTreeMap<ObjectId, PdfObject> = document.objects().clone();
    let page_id = document
        .page_id(page_index)
        .ok_or_else(|| SandwichError::Other(format!("no page {page_index}")))?;

    let content_id = ObjectId::new(document.max_object_number() + 1, 0);
    let mut stream_dict = PdfDictionary::new();
    stream_dict.insert("Length", PdfObject::Integer(content.len() as i64));
    objects.insert(
        content_id,
        PdfObject::Stream(PdfStream::new(stream_dict, content.to_vec())),
    );

    let mut page = document
        .page_dict(page_index)
        .ok_or_else(|| SandwichError::Other(format!("no page {page_index}")))?
        .clone();
    page.insert("Contents", PdfObject::Reference(content_id));
    // Re-parenting severs page-tree inheritance; materialize the
    // attributes the page may have been inheriting.
    for key in ["Resources", "MediaBox", "Rotate", "CropBox"] {
        if !page.contains_key(key) {
            if let Some(value) = document.page_attr(page_index, key) {
                page.insert(key, value.clone());
            }
        }
    }
    objects.insert(page_id, PdfObject::Dictionary(page));

    // A single-page tree keeps the rasterizer call at page 1.
    let pages_id = ObjectId::new(document.max_object_number() + 2, 0);
    let catalog_id = ObjectId::new(document.max_object_number() + 3, 0);
    let mut kids = PdfArray::new();
    kids.push(PdfObject::Reference(page_id));
    let mut pages = PdfDictionary::new();
    pages.insert("Type", PdfObject::name("Pages"));
    pages.insert("Count", PdfObject::Integer(1));
    pages.insert("Kids", PdfObject::Array(kids));
    objects.insert(pages_id, PdfObject::Dictionary(pages));
    if let Some(mut page_obj) = objects.get(&page_id).and_then(|o| o.as_dict()).cloned() {
        page_obj.insert("Parent", PdfObject::Reference(pages_id));
        objects.insert(page_id, PdfObject::Dictionary(page_obj));
    }
    let mut catalog = PdfDictionary::new();
    catalog.insert("Type", PdfObject::name("Catalog"));
    catalog.insert("Pages", PdfObject::Reference(pages_id));
    objects.insert(catalog_id, PdfObject::Dictionary(catalog));

    let mut trailer = PdfDictionary::new();
    trailer.insert("Root", PdfObject::Reference(catalog_id));
    let bytes = crate::writer::write_document(&objects, &trailer, document.version())
        .map_err(SandwichError::Pdf)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Encodes a preprocessed PNG as a grayscale flate image for grafting;
/// the optimizer may transcode it further later.
fn encode_replacement(path: &std::path::Path) -> SandwichResult<ReplacementImage> {
    let image = image::open(path)
        .map_err(|e| SandwichError::Other(format!("replacement image decode: {e}")))?
        .into_luma8();
    let (width, height) = image.dimensions();
    let data = crate::compression::compress(image.as_raw()).map_err(SandwichError::Pdf)?;
    Ok(ReplacementImage {
        width_px: width,
        height_px: height,
        data,
        filter: Some("FlateDecode".to_string()),
        colorspace: "DeviceGray".to_string(),
        bits_per_component: 8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::testing::scanned_page_pdf;

    fn context(mut options: Options) -> Arc<PageContext> {
        options.max_raster_dpi = 72;
        let document = Arc::new(Document::from_bytes(scanned_page_pdf(2)).unwrap());
        let workdir = Arc::new(WorkingDir::create(document.page_count(), false).unwrap());
        let origin_pdf = workdir.root().join("origin.pdf");
        std::fs::write(&origin_pdf, document.bytes()).unwrap();
        Arc::new(PageContext {
            document,
            options,
            collaborators: Collaborators::mock(),
            workdir,
            origin_pdf,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(Progress::new(2)),
        })
    }

    fn ocr_job(ctx: &PageContext, index: usize) -> PageJob {
        let analysis = crate::analysis::PageAnalyzer::new(
            &ctx.document,
            ctx.options.analysis_options(),
        )
        .analyze(index);
        let action = crate::policy::decide(&analysis, &ctx.options, index);
        PageJob {
            index,
            action,
            analysis,
            analysis_elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_pool_processes_all_pages() {
        let ctx = context(Options {
            oversample: Some(50),
            ..Default::default()
        });
        let jobs: Vec<PageJob> = (1..=2).map(|i| ocr_job(&ctx, i)).collect();
        let (tx, rx) = mpsc::channel();
        let fatal = run_pool(Arc::clone(&ctx), jobs, 2, tx);
        assert!(fatal.is_none());
        let mut outcomes: Vec<PageOutcome> = rx.iter().collect();
        outcomes.sort_by_key(|o| o.index);
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].status, OutcomeStatus::Grafted));
        assert_eq!(outcomes[0].sidecar_text, "Hello world");
    }

    #[test]
    fn test_cancelled_run_drains_without_outcomes() {
        let ctx = context(Options::default());
        ctx.cancel.store(true, Ordering::SeqCst);
        let jobs: Vec<PageJob> = (1..=2).map(|i| ocr_job(&ctx, i)).collect();
        let (tx, rx) = mpsc::channel();
        let fatal = run_pool(Arc::clone(&ctx), jobs, 2, tx);
        assert!(fatal.is_none());
        assert_eq!(rx.iter().count(), 0);
    }

    #[test]
    fn test_copy_only_job_produces_copied_outcome() {
        let ctx = context(Options {
            ocr_timeout: 0.0,
            ..Default::default()
        });
        let jobs = vec![ocr_job(&ctx, 1)];
        let (tx, rx) = mpsc::channel();
        run_pool(Arc::clone(&ctx), jobs, 1, tx);
        let outcome = rx.iter().next().unwrap();
        assert!(matches!(outcome.status, OutcomeStatus::Copied));
        assert!(outcome.result.is_none());
    }

    /// An OCR engine stalling within its own timeout must not eat the
    /// non-OCR budget of the stages after it.
    struct SlowOcr(Duration);

    impl crate::ocr::OcrProvider for SlowOcr {
        fn ocr(
            &self,
            image_path: &std::path::Path,
            languages: &[String],
            options: &crate::ocr::OcrOptions,
        ) -> crate::ocr::OcrResult<crate::ocr::OcrPage> {
            std::thread::sleep(self.0);
            crate::ocr::MockOcrProvider::new().ocr(image_path, languages, options)
        }

        fn engine_name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn test_ocr_time_does_not_count_against_non_ocr_budget() {
        let mut ctx = context(Options {
            non_ocr_timeout: 1.0,
            ..Default::default()
        });
        let slow = Collaborators::mock().with_ocr(Arc::new(SlowOcr(Duration::from_millis(1500))));
        Arc::get_mut(&mut ctx).unwrap().collaborators = slow;

        let jobs = vec![ocr_job(&ctx, 1)];
        let (tx, rx) = mpsc::channel();
        let fatal = run_pool(Arc::clone(&ctx), jobs, 1, tx);
        assert!(fatal.is_none(), "slow OCR was charged to the non-OCR budget");
        let outcome = rx.iter().next().unwrap();
        assert!(matches!(outcome.status, OutcomeStatus::Grafted));
    }

    #[test]
    fn test_analysis_time_counts_against_non_ocr_budget() {
        let ctx = context(Options {
            non_ocr_timeout: 1.0,
            ..Default::default()
        });
        let mut job = ocr_job(&ctx, 1);
        job.analysis_elapsed = Duration::from_secs(5);
        let (tx, rx) = mpsc::channel();
        let fatal = run_pool(Arc::clone(&ctx), vec![job], 1, tx);
        drop(rx);
        let err = fatal.expect("analysis overrun must be fatal");
        assert!(err.to_string().contains("non-OCR timeout"));
    }
}
