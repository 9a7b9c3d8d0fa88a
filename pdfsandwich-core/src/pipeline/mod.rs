//! Pipeline engine
//!
//! Drives a whole document through the page state machine with bounded
//! parallelism: open and gate-check the input, analyze every page in
//! parallel, decide actions, run the OCR stages through the worker pool,
//! and hand outcomes to the assembler's single writer. One cooperative
//! cancel flag is polled at every stage boundary; a fatal error flips it
//! so the other workers wind down before the error surfaces.

pub mod progress;
pub mod state;
pub mod worker;

pub use progress::{Progress, ProgressCallback, ProgressSnapshot};
pub use state::{OutcomeStatus, PageOutcome, PageState, PageTracker};
pub use worker::{PageContext, PageJob};

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug_span, info, warn};

use crate::analysis::{PageAnalysis, PageAnalyzer};
use crate::assemble::{self, PdfAssembler};
use crate::collaborators::Collaborators;
use crate::document::Document;
use crate::error::{SandwichError, SandwichResult};
use crate::optimize::OptimizeReport;
use crate::options::Options;
use crate::policy::{self, PageAction, RejectReason};
use crate::workdir::WorkingDir;

/// End-of-run accounting.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub pages_total: usize,
    pub pages_grafted: usize,
    pub pages_copied: usize,
    pub pages_soft_failed: usize,
    pub input_bytes: u64,
    pub output_bytes: Option<u64>,
    pub optimize: OptimizeReport,
}

pub struct PipelineEngine {
    options: Options,
    collaborators: Collaborators,
    cancel: Arc<AtomicBool>,
    progress_callback: Option<Arc<dyn ProgressCallback>>,
}

impl PipelineEngine {
    pub fn new(options: Options, collaborators: Collaborators) -> SandwichResult<Self> {
        options.validate()?;
        Ok(Self {
            options,
            collaborators,
            cancel: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
        })
    }

    /// The cooperative cancel flag; the CLI's signal handler stores into
    /// it, workers poll it at stage boundaries.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn with_progress_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// File-to-file entry point. On fatal failure the output file is
    /// removed, except for the two taxonomy entries whose partial result
    /// stays useful.
    pub fn run(&self, input: &Path, output: Option<&Path>) -> SandwichResult<RunSummary> {
        let bytes = std::fs::read(input)?;
        let result = self.run_bytes(bytes);
        match result {
            Ok((output_bytes, mut summary)) => {
                if let (Some(path), Some(bytes)) = (output, &output_bytes) {
                    std::fs::write(path, bytes)?;
                    summary.output_bytes = Some(bytes.len() as u64);
                }
                Ok(summary)
            }
            Err(err) => {
                if let Some(path) = output {
                    if !err.retains_output() && path.exists() {
                        let _ = std::fs::remove_file(path);
                    }
                }
                Err(err)
            }
        }
    }

    /// In-memory entry point used by the CLI's stdin/stdout mode and the
    /// tests. Returns the output bytes (unless `--output-type none`) and
    /// the summary.
    pub fn run_bytes(&self, input: Vec<u8>) -> SandwichResult<(Option<Vec<u8>>, RunSummary)> {
        self.collaborators.require_for(&self.options)?;

        let input_len = input.len() as u64;
        let document = Arc::new(Document::from_bytes(input)?);

        if document.is_encrypted() {
            return Err(SandwichError::Encrypted);
        }
        if document.is_signed() && !self.options.invalidate_digital_signatures {
            return Err(SandwichError::Signed);
        }

        let page_count = document.page_count();
        if let Some(pages) = &self.options.pages {
            if pages.max_page() > page_count {
                return Err(SandwichError::BadArguments(format!(
                    "--pages selects page {} but the document has {page_count}",
                    pages.max_page()
                )));
            }
        }
        info!(pages = page_count, "document opened");

        let workdir = Arc::new(WorkingDir::create(
            page_count,
            self.options.keep_temporary_files,
        )?);
        let origin_pdf = workdir.root().join("origin.pdf");
        std::fs::write(&origin_pdf, document.bytes())?;

        let progress = Arc::new(Progress::new(page_count));
        let reporter = self.progress_callback.as_ref().map(|callback| {
            Progress::spawn_reporter(
                Arc::clone(&progress),
                Arc::clone(callback),
                Arc::clone(&self.cancel),
                Duration::from_millis(100),
            )
        });

        let run_result = self.run_pipeline(
            Arc::clone(&document),
            Arc::clone(&workdir),
            origin_pdf,
            Arc::clone(&progress),
        );

        if let Some(handle) = reporter {
            // The reporter exits on completion or cancel; a failed run
            // flips cancel, so this join cannot hang.
            self.cancel_if_err(&run_result);
            let _ = handle.join();
        }

        let (output_bytes, report, counts, sidecar_pages) = run_result?;

        if let Some(path) = &self.options.sidecar {
            assemble::write_sidecar(path, &sidecar_pages)?;
        }

        if let Some(bytes) = &output_bytes {
            let ratio = bytes.len() as f64 / input_len.max(1) as f64;
            if ratio > 1.0 {
                warn!(ratio, "output is larger than the input");
            }
        }

        match Arc::try_unwrap(workdir) {
            Ok(wd) => wd.finish()?,
            Err(_) => warn!("working directory still referenced at shutdown"),
        }

        let summary = RunSummary {
            pages_total: page_count,
            pages_grafted: counts.grafted,
            pages_copied: counts.copied,
            pages_soft_failed: counts.soft_failed,
            input_bytes: input_len,
            output_bytes: output_bytes.as_ref().map(|b| b.len() as u64),
            optimize: report,
        };
        Ok((output_bytes, summary))
    }

    fn cancel_if_err<T>(&self, result: &SandwichResult<T>) {
        if result.is_err() {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_pipeline(
        &self,
        document: Arc<Document>,
        workdir: Arc<WorkingDir>,
        origin_pdf: std::path::PathBuf,
        progress: Arc<Progress>,
    ) -> SandwichResult<(
        Option<Vec<u8>>,
        OptimizeReport,
        crate::assemble::AssembleCounts,
        Vec<String>,
    )> {
        // Phase 1: analyze every page in parallel. The per-page analysis
        // time is carried forward; it draws from the same non-OCR budget
        // as the later stages.
        let analyses = self.analyze_all(&document, &progress)?;
        let mut handles = document.page_handles();

        // Phase 2: policy decisions; any rejection aborts before output.
        let mut jobs = Vec::with_capacity(handles.len());
        for (handle, (analysis, analysis_elapsed)) in handles.iter_mut().zip(analyses) {
            let action = policy::decide(&analysis, &self.options, handle.index);
            match &action {
                PageAction::Reject {
                    reason: RejectReason::AlreadyHasText,
                } => {
                    return Err(SandwichError::AlreadyHasText(handle.index));
                }
                PageAction::Reject {
                    reason: RejectReason::XfaDynamic,
                } => {
                    return Err(SandwichError::Other(format!(
                        "page {} belongs to an XFA dynamic form, which cannot be processed",
                        handle.index
                    )));
                }
                _ => {}
            }
            handle.action = Some(action.clone());
            jobs.push(PageJob {
                index: handle.index,
                action,
                analysis,
                analysis_elapsed,
            });
        }

        // Phase 3: the worker pool feeds the collector, which is the only
        // writer of the output arena.
        let (outcome_tx, outcome_rx) = mpsc::channel();
        let collector = {
            let document = Arc::clone(&document);
            let options = self.options.clone();
            std::thread::spawn(move || {
                PdfAssembler::new(&document, &options).collect(outcome_rx)
            })
        };

        let ctx = Arc::new(PageContext {
            document: Arc::clone(&document),
            options: self.options.clone(),
            collaborators: self.collaborators.clone(),
            workdir,
            origin_pdf,
            cancel: Arc::clone(&self.cancel),
            progress,
        });
        let fatal = worker::run_pool(ctx, jobs, self.options.effective_jobs(), outcome_tx);

        let collected = collector
            .join()
            .map_err(|_| SandwichError::Other("collector thread panicked".to_string()))?;

        if let Some(err) = fatal {
            return Err(err);
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SandwichError::Cancelled);
        }
        let assembled = collected?;
        let sidecar_pages = assembled.sidecar_pages.clone();
        let counts = assembled.counts.clone();

        let scratch = tempfile::tempdir().map_err(SandwichError::FileAccess)?;
        let (output_bytes, report) = assemble::finalize(
            assembled,
            &self.collaborators,
            &self.options,
            scratch.path(),
        )?;
        Ok((output_bytes, report, counts, sidecar_pages))
    }

    /// Embarrassingly-parallel analysis over a shared index counter.
    /// Returns each page's analysis plus the time it took, so the worker
    /// can charge it against the page's non-OCR budget.
    fn analyze_all(
        &self,
        document: &Arc<Document>,
        progress: &Arc<Progress>,
    ) -> SandwichResult<Vec<(PageAnalysis, Duration)>> {
        let page_count = document.page_count();
        let results: Mutex<Vec<Option<(PageAnalysis, Duration)>>> =
            Mutex::new(vec![None; page_count]);
        let next = AtomicUsize::new(0);
        let workers = self.options.effective_jobs().min(page_count.max(1));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let analyzer = PageAnalyzer::new(document, self.options.analysis_options());
                    loop {
                        if self.cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        if i >= page_count {
                            break;
                        }
                        let span = debug_span!("analyze", page = i + 1);
                        let _enter = span.enter();
                        let started = Instant::now();
                        let analysis = analyzer.analyze(i + 1);
                        progress.page_analyzed();
                        results.lock().expect("analysis results lock")[i] =
                            Some((analysis, started.elapsed()));
                    }
                });
            }
        });

        if self.cancel.load(Ordering::SeqCst) {
            return Err(SandwichError::Cancelled);
        }
        let results = results.into_inner().expect("analysis results lock");
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SandwichError::Other("analysis phase incomplete".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OutputType;
    use crate::writer::testing::{mixed_pdf, scanned_page_pdf};

    fn options() -> Options {
        Options {
            output_type: OutputType::Pdf,
            timestamp: Some("D:20260801000000Z".to_string()),
            // Small rasters keep the mock pipeline fast.
            max_raster_dpi: 72,
            ..Default::default()
        }
    }

    fn engine(options: Options) -> PipelineEngine {
        PipelineEngine::new(options, Collaborators::mock()).unwrap()
    }

    #[test]
    fn test_full_run_grafts_scanned_pages() {
        let (bytes, summary) = engine(options())
            .run_bytes(scanned_page_pdf(2))
            .unwrap();
        assert_eq!(summary.pages_total, 2);
        assert_eq!(summary.pages_grafted, 2);
        let out = Document::from_bytes(bytes.unwrap()).unwrap();
        assert_eq!(out.page_count(), 2);
    }

    #[test]
    fn test_existing_text_exits_six() {
        let err = engine(options())
            .run_bytes(mixed_pdf(3, &[1]))
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_skip_text_processes_remaining_pages() {
        let opts = Options {
            skip_text: true,
            ..options()
        };
        let (bytes, summary) = engine(opts).run_bytes(mixed_pdf(3, &[1])).unwrap();
        assert_eq!(summary.pages_grafted, 2);
        assert_eq!(summary.pages_copied, 1);
        assert_eq!(Document::from_bytes(bytes.unwrap()).unwrap().page_count(), 3);
    }

    #[test]
    fn test_cancel_before_run_reports_cancelled() {
        let engine = engine(options());
        engine.cancel_flag().store(true, Ordering::SeqCst);
        let err = engine.run_bytes(scanned_page_pdf(2)).unwrap_err();
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn test_output_identical_across_job_counts() {
        let mut first = None;
        for jobs in [1usize, 2, 4] {
            let opts = Options {
                jobs: Some(jobs),
                ..options()
            };
            let (bytes, _) = engine(opts).run_bytes(scanned_page_pdf(4)).unwrap();
            let bytes = bytes.unwrap();
            match &first {
                None => first = Some(bytes),
                Some(reference) => assert_eq!(reference, &bytes, "jobs={jobs} differs"),
            }
        }
    }

    #[test]
    fn test_page_range_beyond_document_is_bad_args() {
        let opts = Options {
            pages: Some(crate::options::PageRangeSet::parse("5").unwrap()),
            ..options()
        };
        let err = engine(opts).run_bytes(scanned_page_pdf(2)).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
