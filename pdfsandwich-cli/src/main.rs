//! pdfsandwich command-line interface
//!
//! A thin front-end over `pdfsandwich-core`: parses arguments, merges the
//! optional TOML config file, wires the external collaborators, installs
//! the Ctrl-C handler, and maps every error onto the stable exit-code
//! table. All diagnostics go to stderr; stdout is reserved for the output
//! PDF when the output operand is `-`.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pdfsandwich_core::collaborators::Collaborators;
use pdfsandwich_core::options::{Options, OutputType, PageRangeSet};
use pdfsandwich_core::pipeline::{PipelineEngine, ProgressSnapshot};
use pdfsandwich_core::{SandwichError, SandwichResult};

#[derive(Parser, Debug)]
#[command(
    name = "pdfsandwich",
    version,
    about = "Add an invisible, selectable OCR text layer to scanned PDFs",
    disable_help_subcommand = true
)]
struct Cli {
    /// Input PDF, or '-' for stdin
    input: String,

    /// Output PDF, or '-' for stdout
    output: String,

    /// Number of parallel page workers
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,

    /// OCR languages, engine syntax ('eng', 'deu+eng', ...)
    #[arg(long, short = 'l', value_name = "LANG")]
    language: Option<String>,

    /// Leave pages that already have text untouched, OCR the rest
    #[arg(long)]
    skip_text: bool,

    /// Rasterize every page and OCR it, discarding existing text
    #[arg(long)]
    force_ocr: bool,

    /// Strip previous OCR text layers and run OCR again
    #[arg(long)]
    redo_ocr: bool,

    /// Correct page orientation using the OCR engine's detector
    #[arg(long)]
    rotate_pages: bool,

    /// Minimum detector confidence before a page is rotated
    #[arg(long, value_name = "F")]
    rotate_pages_threshold: Option<f32>,

    /// Straighten skewed pages
    #[arg(long)]
    deskew: bool,

    /// Normalize away scanner background tint
    #[arg(long)]
    remove_background: bool,

    /// Clean the page image before OCR (OCR input only)
    #[arg(long)]
    clean: bool,

    /// Clean the page image and keep the cleaned version in the output
    #[arg(long)]
    clean_final: bool,

    /// Minimum rasterization DPI
    #[arg(long, value_name = "DPI")]
    oversample: Option<u32>,

    /// Skip OCR on pages whose largest image exceeds this many megapixels
    #[arg(long, value_name = "MPIX")]
    skip_big: Option<f64>,

    /// Per-page OCR time limit in seconds (0 disables OCR)
    #[arg(long, value_name = "S")]
    ocr_timeout: Option<f64>,

    /// Per-page limit on all non-OCR work in seconds
    #[arg(long, value_name = "S")]
    non_ocr_timeout: Option<f64>,

    /// Output profile: pdf, pdfa, pdfa-1, pdfa-2, pdfa-3, none
    #[arg(long, value_name = "TYPE")]
    output_type: Option<String>,

    /// Image optimization level, 0 (off) to 3 (aggressive)
    #[arg(long, short = 'O', value_name = "N")]
    optimize: Option<u8>,

    /// Linearize for fast web view when the output exceeds SIZE megabytes
    #[arg(long, value_name = "SIZE")]
    fast_web_view: Option<f64>,

    /// Process only these pages, e.g. '1-3,7'
    #[arg(long, value_name = "RANGE")]
    pages: Option<String>,

    /// Write the recognized plain text to FILE
    #[arg(long, value_name = "FILE")]
    sidecar: Option<PathBuf>,

    /// Keep the working directory and report its path
    #[arg(long)]
    keep_temporary_files: bool,

    /// Process PDFs whose digital signatures would be invalidated
    #[arg(long)]
    invalidate_digital_signatures: bool,

    /// Pass pages through instead of failing when rendering or OCR breaks
    #[arg(long)]
    continue_on_soft_render_error: bool,

    /// Load option defaults from a TOML file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Errors only
    #[arg(long, short = 'q')]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap's help/version go to stdout with success; argument
            // errors map to the contract's exit 1.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(1);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code().clamp(0, 255) as u8)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> SandwichResult<()> {
    let options = build_options(&cli)?;
    let writes_output = options.output_type != OutputType::None;
    let engine = PipelineEngine::new(options, Collaborators::detect())?;

    let cancel = engine.cancel_flag();
    ctrlc::set_handler(move || {
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .map_err(|e| SandwichError::Other(format!("cannot install signal handler: {e}")))?;

    let engine = if cli.quiet {
        engine
    } else {
        engine.with_progress_callback(Arc::new(|snapshot: &ProgressSnapshot| {
            if snapshot.total_pages > 0 {
                eprint!(
                    "\r{}/{} pages ({:.0}%)",
                    snapshot.completed,
                    snapshot.total_pages,
                    snapshot.percentage()
                );
                if snapshot.is_complete() {
                    eprintln!();
                }
                let _ = std::io::stderr().flush();
            }
        }))
    };

    let summary = if cli.input == "-" || cli.output == "-" {
        let input = if cli.input == "-" {
            let mut bytes = Vec::new();
            std::io::stdin().read_to_end(&mut bytes)?;
            bytes
        } else {
            std::fs::read(&cli.input)?
        };
        let (output_bytes, summary) = engine.run_bytes(input)?;
        if let Some(bytes) = output_bytes {
            if cli.output == "-" {
                std::io::stdout().write_all(&bytes)?;
            } else {
                std::fs::write(&cli.output, &bytes)?;
            }
        }
        summary
    } else {
        let output_path = writes_output.then(|| PathBuf::from(&cli.output));
        engine.run(std::path::Path::new(&cli.input), output_path.as_deref())?
    };

    info!(
        pages = summary.pages_total,
        grafted = summary.pages_grafted,
        copied = summary.pages_copied,
        "finished"
    );
    if summary.optimize.images_replaced > 0 {
        info!(
            images = summary.optimize.images_replaced,
            ratio = format!("{:.2}", summary.optimize.ratio()),
            "images re-encoded"
        );
    }
    Ok(())
}

/// Config file first, explicit flags on top.
fn build_options(cli: &Cli) -> SandwichResult<Options> {
    let mut options = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str::<Options>(&text)
                .map_err(|e| SandwichError::InvalidConfig(format!("{}: {e}", path.display())))?
        }
        None => Options::default(),
    };

    if let Some(jobs) = cli.jobs {
        options.jobs = Some(jobs);
    }
    if let Some(language) = &cli.language {
        options.languages = language.split('+').map(str::to_string).collect();
    }
    options.skip_text |= cli.skip_text;
    options.force_ocr |= cli.force_ocr;
    options.redo_ocr |= cli.redo_ocr;
    options.rotate_pages |= cli.rotate_pages;
    if let Some(threshold) = cli.rotate_pages_threshold {
        options.rotate_pages_threshold = threshold;
    }
    options.deskew |= cli.deskew;
    options.remove_background |= cli.remove_background;
    options.clean |= cli.clean;
    options.clean_final |= cli.clean_final;
    if cli.oversample.is_some() {
        options.oversample = cli.oversample;
    }
    if cli.skip_big.is_some() {
        options.skip_big_mpix = cli.skip_big;
    }
    if let Some(timeout) = cli.ocr_timeout {
        options.ocr_timeout = timeout;
    }
    if let Some(timeout) = cli.non_ocr_timeout {
        options.non_ocr_timeout = timeout;
    }
    if let Some(output_type) = &cli.output_type {
        options.output_type = OutputType::parse(output_type)?;
    }
    if let Some(level) = cli.optimize {
        options.optimize = level;
    }
    if let Some(megabytes) = cli.fast_web_view {
        options.fast_web_view = Some((megabytes * 1024.0 * 1024.0) as u64);
    }
    if let Some(pages) = &cli.pages {
        options.pages = Some(PageRangeSet::parse(pages)?);
    }
    if cli.sidecar.is_some() {
        options.sidecar = cli.sidecar.clone();
    }
    options.keep_temporary_files |= cli.keep_temporary_files;
    options.invalidate_digital_signatures |= cli.invalidate_digital_signatures;
    options.continue_on_soft_render_error |= cli.continue_on_soft_render_error;

    options.validate()?;
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pdfsandwich").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_operands() {
        let cli = parse(&["in.pdf", "out.pdf"]);
        assert_eq!(cli.input, "in.pdf");
        assert_eq!(cli.output, "out.pdf");
    }

    #[test]
    fn test_language_list_splits_on_plus() {
        let cli = parse(&["-l", "deu+eng", "in.pdf", "out.pdf"]);
        let options = build_options(&cli).unwrap();
        assert_eq!(options.languages, vec!["deu", "eng"]);
    }

    #[test]
    fn test_mutually_exclusive_modes_rejected() {
        let cli = parse(&["--skip-text", "--force-ocr", "in.pdf", "out.pdf"]);
        let err = build_options(&cli).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_fast_web_view_converts_megabytes() {
        let cli = parse(&["--fast-web-view", "2", "in.pdf", "out.pdf"]);
        let options = build_options(&cli).unwrap();
        assert_eq!(options.fast_web_view, Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_pages_range_parses() {
        let cli = parse(&["--pages", "1-2,5", "in.pdf", "out.pdf"]);
        let options = build_options(&cli).unwrap();
        let pages = options.pages.unwrap();
        assert!(pages.contains(5));
        assert!(!pages.contains(3));
    }

    #[test]
    fn test_bad_optimize_level_rejected() {
        let cli = parse(&["--optimize", "7", "in.pdf", "out.pdf"]);
        assert!(build_options(&cli).is_err());
    }

    #[test]
    fn test_missing_operands_fail_to_parse() {
        assert!(Cli::try_parse_from(["pdfsandwich", "only-one.pdf"]).is_err());
    }
}
