//! Raster preprocessing
//!
//! Applies a [`PreprocessPlan`] to a rasterized page before OCR: rotation
//! per the orientation hint, background removal, deskew and cleaning.
//! Rotation and background removal run in-process on the decoded image;
//! deskew and cleaning go through the external image cleaner (one PNG in,
//! one PNG out, anything else is an error).

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::OrientationHint;
use crate::policy::{PreprocessPlan, PreprocessStep};
use crate::workdir::WorkingDir;

pub type PreprocessResult<T> = Result<T, PreprocessError>;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image cleaner not available: {0}")]
    CleanerNotAvailable(String),
    #[error("image cleaner failed: {0}")]
    CleanerFailed(String),
    #[error("cleaner produced {0} output files, expected exactly one")]
    CleanerOutputCount(usize),
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Workdir(#[from] crate::error::SandwichError),
}

/// External cleaner collaborator (`unpaper` in the stock wiring).
pub trait ImageCleaner: Send + Sync {
    /// Reads one PNG, writes one PNG. `deskew` selects the heavier
    /// deskew pass in addition to speckle/border cleanup.
    fn clean(&self, input: &Path, output: &Path, deskew: bool) -> PreprocessResult<()>;

    fn tool_name(&self) -> &str;
}

/// `unpaper`-backed cleaner. unpaper speaks PNM, so images are converted
/// on the way in and out.
pub struct UnpaperCleaner {
    binary: String,
}

impl UnpaperCleaner {
    pub fn new() -> Self {
        Self {
            binary: "unpaper".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for UnpaperCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCleaner for UnpaperCleaner {
    fn clean(&self, input: &Path, output: &Path, deskew: bool) -> PreprocessResult<()> {
        let pnm_in = input.with_extension("pnm");
        let pnm_out = output.with_extension("pnm");
        let image = image::open(input).map_err(|e| PreprocessError::Decode(e.to_string()))?;
        image
            .save(&pnm_in)
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;

        let mut cmd = Command::new(&self.binary);
        if !deskew {
            cmd.arg("--no-deskew");
        }
        let result = cmd
            .arg("--overwrite")
            .arg(&pnm_in)
            .arg(&pnm_out)
            .output()
            .map_err(|e| PreprocessError::CleanerNotAvailable(format!("{}: {e}", self.binary)))?;
        if !result.status.success() {
            return Err(PreprocessError::CleanerFailed(
                String::from_utf8_lossy(&result.stderr).trim().to_string(),
            ));
        }
        if !pnm_out.exists() {
            return Err(PreprocessError::CleanerOutputCount(0));
        }

        let cleaned =
            image::open(&pnm_out).map_err(|e| PreprocessError::Decode(e.to_string()))?;
        cleaned
            .save_with_format(output, image::ImageFormat::Png)
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;
        let _ = std::fs::remove_file(pnm_in);
        let _ = std::fs::remove_file(pnm_out);
        Ok(())
    }

    fn tool_name(&self) -> &str {
        &self.binary
    }
}

/// Pass-through cleaner for tests.
pub struct MockCleaner;

impl ImageCleaner for MockCleaner {
    fn clean(&self, input: &Path, output: &Path, _deskew: bool) -> PreprocessResult<()> {
        std::fs::copy(input, output)?;
        Ok(())
    }

    fn tool_name(&self) -> &str {
        "mock"
    }
}

/// Result of running the plan over one page's raster.
#[derive(Debug, Clone)]
pub struct PreprocessOutcome {
    /// The image the OCR engine should read.
    pub ocr_image: PathBuf,
    /// The image to graft into the output in place of the original page
    /// content; `None` when no output-visible step ran.
    pub output_image: Option<PathBuf>,
    /// Rotation applied from the orientation hint, degrees clockwise.
    pub rotation_applied: i32,
}

pub struct Preprocessor<'a> {
    cleaner: Option<&'a dyn ImageCleaner>,
    rotate_threshold: f32,
}

impl<'a> Preprocessor<'a> {
    pub fn new(cleaner: Option<&'a dyn ImageCleaner>, rotate_threshold: f32) -> Self {
        Self {
            cleaner,
            rotate_threshold,
        }
    }

    /// Runs the plan's steps in order over the rasterized page at
    /// `raster`. Stage files land in the page's working subdirectory.
    pub fn run(
        &self,
        plan: &PreprocessPlan,
        raster: &Path,
        orientation: Option<OrientationHint>,
        workdir: &WorkingDir,
        page_index: usize,
    ) -> PreprocessResult<PreprocessOutcome> {
        let mut current = raster.to_path_buf();
        let mut rotation_applied = 0;
        let mut output_visible_change = false;

        for step in plan.steps() {
            match step {
                PreprocessStep::Rotate => {
                    let Some(hint) = orientation else {
                        continue;
                    };
                    if hint.score < self.rotate_threshold || hint.angle % 360 == 0 {
                        debug!(
                            page = page_index,
                            angle = hint.angle,
                            score = hint.score,
                            "orientation hint below threshold, not rotating"
                        );
                        continue;
                    }
                    let out = workdir.page_file(page_index, "pp_rotate", "png")?;
                    rotate_image(&current, &out, hint.angle)?;
                    rotation_applied = hint.angle.rem_euclid(360);
                    current = out;
                    output_visible_change = true;
                }
                PreprocessStep::RemoveBackground => {
                    let out = workdir.page_file(page_index, "pp_remove_bg", "png")?;
                    remove_background(&current, &out)?;
                    current = out;
                    output_visible_change = true;
                }
                PreprocessStep::Deskew => {
                    let Some(cleaner) = self.cleaner else {
                        warn!(page = page_index, "no cleaner wired, skipping deskew");
                        continue;
                    };
                    let out = workdir.page_file(page_index, "pp_deskew", "png")?;
                    cleaner.clean(&current, &out, true)?;
                    current = out;
                    output_visible_change = true;
                }
                PreprocessStep::CleanForOcr | PreprocessStep::CleanForOutput => {
                    let Some(cleaner) = self.cleaner else {
                        warn!(page = page_index, "no cleaner wired, skipping clean");
                        continue;
                    };
                    let out = workdir.page_file(page_index, "pp_clean", "png")?;
                    cleaner.clean(&current, &out, false)?;
                    current = out;
                    if *step == PreprocessStep::CleanForOutput {
                        output_visible_change = true;
                    }
                }
            }
        }

        Ok(PreprocessOutcome {
            ocr_image: current.clone(),
            output_image: output_visible_change.then_some(current),
            rotation_applied,
        })
    }
}

fn rotate_image(input: &Path, output: &Path, angle: i32) -> PreprocessResult<()> {
    let img = image::open(input).map_err(|e| PreprocessError::Decode(e.to_string()))?;
    let rotated = match angle.rem_euclid(360) {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    };
    rotated
        .save_with_format(output, image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Decode(e.to_string()))
}

/// Stretches the luminance histogram so the paper tone clips to white:
/// everything above the 85th-percentile level becomes 255, the rest is
/// rescaled. Crude next to a real adaptive threshold but removes the
/// gray cast scanners put on aged paper.
fn remove_background(input: &Path, output: &Path) -> PreprocessResult<()> {
    let img = image::open(input)
        .map_err(|e| PreprocessError::Decode(e.to_string()))?
        .into_luma8();

    let mut histogram = [0u32; 256];
    for pixel in img.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }
    let total: u32 = histogram.iter().sum();
    let mut cumulative = 0u32;
    let mut white_point = 255u8;
    for (level, &count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative as f64 / total as f64 >= 0.85 {
            white_point = level as u8;
            break;
        }
    }
    let white_point = white_point.max(1);

    let out = image::GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y).0[0];
        let scaled = (v as u32 * 255 / white_point as u32).min(255) as u8;
        image::Luma([scaled])
    });
    out.save_with_format(output, image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn gray_png(dir: &Path, name: &str, level: u8) -> PathBuf {
        let path = dir.join(name);
        image::GrayImage::from_pixel(40, 40, image::Luma([level]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        path
    }

    #[test]
    fn test_empty_plan_is_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = WorkingDir::create(1, false).unwrap();
        let raster = gray_png(tmp.path(), "in.png", 128);
        let outcome = Preprocessor::new(None, 14.0)
            .run(&PreprocessPlan::default(), &raster, None, &wd, 1)
            .unwrap();
        assert_eq!(outcome.ocr_image, raster);
        assert!(outcome.output_image.is_none());
        assert_eq!(outcome.rotation_applied, 0);
    }

    #[test]
    fn test_rotate_honors_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = WorkingDir::create(1, false).unwrap();
        let raster = gray_png(tmp.path(), "in.png", 128);
        let options = Options {
            rotate_pages: true,
            ..Default::default()
        };
        let plan = PreprocessPlan::from_options(&options);

        let low = OrientationHint {
            angle: 90,
            score: 2.0,
        };
        let outcome = Preprocessor::new(None, 14.0)
            .run(&plan, &raster, Some(low), &wd, 1)
            .unwrap();
        assert_eq!(outcome.rotation_applied, 0);

        let high = OrientationHint {
            angle: 90,
            score: 20.0,
        };
        let outcome = Preprocessor::new(None, 14.0)
            .run(&plan, &raster, Some(high), &wd, 1)
            .unwrap();
        assert_eq!(outcome.rotation_applied, 90);
        assert!(outcome.output_image.is_some());
    }

    #[test]
    fn test_clean_for_ocr_does_not_replace_output() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = WorkingDir::create(1, false).unwrap();
        let raster = gray_png(tmp.path(), "in.png", 128);
        let options = Options {
            clean: true,
            ..Default::default()
        };
        let plan = PreprocessPlan::from_options(&options);
        let cleaner = MockCleaner;
        let outcome = Preprocessor::new(Some(&cleaner), 14.0)
            .run(&plan, &raster, None, &wd, 1)
            .unwrap();
        assert_ne!(outcome.ocr_image, raster);
        assert!(outcome.output_image.is_none());
    }

    #[test]
    fn test_remove_background_whitens_paper() {
        let tmp = tempfile::tempdir().unwrap();
        let input = gray_png(tmp.path(), "gray.png", 200);
        let output = tmp.path().join("white.png");
        remove_background(&input, &output).unwrap();
        let img = image::open(&output).unwrap().into_luma8();
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn test_rotate_image_90() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("in.png");
        image::GrayImage::from_pixel(10, 20, image::Luma([5]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        let out = tmp.path().join("out.png");
        rotate_image(&path, &out, 90).unwrap();
        let img = image::open(&out).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }
}
