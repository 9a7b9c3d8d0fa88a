//! Working directory layout
//!
//! One uniquely-named directory per run, one subdirectory per page, with
//! stage-named files inside (`0007_rasterize.png`, `0007_ocr_tess.txt`,
//! ...). Page indexes are zero-padded to at least four digits so listings
//! sort in page order even for large documents. Each page directory is
//! written only by the worker that owns the page.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::error::{SandwichError, SandwichResult};

static NEXT_RUN: AtomicU64 = AtomicU64::new(0);

/// The run-scoped scratch directory.
pub struct WorkingDir {
    root: PathBuf,
    pad_width: usize,
    keep: bool,
}

impl WorkingDir {
    /// Creates `${tmp}/pdfsandwich.<pid>.<seq>/`. `page_count` sizes the
    /// zero padding; `keep` suppresses cleanup on drop (`--keep-temporary-files`).
    pub fn create(page_count: usize, keep: bool) -> SandwichResult<Self> {
        let seq = NEXT_RUN.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "pdfsandwich.{}.{}",
            std::process::id(),
            seq
        ));
        std::fs::create_dir_all(&root)?;
        let pad_width = page_count.to_string().len().max(4);
        Ok(Self {
            root,
            pad_width,
            keep,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The page's private subdirectory, created on first use.
    pub fn page_dir(&self, page_index: usize) -> SandwichResult<PathBuf> {
        let dir = self.root.join(self.page_tag(page_index));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// `<NNNN>_<stage>.<ext>` inside the page's subdirectory.
    pub fn page_file(
        &self,
        page_index: usize,
        stage: &str,
        ext: &str,
    ) -> SandwichResult<PathBuf> {
        let dir = self.page_dir(page_index)?;
        Ok(dir.join(format!("{}_{stage}.{ext}", self.page_tag(page_index))))
    }

    fn page_tag(&self, page_index: usize) -> String {
        format!("{page_index:0width$}", width = self.pad_width)
    }

    /// Explicit cleanup with error reporting; `Drop` is the silent
    /// fallback for early exits.
    pub fn finish(self) -> SandwichResult<()> {
        if self.keep {
            info!(path = %self.root.display(), "keeping temporary files");
            std::mem::forget(self);
            return Ok(());
        }
        let root = self.root.clone();
        std::mem::forget(self);
        std::fs::remove_dir_all(&root).map_err(SandwichError::FileAccess)
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if self.keep {
            info!(path = %self.root.display(), "keeping temporary files");
        } else {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}
