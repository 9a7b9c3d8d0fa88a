//! Run progress tracking
//!
//! Shared atomic counters updated by workers and polled by an optional
//! reporting thread, so rendering progress never contends with the
//! writer. The CLI installs a callback; library users can poll
//! [`Progress::snapshot`] directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time view of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_pages: usize,
    pub analyzed: usize,
    pub ocr_done: usize,
    pub completed: usize,
    pub downgraded: usize,
}

impl ProgressSnapshot {
    pub fn percentage(&self) -> f64 {
        if self.total_pages == 0 {
            100.0
        } else {
            self.completed as f64 / self.total_pages as f64 * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total_pages
    }
}

/// Callback invoked by the reporting thread.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

#[derive(Debug, Default)]
pub struct Progress {
    total_pages: AtomicUsize,
    analyzed: AtomicUsize,
    ocr_done: AtomicUsize,
    completed: AtomicUsize,
    downgraded: AtomicUsize,
}

impl Progress {
    pub fn new(total_pages: usize) -> Self {
        let progress = Self::default();
        progress.total_pages.store(total_pages, Ordering::Relaxed);
        progress
    }

    pub fn page_analyzed(&self) {
        self.analyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_ocr_done(&self) {
        self.ocr_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_downgraded(&self) {
        self.downgraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_pages: self.total_pages.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            ocr_done: self.ocr_done.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            downgraded: self.downgraded.load(Ordering::Relaxed),
        }
    }

    /// Spawns the reporting thread; it exits when the run completes or
    /// `stop` flips. Detached join handle is returned for the engine to
    /// reap.
    pub fn spawn_reporter(
        progress: Arc<Progress>,
        callback: Arc<dyn ProgressCallback>,
        stop: Arc<std::sync::atomic::AtomicBool>,
        interval: Duration,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            let snapshot = progress.snapshot();
            callback.on_progress(&snapshot);
            if snapshot.is_complete() || stop.load(Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(interval);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_snapshot_counts() {
        let progress = Progress::new(4);
        progress.page_analyzed();
        progress.page_completed();
        progress.page_downgraded();
        let snap = progress.snapshot();
        assert_eq!(snap.total_pages, 4);
        assert_eq!(snap.analyzed, 1);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.downgraded, 1);
        assert_eq!(snap.percentage(), 25.0);
        assert!(!snap.is_complete());
    }

    #[test]
    fn test_empty_run_is_complete() {
        let progress = Progress::new(0);
        assert!(progress.snapshot().is_complete());
        assert_eq!(progress.snapshot().percentage(), 100.0);
    }

    #[test]
    fn test_reporter_thread_terminates() {
        let progress = Arc::new(Progress::new(1));
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = Arc::clone(&seen);
        let stop = Arc::new(AtomicBool::new(false));
        progress.page_completed();
        let handle = Progress::spawn_reporter(
            Arc::clone(&progress),
            Arc::new(move |_: &ProgressSnapshot| {
                seen_clone.store(true, Ordering::Relaxed);
            }),
            stop,
            Duration::from_millis(5),
        );
        handle.join().unwrap();
        assert!(seen.load(Ordering::Relaxed));
    }
}
