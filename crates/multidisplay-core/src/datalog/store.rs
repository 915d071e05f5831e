//! Append-only sample store with a movable view window

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::format::{self, CaptureError, LoadReport};
use super::window::{Viewport, DEFAULT_WINDOW_SIZE, SCROLL_STEP};
use crate::protocol::DataSample;

/// Every sample of the current session, in arrival order
pub struct DataStore {
    samples: RwLock<Vec<Arc<DataSample>>>,
    /// Published after each append, readable without the lock
    len: AtomicUsize,
    viewport: Mutex<Viewport>,
    default_window: usize,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    /// Create an empty store with the default window size
    pub fn new() -> Self {
        Self::with_window_size(DEFAULT_WINDOW_SIZE)
    }

    /// Create an empty store whose window starts at `size` records
    pub fn with_window_size(size: usize) -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            len: AtomicUsize::new(0),
            viewport: Mutex::new(Viewport::default()),
            default_window: size.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<DataSample>>> {
        self.samples.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<DataSample>>> {
        self.samples.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn vp(&self) -> MutexGuard<'_, Viewport> {
        self.viewport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample
    pub fn append(&self, sample: DataSample) -> Arc<DataSample> {
        let sample = Arc::new(sample);
        self.append_shared(Arc::clone(&sample));
        sample
    }

    /// Append an already shared sample
    pub fn append_shared(&self, sample: Arc<DataSample>) {
        let len = {
            let mut samples = self.write();
            samples.push(sample);
            let len = samples.len();
            self.len.store(len, Ordering::Release);
            len
        };

        let mut vp = self.vp();
        if vp.max == 0 {
            vp.ensure_initialized(len, self.default_window);
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample count for status display
    pub fn sample_count(&self) -> usize {
        self.len()
    }

    /// Sample at `index`
    pub fn get(&self, index: usize) -> Option<Arc<DataSample>> {
        self.read().get(index).cloned()
    }

    /// Most recent sample
    pub fn last(&self) -> Option<Arc<DataSample>> {
        self.read().last().cloned()
    }

    /// Up to `size` samples starting at record `begin`, clamped to the data
    pub fn window(&self, begin: usize, size: usize) -> Vec<Arc<DataSample>> {
        let samples = self.read();
        let range = super::window::window_range(samples.len(), begin, size);
        samples[range].to_vec()
    }

    /// Copy of every sample
    pub fn snapshot(&self) -> Vec<Arc<DataSample>> {
        self.read().clone()
    }

    /// Samples inside the current viewport
    pub fn visible(&self) -> Vec<Arc<DataSample>> {
        let vp = self.viewport();
        self.window(vp.begin, vp.size)
    }

    /// Current viewport
    pub fn viewport(&self) -> Viewport {
        *self.vp()
    }

    /// Change the window size, rescaling the slider mark
    pub fn resize_window(&self, size: usize) -> Viewport {
        let len = self.len();
        let mut vp = self.vp();
        vp.resize(size, len);
        debug!(size = vp.size, max = vp.max, mark = vp.mark, "Window resized");
        *vp
    }

    /// Move the slider
    pub fn set_mark(&self, mark: usize) -> Viewport {
        let len = self.len();
        let mut vp = self.vp();
        vp.set_mark(mark, len);
        *vp
    }

    /// Shift the window by `steps` micro-scroll steps (negative moves left)
    pub fn scroll_records(&self, steps: isize) -> Viewport {
        let len = self.len();
        let mut vp = self.vp();
        vp.scroll(steps.saturating_mul(SCROLL_STEP as isize), len);
        *vp
    }

    /// Center record `index` in the window, returning the new slider mark
    pub fn show_record(&self, index: usize) -> usize {
        let len = self.len();
        self.vp().show_record(index, len)
    }

    /// Jump to the first records
    pub fn mark_to_start(&self) -> Viewport {
        let mut vp = self.vp();
        vp.to_start();
        *vp
    }

    /// Jump to the latest records
    pub fn mark_to_end(&self) -> Viewport {
        let len = self.len();
        let mut vp = self.vp();
        vp.to_end(len);
        *vp
    }

    /// Drop every sample and reset the viewport
    pub fn clear(&self) {
        {
            let mut samples = self.write();
            samples.clear();
            self.len.store(0, Ordering::Release);
        }
        *self.vp() = Viewport::default();
        info!("Data store cleared");
    }

    /// Swap in a new data set, resetting the viewport to the default size
    fn replace(&self, data: Vec<Arc<DataSample>>) {
        let len = {
            let mut samples = self.write();
            *samples = data;
            let len = samples.len();
            self.len.store(len, Ordering::Release);
            len
        };

        let mut vp = self.vp();
        *vp = Viewport::default();
        vp.resize(self.default_window, len);
    }

    /// Write all samples to a capture file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CaptureError> {
        let samples = self.snapshot();
        format::write_capture(path.as_ref(), &samples)?;
        info!(path = %path.as_ref().display(), samples = samples.len(), "Capture saved");
        Ok(())
    }

    /// Replace the data set with a capture file's contents.
    ///
    /// On error the current data set is left untouched.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<LoadReport, CaptureError> {
        let capture = format::read_capture(path.as_ref())?;
        let report = capture.report();
        self.replace(capture.samples.into_iter().map(Arc::new).collect());
        info!(
            path = %path.as_ref().display(),
            samples = report.samples,
            warnings = report.warnings.len(),
            "Capture loaded"
        );
        Ok(report)
    }

    /// Export all samples as CSV
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), CaptureError> {
        format::write_csv(path, &self.snapshot())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: u32) -> DataSample {
        DataSample::new(ts, vec![ts as f64])
    }

    #[test]
    fn test_append_publishes_len() {
        let store = DataStore::new();
        assert!(store.is_empty());
        store.append(sample(0));
        store.append(sample(10));
        assert_eq!(store.len(), 2);
        assert_eq!(store.last().map(|s| s.timestamp_ms), Some(10));
    }

    #[test]
    fn test_first_append_initializes_viewport() {
        let store = DataStore::with_window_size(50);
        store.append(sample(0));
        let vp = store.viewport();
        assert_eq!(vp.size, 50);
        assert_eq!(vp.max, 1);
    }

    #[test]
    fn test_clear_resets_viewport() {
        let store = DataStore::new();
        for i in 0..300 {
            store.append(sample(i));
        }
        store.resize_window(50);
        store.set_mark(3);
        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.viewport(), Viewport::default());
        assert!(store.visible().is_empty());
    }

    #[test]
    fn test_scroll_records_moves_by_step() {
        let store = DataStore::new();
        for i in 0..100 {
            store.append(sample(i));
        }
        assert_eq!(store.scroll_records(2).begin, 20);
        assert_eq!(store.scroll_records(-1).begin, 10);
        assert_eq!(store.visible()[0].timestamp_ms, 10);
    }
}
