use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

use chunkferry_protocol::messages::TransferProgress;
use chunkferry_protocol::types::UploadProgress;

/// Callback invoked with upload progress.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Aggregates per-chunk progress of one session into overall snapshots.
///
/// Overall progress is `(completed + Σ in-flight fraction) / total`. Every
/// chunk progress update and every chunk completion notifies the registered
/// callbacks. Callbacks run outside the tracker's lock and a panicking
/// callback is logged and otherwise ignored.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    callbacks: RwLock<Vec<ProgressCallback>>,
}

#[derive(Default)]
struct TrackerState {
    session_id: String,
    total_chunks: u64,
    total_bytes: u64,
    completed_chunks: u64,
    completed_bytes: u64,
    in_flight: HashMap<u64, TransferProgress>,
    throughput: Throughput,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Starts tracking a (possibly partially completed) session from scratch.
    pub fn reset(
        &self,
        session_id: &str,
        total_chunks: u64,
        total_bytes: u64,
        completed_chunks: u64,
        completed_bytes: u64,
    ) {
        *self.lock() = TrackerState {
            session_id: session_id.to_string(),
            total_chunks,
            total_bytes,
            completed_chunks,
            completed_bytes,
            in_flight: HashMap::new(),
            throughput: Throughput::default(),
        };
    }

    /// Records transport progress for an in-flight chunk.
    pub fn chunk_progress(&self, index: u64, progress: TransferProgress) {
        let snapshot = {
            let mut state = self.lock();
            let previous = state
                .in_flight
                .insert(index, progress)
                .map_or(0, |p| p.loaded);
            state
                .throughput
                .record(progress.loaded.saturating_sub(previous), Instant::now());
            self.snapshot_locked(&state)
        };
        self.notify(snapshot);
    }

    /// Moves a chunk from in flight to completed.
    pub fn chunk_completed(&self, index: u64, size: u64) {
        let snapshot = {
            let mut state = self.lock();
            let previous = state.in_flight.remove(&index).map_or(0, |p| p.loaded);
            state
                .throughput
                .record(size.saturating_sub(previous), Instant::now());
            state.completed_chunks = (state.completed_chunks + 1).min(state.total_chunks);
            state.completed_bytes = (state.completed_bytes + size).min(state.total_bytes);
            self.snapshot_locked(&state)
        };
        self.notify(snapshot);
    }

    /// Forgets partial progress of a chunk whose transfer failed.
    pub fn chunk_abandoned(&self, index: u64) {
        self.lock().in_flight.remove(&index);
    }

    /// Current overall progress.
    pub fn snapshot(&self) -> UploadProgress {
        let state = self.lock();
        self.snapshot_locked(&state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_locked(&self, state: &TrackerState) -> UploadProgress {
        let in_flight_fraction: f64 = state.in_flight.values().map(|p| p.fraction()).sum();
        let in_flight_bytes: u64 = state.in_flight.values().map(|p| p.loaded).sum();
        let total_progress = if state.total_chunks == 0 {
            1.0
        } else {
            ((state.completed_chunks as f64 + in_flight_fraction) / state.total_chunks as f64)
                .clamp(0.0, 1.0)
        };
        UploadProgress {
            session_id: state.session_id.clone(),
            total_progress,
            completed_chunks: state.completed_chunks,
            total_chunks: state.total_chunks,
            uploaded_bytes: (state.completed_bytes + in_flight_bytes).min(state.total_bytes),
            total_bytes: state.total_bytes,
            bytes_per_second: state.throughput.bytes_per_second(),
        }
    }

    fn notify(&self, progress: UploadProgress) {
        let callbacks: Vec<ProgressCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for cb in callbacks {
            let p = progress.clone();
            if catch_unwind(AssertUnwindSafe(|| cb(p))).is_err() {
                warn!(session = %progress.session_id, "progress callback panicked");
            }
        }
    }
}

/// Bytes moved over the recent past, for the `bytes_per_second` figure.
///
/// Only samples newer than `window` are kept, and at most `capacity` of them.
/// The rate is the bytes recorded after the oldest kept sample divided by
/// the time since it.
struct Throughput {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    capacity: usize,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 128)
    }
}

impl Throughput {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            window,
            capacity: capacity.max(2),
        }
    }

    fn record(&mut self, bytes: u64, at: Instant) {
        self.samples.push_back((at, bytes));
        while self.samples.len() > self.capacity
            || self
                .samples
                .front()
                .is_some_and(|(t, _)| at.saturating_duration_since(*t) > self.window)
        {
            self.samples.pop_front();
        }
    }

    fn bytes_per_second(&self) -> f64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.saturating_duration_since(*first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let moved: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        moved as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(tracker: &ProgressTracker) -> Arc<Mutex<Vec<UploadProgress>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        tracker.on_progress(Arc::new(move |p| s.lock().unwrap().push(p)));
        seen
    }

    #[test]
    fn tracker_combines_completed_and_in_flight() {
        let tracker = ProgressTracker::new();
        tracker.reset("s1", 4, 400, 1, 100);
        let seen = recording(&tracker);

        tracker.chunk_progress(1, TransferProgress { loaded: 50, total: 100 });
        tracker.chunk_progress(2, TransferProgress { loaded: 50, total: 100 });

        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert!((last.total_progress - 0.5).abs() < 1e-9);
        assert_eq!(last.uploaded_bytes, 200);
        assert_eq!(last.completed_chunks, 1);
        assert_eq!(last.session_id, "s1");
    }

    #[test]
    fn tracker_completion_replaces_partial_progress() {
        let tracker = ProgressTracker::new();
        tracker.reset("s1", 2, 200, 0, 0);
        tracker.chunk_progress(0, TransferProgress { loaded: 40, total: 100 });
        tracker.chunk_completed(0, 100);
        tracker.chunk_completed(1, 100);

        let snap = tracker.snapshot();
        assert_eq!(snap.completed_chunks, 2);
        assert_eq!(snap.uploaded_bytes, 200);
        assert!((snap.total_progress - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_abandoned_chunk_drops_partial_bytes() {
        let tracker = ProgressTracker::new();
        tracker.reset("s1", 2, 200, 0, 0);
        tracker.chunk_progress(1, TransferProgress { loaded: 80, total: 100 });
        tracker.chunk_abandoned(1);
        assert_eq!(tracker.snapshot().uploaded_bytes, 0);
        assert_eq!(tracker.snapshot().total_progress, 0.0);
    }

    #[test]
    fn tracker_empty_session_is_complete() {
        let tracker = ProgressTracker::new();
        tracker.reset("empty", 0, 0, 0, 0);
        assert_eq!(tracker.snapshot().total_progress, 1.0);
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let tracker = ProgressTracker::new();
        tracker.reset("s1", 1, 10, 0, 0);
        tracker.on_progress(Arc::new(|_| panic!("ui went away")));
        let seen = recording(&tracker);

        tracker.chunk_completed(0, 10);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn throughput_needs_two_samples() {
        let mut t = Throughput::default();
        assert_eq!(t.bytes_per_second(), 0.0);
        t.record(100, Instant::now());
        assert_eq!(t.bytes_per_second(), 0.0);
    }

    #[test]
    fn throughput_counts_bytes_after_first_sample() {
        let start = Instant::now();
        let mut t = Throughput::new(Duration::from_secs(10), 16);
        t.record(1_000, start);
        t.record(500, start + Duration::from_secs(1));
        t.record(500, start + Duration::from_secs(2));
        assert!((t.bytes_per_second() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_forgets_samples_outside_window() {
        let start = Instant::now();
        let mut t = Throughput::new(Duration::from_secs(5), 16);
        t.record(1, start);
        t.record(1_000_000, start + Duration::from_secs(1));
        t.record(10, start + Duration::from_secs(20));
        assert_eq!(t.samples.len(), 1);
        t.record(10, start + Duration::from_secs(21));
        assert!((t.bytes_per_second() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn throughput_is_bounded() {
        let start = Instant::now();
        let mut t = Throughput::new(Duration::from_secs(60), 5);
        for i in 0..20 {
            t.record(i * 10, start + Duration::from_millis(i));
        }
        assert_eq!(t.samples.len(), 5);
    }

    #[test]
    fn reset_clears_speed() {
        let tracker = ProgressTracker::new();
        tracker.reset("s1", 2, 200, 0, 0);
        {
            let mut state = tracker.lock();
            let start = Instant::now();
            state.throughput.record(100, start);
            state.throughput.record(100, start + Duration::from_secs(1));
        }
        assert!(tracker.snapshot().bytes_per_second > 0.0);
        tracker.reset("s1", 2, 200, 0, 0);
        assert_eq!(tracker.snapshot().bytes_per_second, 0.0);
    }
}
