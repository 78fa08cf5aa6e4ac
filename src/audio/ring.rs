//! Fixed-capacity frame ring between the audio callback and the frame worker.
//!
//! The callback delivers blocks of whatever size the device chose; the engine
//! wants blocks of exactly `frame_size` samples.  The ring decouples the two:
//!
//! ```text
//!   callback ──write input──▶ ┌───────┬───────┐ ──read output──▶ callback
//!                             │ slot 0│ slot 1│      (one cursor for both)
//!   worker  ◀──frame jobs──── └───────┴───────┘ ◀──write output── worker
//! ```
//!
//! One cursor, owned by the callback, indexes both the input and the output
//! side; it advances by the transferred sample count modulo the capacity
//! (`frame_size × buffer_count`).  Whenever an advance crosses a frame
//! boundary, exactly one job for the completed frame is enqueued.
//!
//! Each frame slot is guarded by a `Mutex` plus an atomic `pending` flag, so
//! callback and worker never touch the same samples concurrently.  The
//! callback only ever `try_lock`s; on contention (the worker still owns the
//! slot) the output span is muted and the input span skipped, and a counter
//! records the overlap.  A completed frame whose previous job has not finished
//! is dropped, also counted.  Consumed output spans are cleared, so a dropped
//! frame plays silence rather than a stale one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::engine::EngineCell;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters for the ring's two contention outcomes.
#[derive(Debug, Default)]
pub struct RingStats {
    overlap_skips: AtomicU64,
    dropped_jobs: AtomicU64,
}

impl RingStats {
    /// Callback spans muted because the worker held the slot.
    pub fn overlap_skips(&self) -> u64 {
        self.overlap_skips.load(Ordering::Relaxed)
    }

    /// Completed frames whose job could not be enqueued.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped_jobs.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Ring storage
// ---------------------------------------------------------------------------

pub(crate) struct FrameCells {
    pub(crate) input: Box<[f32]>,
    pub(crate) output: Box<[f32]>,
}

struct FrameSlot {
    /// Set between job enqueue and job completion.
    pending: AtomicBool,
    cells: Mutex<FrameCells>,
}

struct RingShared {
    frame_size: usize,
    capacity: usize,
    slots: Vec<FrameSlot>,
    stats: Arc<RingStats>,
}

// ---------------------------------------------------------------------------
// FrameRing  (callback half)
// ---------------------------------------------------------------------------

/// The callback-owned half of the ring: the cursor and the job sender.
pub struct FrameRing {
    shared: Arc<RingShared>,
    job_tx: SyncSender<usize>,
    index: usize,
}

impl FrameRing {
    /// Build a ring of `buffer_count` frames of `frame_size` samples each,
    /// returning the callback half and the worker half.
    pub fn new(frame_size: usize, buffer_count: usize) -> (FrameRing, RingConsumer) {
        assert!(frame_size > 0 && buffer_count > 0);
        let slots = (0..buffer_count)
            .map(|_| FrameSlot {
                pending: AtomicBool::new(false),
                cells: Mutex::new(FrameCells {
                    input: vec![0.0; frame_size].into_boxed_slice(),
                    output: vec![0.0; frame_size].into_boxed_slice(),
                }),
            })
            .collect();
        let shared = Arc::new(RingShared {
            frame_size,
            capacity: frame_size * buffer_count,
            slots,
            stats: Arc::new(RingStats::default()),
        });
        // One queue entry per slot; more could never be pending at once.
        let (job_tx, job_rx) = mpsc::sync_channel(buffer_count);
        (
            FrameRing {
                shared: Arc::clone(&shared),
                job_tx,
                index: 0,
            },
            RingConsumer { shared, job_rx },
        )
    }

    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Current cursor position in samples.
    pub fn cursor(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> Arc<RingStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Move one callback's worth of audio through the ring: write `input` at
    /// the cursor, read the engine's earlier output from the same positions
    /// into `output`, advance, and enqueue a job if a frame completed.
    ///
    /// `input` and `output` must be the same length, at most one frame.
    /// Runs on the real-time thread; never blocks or allocates.
    pub fn transfer(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), output.len());
        debug_assert!(input.len() <= self.shared.frame_size);

        let n = input.len();
        if n == 0 {
            return;
        }

        let start = self.index;
        let mut pos = start;
        let mut done = 0;
        // At most two spans: n <= frame_size, so one slot boundary at most.
        while done < n {
            let slot_idx = pos / self.shared.frame_size;
            let offset = pos % self.shared.frame_size;
            let len = (self.shared.frame_size - offset).min(n - done);
            self.transfer_span(
                slot_idx,
                offset,
                &input[done..done + len],
                &mut output[done..done + len],
            );
            done += len;
            pos = (pos + len) % self.shared.capacity;
        }

        let next = (start + n) % self.shared.capacity;
        if start / self.shared.frame_size != next / self.shared.frame_size {
            self.schedule(start / self.shared.frame_size);
        }
        self.index = next;
    }

    fn transfer_span(&self, slot_idx: usize, offset: usize, input: &[f32], output: &mut [f32]) {
        let slot = &self.shared.slots[slot_idx];
        match slot.cells.try_lock() {
            Ok(mut cells) => {
                let end = offset + input.len();
                cells.input[offset..end].copy_from_slice(input);
                output.copy_from_slice(&cells.output[offset..end]);
                cells.output[offset..end].fill(0.0);
            }
            // Worker still owns the slot (or a test holds it): mute.
            Err(_) => {
                output.fill(0.0);
                self.shared.stats.overlap_skips.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn schedule(&self, frame: usize) {
        let slot = &self.shared.slots[frame];
        if slot.pending.swap(true, Ordering::AcqRel) {
            // Previous job for this frame still in flight.
            self.shared.stats.dropped_jobs.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.job_tx.try_send(frame).is_err() {
            slot.pending.store(false, Ordering::Release);
            self.shared.stats.dropped_jobs.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn hold_slot(&self, frame: usize) -> std::sync::MutexGuard<'_, FrameCells> {
        self.shared.slots[frame].cells.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// RingConsumer  (worker half)
// ---------------------------------------------------------------------------

/// The worker-owned half of the ring: receives frame jobs and runs each
/// completed frame through the engine in place.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    job_rx: Receiver<usize>,
}

impl RingConsumer {
    /// Process one queued job if there is one.  Returns `false` when the
    /// queue is empty or every sender is gone.
    pub fn try_process_next(&self, engine: &Mutex<EngineCell>, failures: &AtomicU64) -> bool {
        match self.job_rx.try_recv() {
            Ok(frame) => {
                self.process_frame(frame, engine, failures);
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Block on the job queue until the callback half is dropped.
    pub fn run(self, engine: &Mutex<EngineCell>, failures: &AtomicU64) {
        while let Ok(frame) = self.job_rx.recv() {
            self.process_frame(frame, engine, failures);
        }
    }

    fn process_frame(&self, frame: usize, engine: &Mutex<EngineCell>, failures: &AtomicU64) {
        let slot = &self.shared.slots[frame];
        {
            let mut cells = slot.cells.lock().unwrap_or_else(|e| e.into_inner());
            let mut engine = match engine.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let cells = &mut *cells;
            if let Err(err) = engine.process(&cells.input, &mut cells.output) {
                failures.fetch_add(1, Ordering::Relaxed);
                debug!("frame {frame} transformation failed: {err}");
                cells.output.fill(0.0);
            }
        }
        slot.pending.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
