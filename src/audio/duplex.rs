//! The duplex bridge: glue between the platform's audio callback and the
//! engine.
//!
//! Every callback delivers one input block and one output block; the bridge
//! moves `min(input samples, output samples)` through the engine and zeroes
//! whatever output remains.  Two processing modes:
//!
//! - [`ProcessingMode::Synchronous`] — the engine runs inside the callback.
//!   Lowest latency, but the transformation must keep up with the callback
//!   deadline.
//! - [`ProcessingMode::Asynchronous`] — samples pass through a [`FrameRing`]
//!   and a [`FrameWorker`] thread runs the engine on whole frames.  Adds one
//!   ring cycle of latency, tolerates slow transformations.  A callback block
//!   larger than one frame cannot go through the ring and is processed
//!   synchronously instead.
//!
//! Transformation failures never stop the stream: the affected block is muted,
//! the failure counted, and the callback returns [`CallbackResult::Continue`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use log::debug;

use super::ring::{FrameRing, RingStats};
use super::worker::FrameWorker;
use crate::engine::{EngineCell, ParamUpdate, TransformEngine};
use crate::platform::{CallbackResult, DuplexCallback, LatencyTuner};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where the engine runs relative to the audio callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Synchronous,
    Asynchronous,
}

/// Shape of the duplex pair as negotiated by the platform.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mode: ProcessingMode,
    /// Engine block size in samples.
    pub frame_size: usize,
    /// Ring depth in frames (asynchronous mode only).
    pub buffer_count: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Live counters shared out of the bridge; cheap to clone.
#[derive(Clone)]
pub struct BridgeStats {
    failures: Arc<AtomicU64>,
    ring: Option<Arc<RingStats>>,
}

impl BridgeStats {
    /// Blocks muted because the engine reported a processing error.
    pub fn process_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Callback spans muted by callback/worker overlap (asynchronous mode).
    pub fn overlap_skips(&self) -> u64 {
        self.ring.as_ref().map_or(0, |r| r.overlap_skips())
    }

    /// Frame jobs dropped because the previous one was unfinished.
    pub fn dropped_jobs(&self) -> u64 {
        self.ring.as_ref().map_or(0, |r| r.dropped_jobs())
    }
}

// ---------------------------------------------------------------------------
// DuplexBridge
// ---------------------------------------------------------------------------

pub struct DuplexBridge {
    config: BridgeConfig,
    engine: Arc<Mutex<EngineCell>>,
    failures: Arc<AtomicU64>,
    tuner: Box<dyn LatencyTuner>,
    // `ring` holds the job sender; declared before the worker so dropping the
    // bridge closes the queue before the worker joins its thread.
    ring: Option<FrameRing>,
    _worker: Option<FrameWorker>,
}

impl DuplexBridge {
    /// Build the bridge around a freshly configured engine.  In asynchronous
    /// mode this also spawns the frame worker.
    pub fn new(
        config: BridgeConfig,
        engine: Box<dyn TransformEngine>,
        updates: Receiver<ParamUpdate>,
        tuner: Box<dyn LatencyTuner>,
    ) -> std::io::Result<Self> {
        let engine = Arc::new(Mutex::new(EngineCell::new(engine, updates)));
        let failures = Arc::new(AtomicU64::new(0));

        let (ring, worker) = match config.mode {
            ProcessingMode::Synchronous => (None, None),
            ProcessingMode::Asynchronous => {
                let (ring, consumer) = FrameRing::new(config.frame_size, config.buffer_count);
                let worker =
                    FrameWorker::spawn(consumer, Arc::clone(&engine), Arc::clone(&failures))?;
                (Some(ring), Some(worker))
            }
        };

        Ok(Self {
            config,
            engine,
            failures,
            tuner,
            ring,
            _worker: worker,
        })
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            failures: Arc::clone(&self.failures),
            ring: self.ring.as_ref().map(|r| r.stats()),
        }
    }

    /// Run `input` through the engine right here on the callback thread.
    fn process_inline(&self, input: &[f32], output: &mut [f32]) {
        let mut engine = match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = engine.process(input, output) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            debug!("inline transformation failed: {err}");
            output.fill(0.0);
        }
    }
}

impl DuplexCallback for DuplexBridge {
    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        input_frames: usize,
        output: &mut [f32],
        output_frames: usize,
    ) -> CallbackResult {
        let n = (input_frames * self.config.input_channels)
            .min(output_frames * self.config.output_channels);
        let frame_size = self.config.frame_size;
        let input = &input[..n];

        match &mut self.ring {
            // Oversized blocks skip the ring; they would lap the cursor.
            Some(ring) if n <= frame_size => {
                ring.transfer(input, &mut output[..n]);
            }
            _ => {
                let (head, _) = output.split_at_mut(n);
                self.process_inline(input, head);
            }
        }

        output[n..].fill(0.0);
        self.tuner.tune();
        CallbackResult::Continue
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
