//! The frame worker thread for asynchronous processing.
//!
//! Owns the worker half of the [`FrameRing`](super::FrameRing) and runs every
//! completed frame through the shared engine cell, off the real-time thread.
//! The thread exits when the callback half of the ring is dropped, and the
//! worker joins it on drop.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use super::ring::RingConsumer;
use crate::engine::EngineCell;

pub struct FrameWorker {
    handle: Option<JoinHandle<()>>,
}

impl FrameWorker {
    /// Spawn the worker thread.  `failures` is shared with the bridge so the
    /// two processing paths report into one counter.
    pub fn spawn(
        consumer: RingConsumer,
        engine: Arc<Mutex<EngineCell>>,
        failures: Arc<AtomicU64>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("voice-frame-worker".into())
            .spawn(move || {
                debug!("frame worker started");
                consumer.run(&engine, &failures);
                debug!("frame worker stopped");
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }
}

impl Drop for FrameWorker {
    // The ring's callback half must already be gone by now, otherwise the
    // join would wait forever; DuplexBridge orders its fields for this.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("frame worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::audio::ring::FrameRing;
    use crate::engine::MockEngine;

    fn shared_cell(scale: f32) -> Arc<Mutex<EngineCell>> {
        let (_tx, rx) = mpsc::channel();
        Arc::new(Mutex::new(EngineCell::new(
            Box::new(MockEngine::scaling(scale)),
            rx,
        )))
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for worker");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn worker_processes_queued_frames() {
        let (mut ring, consumer) = FrameRing::new(4, 2);
        let engine = shared_cell(3.0);
        let failures = Arc::new(AtomicU64::new(0));
        let worker = FrameWorker::spawn(consumer, engine, Arc::clone(&failures)).unwrap();

        let mut out = [0.0f32; 4];
        ring.transfer(&[1.0, 2.0, 3.0, 4.0], &mut out);
        ring.transfer(&[0.0; 4], &mut out);

        // One full cycle later the first frame comes back transformed.
        wait_until(|| ring.hold_slot(0).output[0] != 0.0);
        ring.transfer(&[0.0; 4], &mut out);
        assert_eq!(out, [3.0, 6.0, 9.0, 12.0]);
        assert_eq!(failures.load(Ordering::Relaxed), 0);

        drop(ring);
        drop(worker);
    }

    #[test]
    fn worker_exits_when_ring_is_dropped() {
        let (ring, consumer) = FrameRing::new(4, 2);
        let engine = shared_cell(1.0);
        let failures = Arc::new(AtomicU64::new(0));
        let worker = FrameWorker::spawn(consumer, engine, failures).unwrap();

        drop(ring);
        // Join must return promptly once the job sender is gone.
        drop(worker);
    }

    #[test]
    fn worker_counts_transformation_failures() {
        let (mut ring, consumer) = FrameRing::new(4, 2);
        let (_tx, rx) = mpsc::channel();
        let engine = Arc::new(Mutex::new(EngineCell::new(
            Box::new(MockEngine::failing()),
            rx,
        )));
        let failures = Arc::new(AtomicU64::new(0));
        let worker = FrameWorker::spawn(consumer, engine, Arc::clone(&failures)).unwrap();

        let mut out = [0.0f32; 4];
        ring.transfer(&[1.0; 4], &mut out);
        wait_until(|| failures.load(Ordering::Relaxed) == 1);

        drop(ring);
        drop(worker);
    }
}
