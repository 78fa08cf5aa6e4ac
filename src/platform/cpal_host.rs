//! cpal implementation of the platform audio interfaces.
//!
//! cpal has no true duplex stream, so [`CpalHost::start_duplex`] builds a
//! paired input and output stream on a dedicated owner thread
//! (`cpal::Stream` is `!Send`) and pumps captured samples to the output
//! callback over a bounded channel.  The output callback stages whatever
//! input has arrived and drives the [`DuplexCallback`].
//!
//! Stream construction and playback happen on the owner thread, but their
//! results are reported back over a handshake channel so `start_duplex` fails
//! synchronously when the backend rejects the configuration.
//!
//! Mapping notes:
//! - cpal exposes one host per platform, so [`AudioBackend::Compatibility`]
//!   only relaxes the buffer request; it cannot select a different API.
//! - There is no live buffer retuning, so the latency tuner is a
//!   [`NullTuner`].

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, warn};

use super::{
    AudioBackend, AudioHost, AudioStream, Direction, DuplexCallback, ErrorPhase, EventSender,
    LatencyTuner, NullTuner, StreamError, StreamErrorEvent, StreamErrorKind, StreamSpec,
};

/// Capacity reported when the backend picks its own buffer size.
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Bound on captured blocks queued between the input and output callbacks.
const FEED_QUEUE_BLOCKS: usize = 8;

// ---------------------------------------------------------------------------
// CpalHost
// ---------------------------------------------------------------------------

pub struct CpalHost {
    host: cpal::Host,
}

impl CpalHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        debug!("audio host: {:?}", host.id());
        Self { host }
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for CpalHost {
    type Stream = CpalStream;

    fn open_stream(
        &self,
        spec: &StreamSpec,
        events: EventSender,
    ) -> Result<CpalStream, StreamError> {
        let device = find_device(&self.host, spec)?;
        let default = match spec.direction {
            Direction::Input => device.default_input_config(),
            Direction::Output => device.default_output_config(),
        }
        .map_err(|e| StreamError::Unsupported(e.to_string()))?;

        if default.sample_format() != cpal::SampleFormat::F32 {
            return Err(StreamError::Unsupported(format!(
                "{} device does not use f32 samples (got {})",
                spec.direction,
                default.sample_format()
            )));
        }

        let sample_rate = spec.sample_rate.unwrap_or_else(|| default.sample_rate().0);
        let buffer_size = match (spec.buffer_capacity_frames, spec.backend) {
            // Compatibility mode leaves buffering entirely to the backend.
            (Some(frames), AudioBackend::Native) => cpal::BufferSize::Fixed(frames as u32),
            _ => cpal::BufferSize::Default,
        };
        let config = cpal::StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size,
        };

        let name = device.name().unwrap_or_else(|_| "<unnamed>".into());
        info!(
            "configured {} stream on '{}': {} Hz, {} ch, {:?}, {:?} performance",
            spec.direction, name, sample_rate, spec.channels, buffer_size, spec.performance
        );

        Ok(CpalStream {
            direction: spec.direction,
            device,
            config,
            capacity: spec.buffer_capacity_frames.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            events,
            owner: Arc::new(Mutex::new(None)),
        })
    }

    fn start_duplex(
        &self,
        input: &mut CpalStream,
        output: &mut CpalStream,
        callback: Box<dyn DuplexCallback>,
    ) -> Result<(), StreamError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let pair = DuplexPair {
            input_device: input.device.clone(),
            input_config: input.config.clone(),
            input_events: input.events.clone(),
            output_device: output.device.clone(),
            output_config: output.config.clone(),
            output_events: output.events.clone(),
        };
        let join = thread::Builder::new()
            .name("voice-duplex".into())
            .spawn(move || run_duplex(pair, callback, ready_tx, stop_rx))
            .map_err(|e| StreamError::Backend(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                let shared = Arc::new(Mutex::new(Some(OwnerHandle { stop_tx, join })));
                input.owner = Arc::clone(&shared);
                output.owner = shared;
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(StreamError::Backend(
                    "stream owner thread exited before start".into(),
                ))
            }
        }
    }

    fn latency_tuner(&self, _output: &CpalStream) -> Box<dyn LatencyTuner> {
        // cpal cannot resize a running stream's buffers.
        Box::new(NullTuner)
    }

    fn is_low_latency_recommended(&self) -> bool {
        // The default host is the platform's native API everywhere cpal runs.
        true
    }
}

// ---------------------------------------------------------------------------
// CpalStream
// ---------------------------------------------------------------------------

struct OwnerHandle {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

pub struct CpalStream {
    direction: Direction,
    device: cpal::Device,
    config: cpal::StreamConfig,
    capacity: usize,
    events: EventSender,
    /// Shared with the paired stream once the duplex is running; the first
    /// stop/close tears both cpal streams down.
    owner: Arc<Mutex<Option<OwnerHandle>>>,
}

impl CpalStream {
    fn teardown(&self) -> Result<(), StreamError> {
        let handle = match self.owner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(OwnerHandle { stop_tx, join }) = handle {
            drop(stop_tx);
            join.join()
                .map_err(|_| StreamError::Backend("stream owner thread panicked".into()))?;
            debug!("{} stream closed", self.direction);
        }
        Ok(())
    }
}

impl AudioStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channel_count(&self) -> u16 {
        self.config.channels
    }

    fn buffer_capacity_frames(&self) -> usize {
        self.capacity
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.teardown()
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.teardown()
    }
}

// ---------------------------------------------------------------------------
// Owner thread
// ---------------------------------------------------------------------------

struct DuplexPair {
    input_device: cpal::Device,
    input_config: cpal::StreamConfig,
    input_events: EventSender,
    output_device: cpal::Device,
    output_config: cpal::StreamConfig,
    output_events: EventSender,
}

fn run_duplex(
    pair: DuplexPair,
    mut callback: Box<dyn DuplexCallback>,
    ready_tx: Sender<Result<(), StreamError>>,
    stop_rx: Receiver<()>,
) {
    let (feed_tx, feed_rx) = mpsc::sync_channel::<Vec<f32>>(FEED_QUEUE_BLOCKS);

    let input_events = pair.input_events.clone();
    let input_stream = match pair.input_device.build_input_stream(
        &pair.input_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            // Queue full means the output side has stalled; drop the block.
            let _ = feed_tx.try_send(data.to_vec());
        },
        move |err| forward_error(&input_events, Direction::Input, err),
        None,
    ) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(build_error(Direction::Input, err)));
            return;
        }
    };

    let in_channels = pair.input_config.channels as usize;
    let out_channels = pair.output_config.channels as usize;
    let output_events = pair.output_events.clone();
    let mut pending: VecDeque<f32> = VecDeque::new();
    let mut staged: Vec<f32> = Vec::new();
    let output_stream = match pair.output_device.build_output_stream(
        &pair.output_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            while let Ok(block) = feed_rx.try_recv() {
                pending.extend(block);
            }
            let take = pending.len().min(data.len());
            let take = take - take % in_channels;
            staged.clear();
            staged.extend(pending.drain(..take));
            let _ = callback.on_both_streams_ready(
                &staged,
                take / in_channels,
                data,
                data.len() / out_channels,
            );
        },
        move |err| forward_error(&output_events, Direction::Output, err),
        None,
    ) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(build_error(Direction::Output, err)));
            return;
        }
    };

    if let Err(err) = input_stream.play().and_then(|_| output_stream.play()) {
        let _ = ready_tx.send(Err(StreamError::Backend(err.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Park until the stop sender is dropped; the streams live on this thread.
    let _ = stop_rx.recv();
}

fn build_error(direction: Direction, err: cpal::BuildStreamError) -> StreamError {
    match err {
        cpal::BuildStreamError::StreamConfigNotSupported => StreamError::Unsupported(format!(
            "{direction} stream configuration rejected by the backend"
        )),
        cpal::BuildStreamError::DeviceNotAvailable => StreamError::NoDevice(direction),
        other => StreamError::Backend(other.to_string()),
    }
}

fn forward_error(events: &EventSender, direction: Direction, err: cpal::StreamError) {
    warn!("{direction} stream error: {err}");
    let event = match err {
        cpal::StreamError::DeviceNotAvailable => StreamErrorEvent {
            direction,
            phase: ErrorPhase::AfterClose,
            kind: StreamErrorKind::Disconnected,
        },
        other => StreamErrorEvent {
            direction,
            phase: ErrorPhase::BeforeClose,
            kind: StreamErrorKind::Backend(other.to_string()),
        },
    };
    let _ = events.send(event);
}

// ---------------------------------------------------------------------------
// Device lookup
// ---------------------------------------------------------------------------

fn find_device(host: &cpal::Host, spec: &StreamSpec) -> Result<cpal::Device, StreamError> {
    match &spec.device {
        None => match spec.direction {
            Direction::Input => host
                .default_input_device()
                .ok_or(StreamError::NoDevice(Direction::Input)),
            Direction::Output => host
                .default_output_device()
                .ok_or(StreamError::NoDevice(Direction::Output)),
        },
        Some(name) => {
            let mut devices = match spec.direction {
                Direction::Input => host.input_devices(),
                Direction::Output => host.output_devices(),
            }
            .map_err(|e| StreamError::Backend(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| StreamError::DeviceNotFound {
                    direction: spec.direction,
                    name: name.clone(),
                })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_maps_to_post_close_event() {
        let (tx, rx) = mpsc::channel();
        forward_error(&tx, Direction::Output, cpal::StreamError::DeviceNotAvailable);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.direction, Direction::Output);
        assert_eq!(event.phase, ErrorPhase::AfterClose);
        assert_eq!(event.kind, StreamErrorKind::Disconnected);
    }

    #[test]
    fn backend_error_maps_to_pre_close_event() {
        let (tx, rx) = mpsc::channel();
        let err = cpal::StreamError::BackendSpecific {
            err: cpal::BackendSpecificError {
                description: "xrun".into(),
            },
        };
        forward_error(&tx, Direction::Input, err);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, ErrorPhase::BeforeClose);
        assert!(matches!(event.kind, StreamErrorKind::Backend(ref msg) if msg.contains("xrun")));
    }

    #[test]
    fn unsupported_config_maps_to_unsupported() {
        let err = build_error(
            Direction::Output,
            cpal::BuildStreamError::StreamConfigNotSupported,
        );
        assert!(matches!(err, StreamError::Unsupported(_)));
    }

    #[test]
    fn host_constructs_without_devices() {
        let host = CpalHost::new();
        assert!(host.is_low_latency_recommended());
    }

    #[test]
    fn boxed_callback_is_driven_mutably_by_the_output_closure() {
        use crate::platform::CallbackResult;

        struct Counting {
            calls: usize,
        }
        impl DuplexCallback for Counting {
            fn on_both_streams_ready(
                &mut self,
                _input: &[f32],
                _input_frames: usize,
                output: &mut [f32],
                _output_frames: usize,
            ) -> CallbackResult {
                self.calls += 1;
                output.fill(self.calls as f32);
                CallbackResult::Continue
            }
        }

        // Same shape as the output-stream closure in `run_duplex`: the boxed
        // callback moves into an `FnMut` and is called via `&mut` per block.
        let mut callback: Box<dyn DuplexCallback> = Box::new(Counting { calls: 0 });
        let mut drive = move |data: &mut [f32]| {
            let frames = data.len();
            callback.on_both_streams_ready(&[], 0, data, frames)
        };

        let mut block = [0.0f32; 4];
        assert_eq!(drive(&mut block), CallbackResult::Continue);
        drive(&mut block);
        assert_eq!(block, [2.0; 4]);
    }
}
