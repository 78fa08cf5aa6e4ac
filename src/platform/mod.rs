//! Platform audio-stream interfaces consumed by the lifecycle.
//!
//! The voice changer does not talk to audio hardware directly.  Everything it
//! needs from the platform is expressed here as traits:
//!
//! - [`AudioHost`] — opens streams from a [`StreamSpec`], pairs them into a
//!   duplex callback, and hands out a [`LatencyTuner`] for the output stream.
//! - [`AudioStream`] — a single opened stream: negotiated sample rate, channel
//!   count, buffer capacity, `stop`/`close`.
//! - [`DuplexCallback`] — invoked by the platform once both streams have
//!   data/space ready.  Implemented by [`crate::audio::DuplexBridge`].
//! - [`LatencyTuner`] — `tune()` hook invoked once per callback to let the
//!   backend adapt its buffering.
//!
//! Asynchronous stream errors (device unplugged, backend failure) are
//! delivered as [`StreamErrorEvent`]s over an mpsc channel so the control
//! thread can react without the platform calling back into the lifecycle.
//!
//! The production implementation is [`CpalHost`](cpal_host::CpalHost).

use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cpal_host;

pub use cpal_host::CpalHost;

// ---------------------------------------------------------------------------
// Stream configuration
// ---------------------------------------------------------------------------

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Which platform audio API family to use when opening streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioBackend {
    /// The platform's preferred low-latency backend.
    Native,
    /// A conservative compatibility path (larger buffers, shared access).
    Compatibility,
}

impl Default for AudioBackend {
    fn default() -> Self {
        Self::Native
    }
}

/// Latency/power trade-off requested from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceMode {
    /// Smallest buffers the backend supports.
    LowLatency,
    /// Backend default buffering.
    None,
    /// Larger buffers, fewer wakeups.
    PowerSaving,
}

impl Default for PerformanceMode {
    fn default() -> Self {
        Self::LowLatency
    }
}

/// Exclusive vs. shared device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingMode {
    Exclusive,
    Shared,
}

impl Default for SharingMode {
    fn default() -> Self {
        Self::Exclusive
    }
}

/// Everything the lifecycle requests when opening one stream.
///
/// `sample_rate: None` lets the device pick; the lifecycle reads the
/// negotiated rate back from the opened output stream and pins the input
/// stream to it.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub direction: Direction,
    /// Device name, or `None` for the system default.
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: u16,
    pub sharing: SharingMode,
    pub performance: PerformanceMode,
    pub backend: AudioBackend,
    /// Requested buffer capacity in frames; `None` lets the backend pick.
    pub buffer_capacity_frames: Option<usize>,
}

impl StreamSpec {
    /// A mono spec with backend defaults for everything else.
    pub fn mono(direction: Direction) -> Self {
        Self {
            direction,
            device: None,
            sample_rate: None,
            channels: 1,
            sharing: SharingMode::default(),
            performance: PerformanceMode::default(),
            backend: AudioBackend::default(),
            buffer_capacity_frames: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamError
// ---------------------------------------------------------------------------

/// Errors from opening, starting or stopping platform streams.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no {0} device available on the audio host")]
    NoDevice(Direction),

    #[error("{direction} device not found: '{name}'")]
    DeviceNotFound { direction: Direction, name: String },

    #[error("unsupported stream configuration: {0}")]
    Unsupported(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Stream error events
// ---------------------------------------------------------------------------

/// Whether the platform delivered the error before or after it closed the
/// affected stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    BeforeClose,
    AfterClose,
}

/// Cause classification for asynchronous stream errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The device backing the stream disappeared.  The lifecycle reacts to
    /// this by reopening per its [`ReopenPolicy`](crate::lifecycle::ReopenPolicy).
    Disconnected,
    /// Any other backend-reported failure; reported, never retried.
    Backend(String),
}

/// An asynchronous error delivered by the platform while streams are running.
#[derive(Debug, Clone)]
pub struct StreamErrorEvent {
    pub direction: Direction,
    pub phase: ErrorPhase,
    pub kind: StreamErrorKind,
}

/// Channel end the host uses to deliver [`StreamErrorEvent`]s.
pub type EventSender = mpsc::Sender<StreamErrorEvent>;

// ---------------------------------------------------------------------------
// Callback + tuner traits
// ---------------------------------------------------------------------------

/// Signal returned from every duplex callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    /// Keep the streams running.
    Continue,
    /// Stop delivering callbacks.
    Stop,
}

/// The callback-facing side of the duplex pair.
///
/// Invoked on the platform's real-time audio thread once both streams have
/// data/space ready.  `input` holds `input_frames × input-channels` samples;
/// `output` has room for `output_frames × output-channels` samples and must be
/// fully written (unused tail zeroed).  Implementations must not block.
pub trait DuplexCallback: Send {
    fn on_both_streams_ready(
        &mut self,
        input: &[f32],
        input_frames: usize,
        output: &mut [f32],
        output_frames: usize,
    ) -> CallbackResult;
}

/// Adaptive buffer-size tuning hook bound to the output stream.
///
/// The bridge calls [`tune`](Self::tune) once per callback after producing
/// output; backends that cannot retune live provide [`NullTuner`].
pub trait LatencyTuner: Send {
    fn tune(&mut self);
}

/// A tuner that does nothing.
pub struct NullTuner;

impl LatencyTuner for NullTuner {
    fn tune(&mut self) {}
}

// ---------------------------------------------------------------------------
// AudioStream / AudioHost
// ---------------------------------------------------------------------------

/// One opened platform stream.
pub trait AudioStream {
    /// Negotiated sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Negotiated interleaved channel count.
    fn channel_count(&self) -> u16;

    /// Negotiated buffer capacity in frames.
    fn buffer_capacity_frames(&self) -> usize;

    /// Stop delivering callbacks.  Safe to call more than once.
    fn stop(&mut self) -> Result<(), StreamError>;

    /// Stop and release the underlying stream.  Safe to call more than once.
    fn close(&mut self) -> Result<(), StreamError>;
}

/// A platform audio host: opens streams and pairs them into a duplex.
pub trait AudioHost {
    type Stream: AudioStream;

    /// Open one stream.  Asynchronous errors for this stream are delivered
    /// through `events` for as long as the stream lives.
    fn open_stream(
        &self,
        spec: &StreamSpec,
        events: EventSender,
    ) -> Result<Self::Stream, StreamError>;

    /// Start both streams and route their data through `callback`.
    ///
    /// Returns once the streams are running (or fails synchronously when the
    /// backend rejects them).  The callback is dropped when the output stream
    /// stops or closes.
    fn start_duplex(
        &self,
        input: &mut Self::Stream,
        output: &mut Self::Stream,
        callback: Box<dyn DuplexCallback>,
    ) -> Result<(), StreamError>;

    /// A latency tuner bound to `output`.
    fn latency_tuner(&self, output: &Self::Stream) -> Box<dyn LatencyTuner>;

    /// Whether the platform's preferred low-latency backend is recommended on
    /// this machine.
    fn is_low_latency_recommended(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_spec_defaults() {
        let spec = StreamSpec::mono(Direction::Output);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.direction, Direction::Output);
        assert!(spec.device.is_none());
        assert!(spec.sample_rate.is_none());
        assert_eq!(spec.sharing, SharingMode::Exclusive);
        assert_eq!(spec.performance, PerformanceMode::LowLatency);
        assert_eq!(spec.backend, AudioBackend::Native);
    }

    #[test]
    fn stream_error_display_mentions_direction() {
        let e = StreamError::NoDevice(Direction::Input);
        assert!(e.to_string().contains("input"));

        let e = StreamError::DeviceNotFound {
            direction: Direction::Output,
            name: "USB Mic".into(),
        };
        assert!(e.to_string().contains("USB Mic"));
        assert!(e.to_string().contains("output"));
    }

    #[test]
    fn null_tuner_is_callable() {
        let mut tuner = NullTuner;
        tuner.tune();
        tuner.tune();
    }

    #[test]
    fn duplex_callback_is_object_safe() {
        struct Silence;
        impl DuplexCallback for Silence {
            fn on_both_streams_ready(
                &mut self,
                _input: &[f32],
                _input_frames: usize,
                output: &mut [f32],
                _output_frames: usize,
            ) -> CallbackResult {
                output.fill(0.0);
                CallbackResult::Continue
            }
        }

        let mut cb: Box<dyn DuplexCallback> = Box::new(Silence);
        let mut out = [1.0f32; 4];
        let res = cb.on_both_streams_ready(&[0.0; 4], 4, &mut out, 4);
        assert_eq!(res, CallbackResult::Continue);
        assert_eq!(out, [0.0; 4]);
    }
}
