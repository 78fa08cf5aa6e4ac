//! Real-time voice changer: a full-duplex audio bridge feeding a pluggable
//! voice-transformation engine, with a live parameter surface.
//!
//! # Architecture
//!
//! ```text
//! platform streams (cpal) ──▶ DuplexBridge ──▶ TransformEngine
//!        ▲                        │ async: FrameRing + FrameWorker
//!        │                        ▼
//!   VoiceChanger  ◀── ParamUpdate channel ── control thread
//!   (lifecycle: open/close, engine per cycle, reopen on disconnect)
//! ```
//!
//! The [`lifecycle::VoiceChanger`] owns the stream pair and the engine
//! instance; [`platform`] abstracts the audio backend behind traits so the
//! lifecycle is testable without hardware.

pub mod audio;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod platform;

pub use lifecycle::{EffectState, VoiceChanger};
