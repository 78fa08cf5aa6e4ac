//! Real-time audio data path — frame ring → worker thread → duplex bridge.
//!
//! ```text
//! platform callback → DuplexBridge ── sync ──▶ TransformEngine (in callback)
//!                          │
//!                          └─ async ─▶ FrameRing → FrameWorker → TransformEngine
//! ```

pub mod duplex;
pub mod ring;
pub mod worker;

pub use duplex::{BridgeConfig, BridgeStats, DuplexBridge, ProcessingMode};
pub use ring::{FrameRing, RingConsumer, RingStats};
pub use worker::FrameWorker;
