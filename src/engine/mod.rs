//! Voice-transformation engine: the capability trait, version selection, and
//! the live parameter surface.
//!
//! ```text
//!   control thread                      processing thread(s)
//!   ──────────────                      ────────────────────
//!   EngineParameters ──ParamUpdate──▶   EngineCell ──▶ TransformEngine
//!   (cached values)      (mpsc)         (drains, then processes)
//! ```

pub mod core;
pub mod params;

pub use self::core::{
    EngineError, EngineFactory, ModelVersion, PassthroughEngine, PassthroughFactory,
    TransformEngine,
};
pub use params::{EngineCell, EngineParameters, ParamUpdate, MAX_VOICES};

#[cfg(test)]
pub use self::core::MockEngine;
