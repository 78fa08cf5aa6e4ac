//! Stream/effect lifecycle: opening and closing the duplex pair, engine
//! construction, parameter caching, and disconnect recovery.

pub mod changer;
pub mod retry;
pub mod state;

pub use changer::{ChangerOptions, LifecycleError, VoiceChanger};
pub use retry::ReopenPolicy;
pub use state::EffectState;
