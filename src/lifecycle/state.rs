//! Effect state.

/// Whether the voice-changing effect (and its stream pair) is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EffectState {
    #[default]
    Off,
    On,
}

impl EffectState {
    pub fn is_on(self) -> bool {
        self == EffectState::On
    }
}

impl std::fmt::Display for EffectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectState::Off => write!(f, "off"),
            EffectState::On => write!(f, "on"),
        }
    }
}
