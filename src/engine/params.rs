//! The live-tunable parameter surface and its update plumbing.
//!
//! [`EngineParameters`] is the lifecycle-owned cache of every knob.  It
//! outlives any single engine instance, so values set while the effect is off
//! are pushed into the next engine at the following effect-on transition.
//!
//! While the effect is on, individual changes travel as [`ParamUpdate`]
//! messages over an mpsc channel and are drained by [`EngineCell::process`]
//! immediately before each processing pass, so the engine never observes a
//! torn update and the control thread never touches the engine directly.

use std::sync::mpsc::Receiver;

use super::core::{EngineError, TransformEngine};
use crate::model::ModelDescriptor;

/// Size of the fixed voice table.  Index `MAX_VOICES` (one past the table)
/// addresses the morphed/blended voice.
pub const MAX_VOICES: usize = 256;

// ---------------------------------------------------------------------------
// EngineParameters
// ---------------------------------------------------------------------------

/// Cached values for every live-tunable engine parameter.
#[derive(Debug, Clone)]
pub struct EngineParameters {
    /// Selected output timbre, `0..=MAX_VOICES` (`MAX_VOICES` = morph).
    pub target_voice: usize,
    pub formant_shift: f64,
    pub pitch_shift: f64,
    pub input_gain: f64,
    pub output_gain: f64,
    pub intonation_intensity: f64,
    pub pitch_correction: f64,
    pub pitch_correction_mode: u32,
    pub min_source_pitch: f64,
    pub max_source_pitch: f64,
    pub vq_num_neighbors: u32,
    /// Base average target pitch per voice, plus one extra slot for the
    /// morphed voice (arithmetic mean of the populated voices, computed when
    /// the descriptor is loaded).
    pub average_target_pitch_base: Vec<f64>,
    /// Per-voice morph weight, `MAX_VOICES` entries.
    pub morph_weights: Vec<f64>,
}

impl Default for EngineParameters {
    fn default() -> Self {
        Self {
            target_voice: 0,
            formant_shift: 0.0,
            pitch_shift: 0.0,
            input_gain: 0.0,
            output_gain: 0.0,
            intonation_intensity: 1.0,
            pitch_correction: 0.0,
            pitch_correction_mode: 0,
            min_source_pitch: 33.125,
            max_source_pitch: 80.875,
            vq_num_neighbors: 4,
            average_target_pitch_base: vec![0.0; MAX_VOICES + 1],
            morph_weights: vec![0.0; MAX_VOICES],
        }
    }
}

impl EngineParameters {
    /// Fill the pitch-base table from a loaded descriptor.
    ///
    /// Slot `i` takes voice `i`'s average pitch; the extra morph slot takes
    /// the arithmetic mean over all populated voices.
    pub fn load_pitch_table(&mut self, descriptor: &ModelDescriptor) {
        self.average_target_pitch_base = vec![0.0; MAX_VOICES + 1];
        let n = descriptor.voices.len().min(MAX_VOICES);
        for (slot, voice) in self.average_target_pitch_base[..n]
            .iter_mut()
            .zip(&descriptor.voices)
        {
            *slot = voice.average_pitch;
        }
        if n > 0 {
            let sum: f64 = descriptor.voices[..n].iter().map(|v| v.average_pitch).sum();
            self.average_target_pitch_base[MAX_VOICES] = sum / n as f64;
        }
    }

    /// Derived average source pitch: the selected voice's base average target
    /// pitch minus the current pitch shift.  Recomputed whenever the voice or
    /// the pitch shift changes.
    pub fn average_source_pitch(&self) -> f64 {
        self.average_target_pitch_base[self.target_voice] - self.pitch_shift
    }

    /// Push every cached value (including the derived average source pitch)
    /// into a freshly constructed engine.
    pub fn apply_to(&self, engine: &mut dyn TransformEngine) {
        engine.set_target_voice(self.target_voice);
        engine.set_formant_shift(self.formant_shift);
        engine.set_pitch_shift(self.pitch_shift);
        engine.set_input_gain(self.input_gain);
        engine.set_output_gain(self.output_gain);
        engine.set_average_source_pitch(self.average_source_pitch());
        engine.set_intonation_intensity(self.intonation_intensity);
        engine.set_pitch_correction(self.pitch_correction);
        engine.set_pitch_correction_mode(self.pitch_correction_mode);
        engine.set_source_pitch_range(self.min_source_pitch, self.max_source_pitch);
        engine.set_vq_num_neighbors(self.vq_num_neighbors);
        for (voice, &weight) in self.morph_weights.iter().enumerate() {
            engine.set_morph_weight(voice, weight);
        }
    }
}

// ---------------------------------------------------------------------------
// ParamUpdate
// ---------------------------------------------------------------------------

/// One live parameter change, applied on the processing side at the next
/// block boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamUpdate {
    TargetVoice(usize),
    FormantShift(f64),
    PitchShift(f64),
    InputGain(f64),
    OutputGain(f64),
    AverageSourcePitch(f64),
    IntonationIntensity(f64),
    PitchCorrection(f64),
    PitchCorrectionMode(u32),
    SourcePitchRange(f64, f64),
    VqNumNeighbors(u32),
    MorphWeight(usize, f64),
}

impl ParamUpdate {
    fn apply(&self, engine: &mut dyn TransformEngine) {
        match *self {
            ParamUpdate::TargetVoice(v) => engine.set_target_voice(v),
            ParamUpdate::FormantShift(v) => engine.set_formant_shift(v),
            ParamUpdate::PitchShift(v) => engine.set_pitch_shift(v),
            ParamUpdate::InputGain(v) => engine.set_input_gain(v),
            ParamUpdate::OutputGain(v) => engine.set_output_gain(v),
            ParamUpdate::AverageSourcePitch(v) => engine.set_average_source_pitch(v),
            ParamUpdate::IntonationIntensity(v) => engine.set_intonation_intensity(v),
            ParamUpdate::PitchCorrection(v) => engine.set_pitch_correction(v),
            ParamUpdate::PitchCorrectionMode(v) => engine.set_pitch_correction_mode(v),
            ParamUpdate::SourcePitchRange(min, max) => engine.set_source_pitch_range(min, max),
            ParamUpdate::VqNumNeighbors(v) => engine.set_vq_num_neighbors(v),
            ParamUpdate::MorphWeight(voice, w) => engine.set_morph_weight(voice, w),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineCell
// ---------------------------------------------------------------------------

/// The processing-side home of an engine instance: the engine itself plus the
/// receiving end of the live-update channel.
///
/// Held behind a `Mutex` shared by the duplex bridge (synchronous path) and
/// the frame worker (asynchronous path).  Pending updates are drained before
/// every pass so a block is always processed under one consistent parameter
/// snapshot.
pub struct EngineCell {
    engine: Box<dyn TransformEngine>,
    updates: Receiver<ParamUpdate>,
}

impl EngineCell {
    pub fn new(engine: Box<dyn TransformEngine>, updates: Receiver<ParamUpdate>) -> Self {
        Self { engine, updates }
    }

    /// Apply pending parameter updates, then run one processing pass.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
        for update in self.updates.try_iter() {
            update.apply(self.engine.as_mut());
        }
        self.engine.process(input, output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
