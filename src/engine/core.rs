//! The voice-transformation engine capability.
//!
//! [`TransformEngine`] is the seam between this crate and the model runtime:
//! given an input sample block it produces an equal-length output block, and
//! it exposes a live setter for every tunable parameter.  The crate never
//! looks inside the transformation — it owns the data flow around it.
//!
//! Engines are constructed through an [`EngineFactory`] from a [`ModelVersion`]
//! tag read out of the model descriptor.  An unknown tag is a construction
//! error; there is no "unloaded" placeholder engine.
//!
//! [`PassthroughEngine`] is a loopback stand-in (gain only, no model) used by
//! the demo binary and the tests.

use std::path::Path;

use thiserror::Error;

use crate::model::ModelDescriptor;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// All errors that can arise from the engine subsystem.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The descriptor carries a version tag this build does not know.
    #[error("unsupported model version: {0}")]
    UnsupportedVersion(u32),

    /// The engine failed to load the model files named by the descriptor.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// A processing pass failed.  The bridge mutes the affected block and
    /// keeps the stream running.
    #[error("processing failed: {0}")]
    Process(String),
}

// ---------------------------------------------------------------------------
// ModelVersion
// ---------------------------------------------------------------------------

/// The three known engine generations, selected by the descriptor's version
/// tag at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    V0,
    V1,
    V2,
}

impl TryFrom<u32> for ModelVersion {
    type Error = EngineError;

    fn try_from(tag: u32) -> Result<Self, EngineError> {
        match tag {
            0 => Ok(ModelVersion::V0),
            1 => Ok(ModelVersion::V1),
            2 => Ok(ModelVersion::V2),
            other => Err(EngineError::UnsupportedVersion(other)),
        }
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelVersion::V0 => write!(f, "v0"),
            ModelVersion::V1 => write!(f, "v1"),
            ModelVersion::V2 => write!(f, "v2"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransformEngine trait
// ---------------------------------------------------------------------------

/// Object-safe interface to one voice-transformation engine instance.
///
/// # Contract
///
/// - [`process`](Self::process): `input.len() == output.len()`; samples are
///   interleaved f32 at the sample rate the engine was constructed with.
///   Latency is bounded but model-dependent.
/// - Setters take effect on the next processed block.
/// - An instance carries internal state (filter history etc.); the lifecycle
///   never reuses one across effect off/on cycles.
pub trait TransformEngine: Send {
    /// Transform `input` into `output` in one pass.
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError>;

    /// Load model weights named by `descriptor`, resolved relative to the
    /// descriptor file at `path`.
    fn load_model(&mut self, descriptor: &ModelDescriptor, path: &Path)
        -> Result<(), EngineError>;

    /// Select the output timbre.  `voice == MAX_VOICES` selects the morphed
    /// (blended) voice.
    fn set_target_voice(&mut self, voice: usize);

    fn set_formant_shift(&mut self, semitones: f64);
    fn set_pitch_shift(&mut self, semitones: f64);
    fn set_input_gain(&mut self, db: f64);
    fn set_output_gain(&mut self, db: f64);
    fn set_average_source_pitch(&mut self, pitch: f64);
    fn set_intonation_intensity(&mut self, intensity: f64);
    fn set_pitch_correction(&mut self, amount: f64);
    fn set_pitch_correction_mode(&mut self, mode: u32);
    fn set_source_pitch_range(&mut self, min: f64, max: f64);
    fn set_vq_num_neighbors(&mut self, n: u32);
    fn set_morph_weight(&mut self, voice: usize, weight: f64);
}

// Compile-time assertion: Box<dyn TransformEngine> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn TransformEngine>) {}
};

// ---------------------------------------------------------------------------
// EngineFactory
// ---------------------------------------------------------------------------

/// Constructs engine instances by version tag.
///
/// Held behind `Box<dyn EngineFactory>` by the lifecycle so the model runtime
/// stays an injected capability.
pub trait EngineFactory: Send {
    fn create(
        &self,
        version: ModelVersion,
        sample_rate: u32,
    ) -> Result<Box<dyn TransformEngine>, EngineError>;
}

// ---------------------------------------------------------------------------
// PassthroughEngine
// ---------------------------------------------------------------------------

/// A loopback engine: applies input/output gain and copies samples through.
///
/// Useful for exercising the duplex path end-to-end without a model runtime;
/// this is what the demo binary runs.
pub struct PassthroughEngine {
    sample_rate: u32,
    input_amp: f32,
    output_amp: f32,
    model_name: Option<String>,
}

impl PassthroughEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            input_amp: 1.0,
            output_amp: 1.0,
            model_name: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn db_to_amp(db: f64) -> f32 {
        10f32.powf(db as f32 / 20.0)
    }
}

impl TransformEngine for PassthroughEngine {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
        if input.len() != output.len() {
            return Err(EngineError::Process(format!(
                "block length mismatch: {} in, {} out",
                input.len(),
                output.len()
            )));
        }
        let amp = self.input_amp * self.output_amp;
        for (o, i) in output.iter_mut().zip(input) {
            *o = i * amp;
        }
        Ok(())
    }

    fn load_model(
        &mut self,
        descriptor: &ModelDescriptor,
        _path: &Path,
    ) -> Result<(), EngineError> {
        self.model_name = Some(descriptor.model.name.clone());
        Ok(())
    }

    fn set_target_voice(&mut self, _voice: usize) {}
    fn set_formant_shift(&mut self, _semitones: f64) {}
    fn set_pitch_shift(&mut self, _semitones: f64) {}

    fn set_input_gain(&mut self, db: f64) {
        self.input_amp = Self::db_to_amp(db);
    }

    fn set_output_gain(&mut self, db: f64) {
        self.output_amp = Self::db_to_amp(db);
    }

    fn set_average_source_pitch(&mut self, _pitch: f64) {}
    fn set_intonation_intensity(&mut self, _intensity: f64) {}
    fn set_pitch_correction(&mut self, _amount: f64) {}
    fn set_pitch_correction_mode(&mut self, _mode: u32) {}
    fn set_source_pitch_range(&mut self, _min: f64, _max: f64) {}
    fn set_vq_num_neighbors(&mut self, _n: u32) {}
    fn set_morph_weight(&mut self, _voice: usize, _weight: f64) {}
}

/// Factory producing [`PassthroughEngine`]s for every known version.
pub struct PassthroughFactory;

impl EngineFactory for PassthroughFactory {
    fn create(
        &self,
        _version: ModelVersion,
        sample_rate: u32,
    ) -> Result<Box<dyn TransformEngine>, EngineError> {
        Ok(Box::new(PassthroughEngine::new(sample_rate)))
    }
}

// ---------------------------------------------------------------------------
// MockEngine  (test-only)
// ---------------------------------------------------------------------------

/// A test double that multiplies samples by a fixed factor and records every
/// call it receives into a shared log.
#[cfg(test)]
pub struct MockEngine {
    pub calls: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    scale: f32,
    fail_process: bool,
    fail_load: bool,
}

#[cfg(test)]
impl MockEngine {
    /// Identity transform, no failures.
    pub fn new() -> Self {
        Self::scaling(1.0)
    }

    /// Multiplies every sample by `scale`.
    pub fn scaling(scale: f32) -> Self {
        Self {
            calls: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
            scale,
            fail_process: false,
            fail_load: false,
        }
    }

    /// Every `process` call fails.
    pub fn failing() -> Self {
        let mut e = Self::new();
        e.fail_process = true;
        e
    }

    /// `load_model` fails.
    pub fn failing_load() -> Self {
        let mut e = Self::new();
        e.fail_load = true;
        e
    }

    /// Shared handle to the call log.
    pub fn call_log(&self) -> std::sync::Arc<std::sync::Mutex<Vec<String>>> {
        std::sync::Arc::clone(&self.calls)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[cfg(test)]
impl TransformEngine for MockEngine {
    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(), EngineError> {
        self.record(format!("process({})", input.len()));
        if self.fail_process {
            return Err(EngineError::Process("mock failure".into()));
        }
        for (o, i) in output.iter_mut().zip(input) {
            *o = i * self.scale;
        }
        Ok(())
    }

    fn load_model(
        &mut self,
        descriptor: &ModelDescriptor,
        _path: &Path,
    ) -> Result<(), EngineError> {
        self.record(format!("load_model({})", descriptor.model.name));
        if self.fail_load {
            return Err(EngineError::ModelLoad("mock load failure".into()));
        }
        Ok(())
    }

    fn set_target_voice(&mut self, voice: usize) {
        self.record(format!("set_target_voice({voice})"));
    }

    fn set_formant_shift(&mut self, semitones: f64) {
        self.record(format!("set_formant_shift({semitones})"));
    }

    fn set_pitch_shift(&mut self, semitones: f64) {
        self.record(format!("set_pitch_shift({semitones})"));
    }

    fn set_input_gain(&mut self, db: f64) {
        self.record(format!("set_input_gain({db})"));
    }

    fn set_output_gain(&mut self, db: f64) {
        self.record(format!("set_output_gain({db})"));
    }

    fn set_average_source_pitch(&mut self, pitch: f64) {
        self.record(format!("set_average_source_pitch({pitch})"));
    }

    fn set_intonation_intensity(&mut self, intensity: f64) {
        self.record(format!("set_intonation_intensity({intensity})"));
    }

    fn set_pitch_correction(&mut self, amount: f64) {
        self.record(format!("set_pitch_correction({amount})"));
    }

    fn set_pitch_correction_mode(&mut self, mode: u32) {
        self.record(format!("set_pitch_correction_mode({mode})"));
    }

    fn set_source_pitch_range(&mut self, min: f64, max: f64) {
        self.record(format!("set_source_pitch_range({min}, {max})"));
    }

    fn set_vq_num_neighbors(&mut self, n: u32) {
        self.record(format!("set_vq_num_neighbors({n})"));
    }

    fn set_morph_weight(&mut self, voice: usize, weight: f64) {
        self.record(format!("set_morph_weight({voice}, {weight})"));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // --- ModelVersion ---

    #[test]
    fn known_version_tags_convert() {
        assert_eq!(ModelVersion::try_from(0).unwrap(), ModelVersion::V0);
        assert_eq!(ModelVersion::try_from(1).unwrap(), ModelVersion::V1);
        assert_eq!(ModelVersion::try_from(2).unwrap(), ModelVersion::V2);
    }

    #[test]
    fn unknown_version_tag_is_an_error() {
        let err = ModelVersion::try_from(3).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedVersion(3)));
        assert!(err.to_string().contains('3'));
    }

    // --- PassthroughEngine ---

    #[test]
    fn passthrough_copies_samples_at_unity_gain() {
        let mut engine = PassthroughEngine::new(48_000);
        let input = [0.1f32, -0.2, 0.3, -0.4];
        let mut output = [0.0f32; 4];
        engine.process(&input, &mut output).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn passthrough_applies_gains_in_db() {
        let mut engine = PassthroughEngine::new(48_000);
        // +6 dB in and +6 dB out ≈ ×3.98 total
        engine.set_input_gain(6.0);
        engine.set_output_gain(6.0);
        let mut output = [0.0f32; 1];
        engine.process(&[0.25], &mut output).unwrap();
        assert!((output[0] - 0.25 * 3.981).abs() < 1e-2);
    }

    #[test]
    fn passthrough_rejects_mismatched_blocks() {
        let mut engine = PassthroughEngine::new(48_000);
        let mut output = [0.0f32; 3];
        let err = engine.process(&[0.0; 4], &mut output).unwrap_err();
        assert!(matches!(err, EngineError::Process(_)));
    }

    #[test]
    fn passthrough_factory_creates_for_every_version() {
        for version in [ModelVersion::V0, ModelVersion::V1, ModelVersion::V2] {
            assert!(PassthroughFactory.create(version, 48_000).is_ok());
        }
    }

    // --- MockEngine ---

    #[test]
    fn mock_scales_and_records() {
        let mut engine = MockEngine::scaling(2.0);
        let log = engine.call_log();
        let mut output = [0.0f32; 2];
        engine.process(&[0.5, -0.5], &mut output).unwrap();
        assert_eq!(output, [1.0, -1.0]);
        assert_eq!(log.lock().unwrap().as_slice(), &["process(2)".to_string()]);
    }

    #[test]
    fn mock_failing_reports_process_error() {
        let mut engine = MockEngine::failing();
        let mut output = [0.0f32; 1];
        assert!(matches!(
            engine.process(&[0.0], &mut output),
            Err(EngineError::Process(_))
        ));
    }

    // --- object safety ---

    #[test]
    fn box_dyn_engine_compiles() {
        let mut engine: Box<dyn TransformEngine> = Box::new(PassthroughEngine::new(48_000));
        let mut output = [0.0f32; 2];
        engine.process(&[0.0, 0.0], &mut output).unwrap();
    }
}
