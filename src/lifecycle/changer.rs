//! The voice-changer lifecycle: stream pair, engine instance, and the live
//! control surface.
//!
//! Turning the effect on runs a fixed sequence:
//!
//! 1. open the output stream (device picks the sample rate)
//! 2. open the input stream pinned to that rate, with twice the output's
//!    buffer capacity
//! 3. construct an engine for the descriptor's version tag
//! 4. load the model and push every cached parameter
//! 5. build the duplex bridge and start both streams
//!
//! Any failure along the way closes whatever was opened and leaves the effect
//! off.  Turning the effect off closes both streams; the engine is dropped
//! with the bridge and a fresh one is built on the next start.
//!
//! Parameter setters always update the cached [`EngineParameters`]; while the
//! effect is on they additionally send a [`ParamUpdate`] to the running
//! engine.  Derived values (average source pitch) are recomputed and pushed by
//! the setters that influence them.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use log::{info, warn};
use thiserror::Error;

use super::retry::ReopenPolicy;
use super::state::EffectState;
use crate::audio::{BridgeConfig, BridgeStats, DuplexBridge, ProcessingMode};
use crate::engine::{
    EngineError, EngineFactory, EngineParameters, ModelVersion, ParamUpdate, MAX_VOICES,
};
use crate::model::ModelDescriptor;
use crate::platform::{
    AudioBackend, AudioHost, AudioStream, Direction, ErrorPhase, PerformanceMode, StreamError,
    StreamErrorEvent, StreamErrorKind, StreamSpec,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to open output stream: {0}")]
    OutputStream(#[source] StreamError),

    #[error("failed to open input stream: {0}")]
    InputStream(#[source] StreamError),

    #[error("failed to start streams: {0}")]
    Start(#[source] StreamError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to spawn frame worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("invalid voice id {0}")]
    InvalidVoice(usize),

    #[error("audio options cannot change while the effect is on")]
    EffectActive,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Audio-path options, fixed while the effect is on.
#[derive(Debug, Clone)]
pub struct ChangerOptions {
    pub mode: ProcessingMode,
    /// Engine block size in samples.
    pub frame_size: usize,
    /// Ring depth in frames (asynchronous mode).
    pub buffer_count: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub backend: AudioBackend,
    pub performance: PerformanceMode,
}

impl Default for ChangerOptions {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Synchronous,
            frame_size: 480,
            buffer_count: 2,
            input_device: None,
            output_device: None,
            backend: AudioBackend::default(),
            performance: PerformanceMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// VoiceChanger
// ---------------------------------------------------------------------------

struct ActiveStreams<S> {
    input: S,
    output: S,
    sample_rate: u32,
    updates: Sender<ParamUpdate>,
    stats: BridgeStats,
}

pub struct VoiceChanger<H: AudioHost> {
    host: H,
    factory: Box<dyn EngineFactory>,
    descriptor: ModelDescriptor,
    descriptor_path: PathBuf,
    options: ChangerOptions,
    reopen: ReopenPolicy,
    params: EngineParameters,
    state: EffectState,
    events_tx: mpsc::Sender<StreamErrorEvent>,
    events_rx: Receiver<StreamErrorEvent>,
    active: Option<ActiveStreams<H::Stream>>,
}

impl<H: AudioHost> VoiceChanger<H> {
    pub fn new(
        host: H,
        factory: Box<dyn EngineFactory>,
        descriptor: ModelDescriptor,
        descriptor_path: PathBuf,
        options: ChangerOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let mut params = EngineParameters::default();
        params.load_pitch_table(&descriptor);
        Self {
            host,
            factory,
            descriptor,
            descriptor_path,
            options,
            reopen: ReopenPolicy::default(),
            params,
            state: EffectState::Off,
            events_tx,
            events_rx,
            active: None,
        }
    }

    // --- state ---

    pub fn state(&self) -> EffectState {
        self.state
    }

    /// Negotiated sample rate of the running stream pair.
    pub fn sample_rate(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.sample_rate)
    }

    pub fn stats(&self) -> Option<BridgeStats> {
        self.active.as_ref().map(|a| a.stats.clone())
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn model_name(&self) -> &str {
        &self.descriptor.model.name
    }

    pub fn voice_name(&self, id: usize) -> Option<&str> {
        self.descriptor.voice_name(id)
    }

    pub fn params(&self) -> &EngineParameters {
        &self.params
    }

    /// Whether the platform's low-latency backend is recommended here.
    pub fn is_low_latency_recommended(&self) -> bool {
        self.host.is_low_latency_recommended()
    }

    /// Switch the effect on or off.  Requesting the current state is a no-op.
    pub fn set_effect(&mut self, target: EffectState) -> Result<(), LifecycleError> {
        match (self.state, target) {
            (EffectState::Off, EffectState::On) => self.open_streams(),
            (EffectState::On, EffectState::Off) => {
                self.close_streams();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // --- configuration ---

    /// Replace the audio-path options.  Rejected while the effect is on.
    pub fn configure_audio(&mut self, options: ChangerOptions) -> Result<(), LifecycleError> {
        if self.state.is_on() {
            return Err(LifecycleError::EffectActive);
        }
        self.options = options;
        Ok(())
    }

    pub fn set_reopen_policy(&mut self, policy: ReopenPolicy) {
        self.reopen = policy;
    }

    // --- parameter setters ---

    /// Select the output voice.  Any id up to `MAX_VOICES` is accepted, even
    /// past the voices the descriptor populates (their base pitch is 0);
    /// `MAX_VOICES` itself selects the morphed voice.
    pub fn set_target_voice(&mut self, voice: usize) -> Result<(), LifecycleError> {
        if voice > MAX_VOICES {
            return Err(LifecycleError::InvalidVoice(voice));
        }
        self.params.target_voice = voice;
        self.push(ParamUpdate::TargetVoice(voice));
        self.push(ParamUpdate::AverageSourcePitch(
            self.params.average_source_pitch(),
        ));
        Ok(())
    }

    pub fn set_pitch_shift(&mut self, semitones: f64) {
        self.params.pitch_shift = semitones;
        self.push(ParamUpdate::PitchShift(semitones));
        self.push(ParamUpdate::AverageSourcePitch(
            self.params.average_source_pitch(),
        ));
    }

    pub fn set_formant_shift(&mut self, semitones: f64) {
        self.params.formant_shift = semitones;
        self.push(ParamUpdate::FormantShift(semitones));
    }

    pub fn set_input_gain(&mut self, db: f64) {
        self.params.input_gain = db;
        self.push(ParamUpdate::InputGain(db));
    }

    pub fn set_output_gain(&mut self, db: f64) {
        self.params.output_gain = db;
        self.push(ParamUpdate::OutputGain(db));
    }

    pub fn set_intonation_intensity(&mut self, intensity: f64) {
        self.params.intonation_intensity = intensity;
        self.push(ParamUpdate::IntonationIntensity(intensity));
    }

    pub fn set_pitch_correction(&mut self, amount: f64) {
        self.params.pitch_correction = amount;
        self.push(ParamUpdate::PitchCorrection(amount));
    }

    pub fn set_pitch_correction_mode(&mut self, mode: u32) {
        self.params.pitch_correction_mode = mode;
        self.push(ParamUpdate::PitchCorrectionMode(mode));
    }

    pub fn set_source_pitch_range(&mut self, min: f64, max: f64) {
        self.params.min_source_pitch = min;
        self.params.max_source_pitch = max;
        self.push(ParamUpdate::SourcePitchRange(min, max));
    }

    pub fn set_vq_num_neighbors(&mut self, n: u32) {
        self.params.vq_num_neighbors = n;
        self.push(ParamUpdate::VqNumNeighbors(n));
    }

    pub fn set_morph_weight(&mut self, voice: usize, weight: f64) -> Result<(), LifecycleError> {
        if voice >= MAX_VOICES {
            return Err(LifecycleError::InvalidVoice(voice));
        }
        self.params.morph_weights[voice] = weight;
        self.push(ParamUpdate::MorphWeight(voice, weight));
        Ok(())
    }

    /// Replace the whole parameter surface at once.  An out-of-range target
    /// voice is clamped to 0; the pitch-base table from the loaded descriptor
    /// is kept.
    pub fn set_parameters(&mut self, mut params: EngineParameters) {
        let named = params.target_voice < self.descriptor.voices.len().min(MAX_VOICES);
        if !named && params.target_voice != MAX_VOICES {
            warn!("target voice {} out of range, using 0", params.target_voice);
            params.target_voice = 0;
        }
        params.average_target_pitch_base = self.params.average_target_pitch_base.clone();
        self.params = params;
        self.push_all();
    }

    fn push_all(&self) {
        let p = &self.params;
        self.push(ParamUpdate::TargetVoice(p.target_voice));
        self.push(ParamUpdate::FormantShift(p.formant_shift));
        self.push(ParamUpdate::PitchShift(p.pitch_shift));
        self.push(ParamUpdate::InputGain(p.input_gain));
        self.push(ParamUpdate::OutputGain(p.output_gain));
        self.push(ParamUpdate::AverageSourcePitch(p.average_source_pitch()));
        self.push(ParamUpdate::IntonationIntensity(p.intonation_intensity));
        self.push(ParamUpdate::PitchCorrection(p.pitch_correction));
        self.push(ParamUpdate::PitchCorrectionMode(p.pitch_correction_mode));
        self.push(ParamUpdate::SourcePitchRange(
            p.min_source_pitch,
            p.max_source_pitch,
        ));
        self.push(ParamUpdate::VqNumNeighbors(p.vq_num_neighbors));
        for (voice, &weight) in p.morph_weights.iter().enumerate() {
            self.push(ParamUpdate::MorphWeight(voice, weight));
        }
    }

    fn push(&self, update: ParamUpdate) {
        if let Some(active) = &self.active {
            // The bridge owns the receiver; if it is gone the send just
            // drops, and the cache still carries the value forward.
            let _ = active.updates.send(update);
        }
    }

    // --- stream errors ---

    /// Drain pending stream-error events, reopening on post-close
    /// disconnections per the [`ReopenPolicy`].  Returns the number of
    /// events handled.
    pub fn process_stream_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.events_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            handled += 1;
            match (event.phase, &event.kind) {
                (ErrorPhase::AfterClose, StreamErrorKind::Disconnected) if self.state.is_on() => {
                    warn!("{} device disconnected, reopening streams", event.direction);
                    self.close_streams();
                    self.run_reopen_policy();
                }
                _ => warn!(
                    "{} stream error ({:?}): {:?}",
                    event.direction, event.phase, event.kind
                ),
            }
        }
        handled
    }

    fn run_reopen_policy(&mut self) {
        for attempt in 1..=self.reopen.max_attempts {
            if !self.reopen.backoff.is_zero() {
                thread::sleep(self.reopen.backoff);
            }
            match self.open_streams() {
                Ok(()) => {
                    info!("streams reopened on attempt {attempt}");
                    return;
                }
                Err(err) => warn!("reopen attempt {attempt} failed: {err}"),
            }
        }
        warn!(
            "effect stays off after {} failed reopen attempt(s)",
            self.reopen.max_attempts
        );
    }

    // --- open / close ---

    fn open_streams(&mut self) -> Result<(), LifecycleError> {
        let mut spec = StreamSpec::mono(Direction::Output);
        spec.device = self.options.output_device.clone();
        spec.backend = self.options.backend;
        spec.performance = self.options.performance;
        let mut output = self
            .host
            .open_stream(&spec, self.events_tx.clone())
            .map_err(LifecycleError::OutputStream)?;
        let sample_rate = output.sample_rate();

        let mut spec = StreamSpec::mono(Direction::Input);
        spec.device = self.options.input_device.clone();
        spec.backend = self.options.backend;
        spec.performance = self.options.performance;
        spec.sample_rate = Some(sample_rate);
        // Headroom so capture never starves the output side.
        spec.buffer_capacity_frames = Some(output.buffer_capacity_frames() * 2);
        let mut input = match self.host.open_stream(&spec, self.events_tx.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = output.close();
                return Err(LifecycleError::InputStream(err));
            }
        };

        match self.build_and_start(&mut input, &mut output, sample_rate) {
            Ok((updates, stats)) => {
                self.active = Some(ActiveStreams {
                    input,
                    output,
                    sample_rate,
                    updates,
                    stats,
                });
                self.state = EffectState::On;
                info!(
                    "effect on: model '{}' at {} Hz, {:?} processing",
                    self.descriptor.model.name, sample_rate, self.options.mode
                );
                Ok(())
            }
            Err(err) => {
                let _ = input.close();
                let _ = output.close();
                Err(err)
            }
        }
    }

    fn build_and_start(
        &self,
        input: &mut H::Stream,
        output: &mut H::Stream,
        sample_rate: u32,
    ) -> Result<(Sender<ParamUpdate>, BridgeStats), LifecycleError> {
        let version = ModelVersion::try_from(self.descriptor.model.version)?;
        let mut engine = self.factory.create(version, sample_rate)?;
        engine.load_model(&self.descriptor, &self.descriptor_path)?;
        self.params.apply_to(engine.as_mut());

        let (updates_tx, updates_rx) = mpsc::channel();
        let tuner = self.host.latency_tuner(output);
        let bridge = DuplexBridge::new(
            BridgeConfig {
                mode: self.options.mode,
                frame_size: self.options.frame_size,
                buffer_count: self.options.buffer_count,
                input_channels: input.channel_count() as usize,
                output_channels: output.channel_count() as usize,
            },
            engine,
            updates_rx,
            tuner,
        )?;
        let stats = bridge.stats();

        self.host
            .start_duplex(input, output, Box::new(bridge))
            .map_err(LifecycleError::Start)?;
        Ok((updates_tx, stats))
    }

    fn close_streams(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(err) = active.input.stop().and_then(|_| active.input.close()) {
                warn!("closing input stream: {err}");
            }
            if let Err(err) = active.output.stop().and_then(|_| active.output.close()) {
                warn!("closing output stream: {err}");
            }
            info!("effect off");
        }
        self.state = EffectState::Off;
    }
}

impl<H: AudioHost> Drop for VoiceChanger<H> {
    fn drop(&mut self) {
        self.close_streams();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::engine::{MockEngine, TransformEngine};
    use crate::model::{ModelInfo, VoiceDescriptor};
    use crate::platform::{CallbackResult, DuplexCallback, EventSender, LatencyTuner, NullTuner};

    // --- mock host ---

    #[derive(Default)]
    struct HostState {
        opened: Vec<StreamSpec>,
        closed: Vec<Direction>,
        starts: usize,
        fail_output_open: bool,
        fail_input_open: bool,
        fail_start: bool,
        events: Option<EventSender>,
        callback: Option<Box<dyn DuplexCallback>>,
    }

    #[derive(Clone, Default)]
    struct MockHost {
        state: Rc<RefCell<HostState>>,
    }

    struct MockStream {
        direction: Direction,
        sample_rate: u32,
        capacity: usize,
        channels: u16,
        state: Rc<RefCell<HostState>>,
    }

    impl AudioHost for MockHost {
        type Stream = MockStream;

        fn open_stream(
            &self,
            spec: &StreamSpec,
            events: EventSender,
        ) -> Result<MockStream, StreamError> {
            let mut state = self.state.borrow_mut();
            let fail = match spec.direction {
                Direction::Input => state.fail_input_open,
                Direction::Output => state.fail_output_open,
            };
            if fail {
                return Err(StreamError::NoDevice(spec.direction));
            }
            state.opened.push(spec.clone());
            state.events = Some(events);
            Ok(MockStream {
                direction: spec.direction,
                sample_rate: spec.sample_rate.unwrap_or(48_000),
                capacity: spec.buffer_capacity_frames.unwrap_or(256),
                channels: spec.channels,
                state: Rc::clone(&self.state),
            })
        }

        fn start_duplex(
            &self,
            _input: &mut MockStream,
            _output: &mut MockStream,
            callback: Box<dyn DuplexCallback>,
        ) -> Result<(), StreamError> {
            let mut state = self.state.borrow_mut();
            if state.fail_start {
                return Err(StreamError::Backend("mock start failure".into()));
            }
            state.starts += 1;
            state.callback = Some(callback);
            Ok(())
        }

        fn latency_tuner(&self, _output: &MockStream) -> Box<dyn LatencyTuner> {
            Box::new(NullTuner)
        }

        fn is_low_latency_recommended(&self) -> bool {
            true
        }
    }

    impl AudioStream for MockStream {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channel_count(&self) -> u16 {
            self.channels
        }

        fn buffer_capacity_frames(&self) -> usize {
            self.capacity
        }

        fn stop(&mut self) -> Result<(), StreamError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), StreamError> {
            self.state.borrow_mut().closed.push(self.direction);
            Ok(())
        }
    }

    // --- recording factory ---

    type EngineLog = Arc<Mutex<Vec<String>>>;

    #[derive(Clone)]
    struct RecordingFactory {
        created: Arc<AtomicUsize>,
        logs: Arc<Mutex<Vec<EngineLog>>>,
        fail_load: bool,
        scale: f32,
    }

    impl RecordingFactory {
        fn new() -> Self {
            Self {
                created: Arc::new(AtomicUsize::new(0)),
                logs: Arc::new(Mutex::new(Vec::new())),
                fail_load: false,
                scale: 1.0,
            }
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::Relaxed)
        }

        fn log(&self, index: usize) -> EngineLog {
            Arc::clone(&self.logs.lock().unwrap()[index])
        }
    }

    impl EngineFactory for RecordingFactory {
        fn create(
            &self,
            _version: ModelVersion,
            _sample_rate: u32,
        ) -> Result<Box<dyn TransformEngine>, EngineError> {
            self.created.fetch_add(1, Ordering::Relaxed);
            let engine = if self.fail_load {
                MockEngine::failing_load()
            } else {
                MockEngine::scaling(self.scale)
            };
            self.logs.lock().unwrap().push(engine.call_log());
            Ok(Box::new(engine))
        }
    }

    // --- fixtures ---

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            model: ModelInfo {
                name: "demo".into(),
                version: 2,
            },
            voices: vec![
                VoiceDescriptor {
                    name: "alto".into(),
                    description: String::new(),
                    average_pitch: 52.0,
                    portrait: None,
                },
                VoiceDescriptor {
                    name: "bass".into(),
                    description: String::new(),
                    average_pitch: 40.0,
                    portrait: None,
                },
            ],
        }
    }

    fn changer(host: MockHost, factory: RecordingFactory) -> VoiceChanger<MockHost> {
        VoiceChanger::new(
            host,
            Box::new(factory),
            descriptor(),
            PathBuf::from("/models/demo.toml"),
            ChangerOptions::default(),
        )
    }

    fn send_event(host: &MockHost, phase: ErrorPhase, kind: StreamErrorKind) {
        let events = host.state.borrow().events.clone().unwrap();
        events
            .send(StreamErrorEvent {
                direction: Direction::Output,
                phase,
                kind,
            })
            .unwrap();
    }

    // --- open sequence ---

    #[test]
    fn effect_on_opens_output_then_input_at_negotiated_rate() {
        let host = MockHost::default();
        let mut vc = changer(host.clone(), RecordingFactory::new());

        vc.set_effect(EffectState::On).unwrap();
        assert_eq!(vc.state(), EffectState::On);
        assert_eq!(vc.sample_rate(), Some(48_000));

        let state = host.state.borrow();
        assert_eq!(state.opened.len(), 2);
        assert_eq!(state.opened[0].direction, Direction::Output);
        assert_eq!(state.opened[1].direction, Direction::Input);
        // Input pinned to the output's rate, with doubled capacity.
        assert_eq!(state.opened[1].sample_rate, Some(48_000));
        assert_eq!(state.opened[1].buffer_capacity_frames, Some(512));
        assert_eq!(state.starts, 1);
    }

    #[test]
    fn output_open_failure_leaves_effect_off() {
        let host = MockHost::default();
        host.state.borrow_mut().fail_output_open = true;
        let mut vc = changer(host.clone(), RecordingFactory::new());

        let err = vc.set_effect(EffectState::On).unwrap_err();
        assert!(matches!(err, LifecycleError::OutputStream(_)));
        assert_eq!(vc.state(), EffectState::Off);
        assert!(host.state.borrow().closed.is_empty());
    }

    #[test]
    fn input_open_failure_closes_output() {
        let host = MockHost::default();
        host.state.borrow_mut().fail_input_open = true;
        let mut vc = changer(host.clone(), RecordingFactory::new());

        let err = vc.set_effect(EffectState::On).unwrap_err();
        assert!(matches!(err, LifecycleError::InputStream(_)));
        assert_eq!(host.state.borrow().closed, vec![Direction::Output]);
        assert_eq!(vc.state(), EffectState::Off);
    }

    #[test]
    fn unknown_model_version_closes_both_streams() {
        let host = MockHost::default();
        let mut desc = descriptor();
        desc.model.version = 7;
        let mut vc = VoiceChanger::new(
            host.clone(),
            Box::new(RecordingFactory::new()),
            desc,
            PathBuf::from("/models/demo.toml"),
            ChangerOptions::default(),
        );

        let err = vc.set_effect(EffectState::On).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::UnsupportedVersion(7))
        ));
        assert_eq!(
            host.state.borrow().closed,
            vec![Direction::Input, Direction::Output]
        );
        assert_eq!(vc.state(), EffectState::Off);
    }

    #[test]
    fn model_load_failure_rolls_back() {
        let host = MockHost::default();
        let mut factory = RecordingFactory::new();
        factory.fail_load = true;
        let mut vc = changer(host.clone(), factory);

        let err = vc.set_effect(EffectState::On).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Engine(EngineError::ModelLoad(_))
        ));
        assert_eq!(host.state.borrow().closed.len(), 2);
    }

    #[test]
    fn start_failure_rolls_back() {
        let host = MockHost::default();
        host.state.borrow_mut().fail_start = true;
        let mut vc = changer(host.clone(), RecordingFactory::new());

        let err = vc.set_effect(EffectState::On).unwrap_err();
        assert!(matches!(err, LifecycleError::Start(_)));
        assert_eq!(host.state.borrow().closed.len(), 2);
        assert_eq!(vc.state(), EffectState::Off);
    }

    // --- off / idempotency ---

    #[test]
    fn effect_off_closes_both_streams_and_is_idempotent() {
        let host = MockHost::default();
        let mut vc = changer(host.clone(), RecordingFactory::new());

        vc.set_effect(EffectState::On).unwrap();
        vc.set_effect(EffectState::On).unwrap(); // no-op
        assert_eq!(host.state.borrow().starts, 1);

        vc.set_effect(EffectState::Off).unwrap();
        vc.set_effect(EffectState::Off).unwrap(); // no-op
        assert_eq!(
            host.state.borrow().closed,
            vec![Direction::Input, Direction::Output]
        );
    }

    #[test]
    fn each_cycle_builds_a_fresh_engine() {
        let host = MockHost::default();
        let factory = RecordingFactory::new();
        let mut vc = changer(host, factory.clone());

        vc.set_effect(EffectState::On).unwrap();
        vc.set_effect(EffectState::Off).unwrap();
        vc.set_effect(EffectState::On).unwrap();
        assert_eq!(factory.created(), 2);
    }

    // --- parameters ---

    #[test]
    fn cached_parameters_reach_the_next_engine() {
        let host = MockHost::default();
        let factory = RecordingFactory::new();
        let mut vc = changer(host, factory.clone());

        vc.set_pitch_shift(2.0);
        vc.set_target_voice(1).unwrap();
        vc.set_effect(EffectState::On).unwrap();

        let log = factory.log(0);
        let calls = log.lock().unwrap();
        assert!(calls.contains(&"set_pitch_shift(2)".to_string()));
        assert!(calls.contains(&"set_target_voice(1)".to_string()));
        // voice 1 base pitch 40.0 minus shift 2.0
        assert!(calls.contains(&"set_average_source_pitch(38)".to_string()));
    }

    #[test]
    fn live_updates_reach_the_running_engine() {
        let host = MockHost::default();
        let factory = RecordingFactory::new();
        let mut vc = changer(host.clone(), factory.clone());
        vc.set_effect(EffectState::On).unwrap();

        vc.set_pitch_shift(3.0);

        // Updates apply at the next processed block.
        let mut callback = host.state.borrow_mut().callback.take().unwrap();
        let mut out = [0.0f32; 4];
        let res = callback.on_both_streams_ready(&[0.0; 4], 4, &mut out, 4);
        assert_eq!(res, CallbackResult::Continue);

        let log = factory.log(0);
        let calls = log.lock().unwrap();
        assert!(calls.contains(&"set_pitch_shift(3)".to_string()));
    }

    #[test]
    fn invalid_voice_ids_are_rejected() {
        let host = MockHost::default();
        let mut vc = changer(host, RecordingFactory::new());

        // The descriptor populates ids 0 and 1, but every id up to the morph
        // slot is selectable; only ids past the ceiling are errors.
        vc.set_target_voice(0).unwrap();
        vc.set_target_voice(1).unwrap();
        vc.set_target_voice(2).unwrap();
        vc.set_target_voice(MAX_VOICES).unwrap();
        assert!(matches!(
            vc.set_target_voice(MAX_VOICES + 1),
            Err(LifecycleError::InvalidVoice(_))
        ));
        assert!(matches!(
            vc.set_morph_weight(MAX_VOICES, 1.0),
            Err(LifecycleError::InvalidVoice(_))
        ));
    }

    #[test]
    fn unpopulated_voice_id_uses_zero_base_pitch() {
        let host = MockHost::default();
        let mut vc = changer(host, RecordingFactory::new());
        vc.set_pitch_shift(2.0);

        // Id 7 is in range but has no descriptor entry, so its table slot
        // stays at 0 and the derived source pitch is just the negated shift.
        vc.set_target_voice(7).unwrap();
        assert_eq!(vc.params().target_voice, 7);
        assert_eq!(vc.params().average_source_pitch(), -2.0);
    }

    #[test]
    fn rejected_voice_leaves_cache_unchanged() {
        let host = MockHost::default();
        let mut vc = changer(host, RecordingFactory::new());
        vc.set_target_voice(1).unwrap();
        let before = vc.params().average_source_pitch();

        assert!(vc.set_target_voice(MAX_VOICES + 1).is_err());
        assert_eq!(vc.params().target_voice, 1);
        assert_eq!(vc.params().average_source_pitch(), before);
    }

    #[test]
    fn set_parameters_clamps_out_of_range_voice() {
        let host = MockHost::default();
        let mut vc = changer(host, RecordingFactory::new());

        let mut params = EngineParameters::default();
        params.target_voice = 17; // only voices 0, 1 and the morph id exist
        params.pitch_shift = 4.0;
        vc.set_parameters(params);

        assert_eq!(vc.params().target_voice, 0);
        assert_eq!(vc.params().pitch_shift, 4.0);
        // the descriptor's pitch table survives the bulk replace
        assert_eq!(vc.params().average_target_pitch_base[1], 40.0);
    }

    #[test]
    fn audio_runs_through_the_engine() {
        let host = MockHost::default();
        let mut factory = RecordingFactory::new();
        factory.scale = 2.0;
        let mut vc = changer(host.clone(), factory);
        vc.set_effect(EffectState::On).unwrap();

        let mut callback = host.state.borrow_mut().callback.take().unwrap();
        let mut out = [0.0f32; 4];
        callback.on_both_streams_ready(&[1.0, 2.0, 3.0, 4.0], 4, &mut out, 4);
        assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
    }

    // --- options ---

    #[test]
    fn audio_options_are_locked_while_on() {
        let host = MockHost::default();
        let mut vc = changer(host, RecordingFactory::new());
        vc.set_effect(EffectState::On).unwrap();

        let err = vc.configure_audio(ChangerOptions::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::EffectActive));

        vc.set_effect(EffectState::Off).unwrap();
        vc.configure_audio(ChangerOptions::default()).unwrap();
    }

    // --- stream errors ---

    #[test]
    fn disconnect_after_close_reopens_once() {
        let host = MockHost::default();
        let factory = RecordingFactory::new();
        let mut vc = changer(host.clone(), factory.clone());
        vc.set_effect(EffectState::On).unwrap();

        send_event(&host, ErrorPhase::AfterClose, StreamErrorKind::Disconnected);
        assert_eq!(vc.process_stream_events(), 1);

        assert_eq!(vc.state(), EffectState::On);
        let state = host.state.borrow();
        assert_eq!(state.opened.len(), 4);
        assert_eq!(state.starts, 2);
        drop(state);
        // The replacement cycle built a fresh engine.
        assert_eq!(factory.created(), 2);

        // A second disconnection gets exactly one more reopen.
        send_event(&host, ErrorPhase::AfterClose, StreamErrorKind::Disconnected);
        assert_eq!(vc.process_stream_events(), 1);
        assert_eq!(host.state.borrow().starts, 3);
    }

    #[test]
    fn pre_close_errors_do_not_reopen() {
        let host = MockHost::default();
        let mut vc = changer(host.clone(), RecordingFactory::new());
        vc.set_effect(EffectState::On).unwrap();

        send_event(
            &host,
            ErrorPhase::BeforeClose,
            StreamErrorKind::Backend("xrun".into()),
        );
        assert_eq!(vc.process_stream_events(), 1);
        assert_eq!(vc.state(), EffectState::On);
        assert_eq!(host.state.borrow().starts, 1);
    }

    #[test]
    fn failed_reopen_leaves_effect_off() {
        let host = MockHost::default();
        let mut vc = changer(host.clone(), RecordingFactory::new());
        vc.set_effect(EffectState::On).unwrap();

        host.state.borrow_mut().fail_output_open = true;
        send_event(&host, ErrorPhase::AfterClose, StreamErrorKind::Disconnected);
        vc.process_stream_events();
        assert_eq!(vc.state(), EffectState::Off);
    }

    #[test]
    fn disconnect_while_off_is_ignored() {
        let host = MockHost::default();
        let mut vc = changer(host.clone(), RecordingFactory::new());
        vc.set_effect(EffectState::On).unwrap();
        vc.set_effect(EffectState::Off).unwrap();

        send_event(&host, ErrorPhase::AfterClose, StreamErrorKind::Disconnected);
        assert_eq!(vc.process_stream_events(), 1);
        assert_eq!(vc.state(), EffectState::Off);
        assert_eq!(host.state.borrow().starts, 1);
    }
}
