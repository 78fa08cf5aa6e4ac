//! Application entry point — interactive voice-changer console.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Locate and parse the model descriptor under the models directory.
//! 4. Build the [`VoiceChanger`] over the cpal host with the passthrough
//!    engine factory.
//! 5. Run the stdin command loop until `quit`, pumping stream-error events
//!    between commands.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use voice_changer::{
    config::AppConfig,
    engine::PassthroughFactory,
    lifecycle::EffectState,
    model::ModelDescriptor,
    platform::CpalHost,
    VoiceChanger,
};

const HELP: &str = "\
commands:
  on / off          switch the effect
  voice <id>        select the target voice
  voices            list the model's voices
  pitch <semis>     pitch shift in semitones
  formant <semis>   formant shift in semitones
  gain-in <db>      input gain
  gain-out <db>     output gain
  stats             processing counters
  help              this text
  quit              exit";

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice changer starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Model
    let models_dir = config.model.resolve_dir();
    let descriptor_path = ModelDescriptor::locate(&models_dir)
        .with_context(|| format!("no model installed under {}", models_dir.display()))?;
    let descriptor = ModelDescriptor::load(&descriptor_path)?;
    log::info!(
        "model '{}' (version {}, {} voices)",
        descriptor.model.name,
        descriptor.model.version,
        descriptor.voices.len()
    );

    // 4. Lifecycle over the cpal host.  The passthrough factory exercises the
    //    whole duplex path without a model runtime.
    let mut changer = VoiceChanger::new(
        CpalHost::new(),
        Box::new(PassthroughFactory),
        descriptor,
        descriptor_path,
        config.changer_options(),
    );
    changer.set_reopen_policy(config.reopen.policy());

    // 5. Command loop
    println!("{HELP}");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        changer.process_stream_events();

        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(word) => word,
            None => continue,
        };
        let result = match (command, parts.next()) {
            ("on", _) => changer.set_effect(EffectState::On),
            ("off", _) => changer.set_effect(EffectState::Off),
            ("voice", Some(arg)) => match arg.parse() {
                Ok(id) => changer.set_target_voice(id),
                Err(_) => {
                    println!("voice id must be a number");
                    continue;
                }
            },
            ("voices", _) => {
                for (id, voice) in changer.descriptor().voices.iter().enumerate() {
                    println!("  {id}: {} (avg pitch {})", voice.name, voice.average_pitch);
                }
                continue;
            }
            ("pitch", Some(arg)) => match arg.parse() {
                Ok(semitones) => {
                    changer.set_pitch_shift(semitones);
                    Ok(())
                }
                Err(_) => {
                    println!("pitch takes a number of semitones");
                    continue;
                }
            },
            ("formant", Some(arg)) => match arg.parse() {
                Ok(semitones) => {
                    changer.set_formant_shift(semitones);
                    Ok(())
                }
                Err(_) => {
                    println!("formant takes a number of semitones");
                    continue;
                }
            },
            ("gain-in", Some(arg)) => match arg.parse() {
                Ok(db) => {
                    changer.set_input_gain(db);
                    Ok(())
                }
                Err(_) => {
                    println!("gain-in takes a dB value");
                    continue;
                }
            },
            ("gain-out", Some(arg)) => match arg.parse() {
                Ok(db) => {
                    changer.set_output_gain(db);
                    Ok(())
                }
                Err(_) => {
                    println!("gain-out takes a dB value");
                    continue;
                }
            },
            ("stats", _) => {
                match changer.stats() {
                    Some(stats) => println!(
                        "process failures: {}, overlap skips: {}, dropped jobs: {}",
                        stats.process_failures(),
                        stats.overlap_skips(),
                        stats.dropped_jobs()
                    ),
                    None => println!("effect is off"),
                }
                continue;
            }
            ("help", _) => {
                println!("{HELP}");
                continue;
            }
            ("quit", _) | ("exit", _) => break,
            _ => {
                println!("unknown command; try 'help'");
                continue;
            }
        };

        match result {
            Ok(()) => println!("effect {}", changer.state()),
            Err(e) => log::error!("{e}"),
        }
    }

    changer.set_effect(EffectState::Off)?;
    Ok(())
}
