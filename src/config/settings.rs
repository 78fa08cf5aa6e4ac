//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::audio::ProcessingMode;
use crate::lifecycle::{ChangerOptions, ReopenPolicy};
use crate::platform::{AudioBackend, PerformanceMode};

// ---------------------------------------------------------------------------
// AudioSettings
// ---------------------------------------------------------------------------

/// Settings for the duplex audio path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Engine block size in samples.
    pub frame_size: usize,
    /// Ring depth in frames used by asynchronous processing.
    pub buffer_count: usize,
    /// Run the engine on a worker thread instead of inside the callback.
    pub async_processing: bool,
    /// Input device name — `None` means the system default.
    pub input_device: Option<String>,
    /// Output device name — `None` means the system default.
    pub output_device: Option<String>,
    /// Platform audio API family.
    pub backend: AudioBackend,
    /// Latency/power trade-off requested from the backend.
    pub performance_mode: PerformanceMode,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            frame_size: 480,
            buffer_count: 2,
            async_processing: false,
            input_device: None,
            output_device: None,
            backend: AudioBackend::default(),
            performance_mode: PerformanceMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelSettings
// ---------------------------------------------------------------------------

/// Where to look for the active voice model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Directory searched (recursively) for the model descriptor.  `None`
    /// means the platform models directory from [`AppPaths`].
    pub dir: Option<std::path::PathBuf>,
}

impl ModelSettings {
    /// The directory to search, falling back to the platform default.
    pub fn resolve_dir(&self) -> std::path::PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| AppPaths::new().models_dir)
    }
}

// ---------------------------------------------------------------------------
// ReopenSettings
// ---------------------------------------------------------------------------

/// Recovery behaviour after a device disconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReopenSettings {
    /// Attempts per disconnection event.
    pub max_attempts: u32,
    /// Delay in milliseconds before each attempt.
    pub backoff_ms: u64,
}

impl Default for ReopenSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

impl ReopenSettings {
    pub fn policy(&self) -> ReopenPolicy {
        ReopenPolicy {
            max_attempts: self.max_attempts,
            backoff: std::time::Duration::from_millis(self.backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Duplex audio path settings.
    pub audio: AudioSettings,
    /// Voice-model discovery settings.
    pub model: ModelSettings,
    /// Disconnect recovery settings.
    pub reopen: ReopenSettings,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The lifecycle options these settings describe.
    pub fn changer_options(&self) -> ChangerOptions {
        ChangerOptions {
            mode: if self.audio.async_processing {
                ProcessingMode::Asynchronous
            } else {
                ProcessingMode::Synchronous
            },
            frame_size: self.audio.frame_size,
            buffer_count: self.audio.buffer_count,
            input_device: self.audio.input_device.clone(),
            output_device: self.audio.output_device.clone(),
            backend: self.audio.backend,
            performance: self.audio.performance_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Verify that a default `AppConfig` can be serialised to TOML and
    /// deserialised back without any data loss.
    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.audio.frame_size, loaded.audio.frame_size);
        assert_eq!(original.audio.buffer_count, loaded.audio.buffer_count);
        assert_eq!(
            original.audio.async_processing,
            loaded.audio.async_processing
        );
        assert_eq!(original.audio.backend, loaded.audio.backend);
        assert_eq!(original.model.dir, loaded.model.dir);
        assert_eq!(original.reopen.max_attempts, loaded.reopen.max_attempts);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        let default = AppConfig::default();

        assert_eq!(config.audio.frame_size, default.audio.frame_size);
        assert_eq!(config.reopen.max_attempts, default.reopen.max_attempts);
    }

    /// Verify default values match the engine's expectations.
    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.audio.frame_size, 480);
        assert_eq!(cfg.audio.buffer_count, 2);
        assert!(!cfg.audio.async_processing);
        assert!(cfg.audio.input_device.is_none());
        assert_eq!(cfg.audio.backend, AudioBackend::Native);
        assert_eq!(cfg.audio.performance_mode, PerformanceMode::LowLatency);
        assert_eq!(cfg.reopen.max_attempts, 1);
        assert_eq!(cfg.reopen.backoff_ms, 0);
    }

    /// Verify that modified non-default values survive a round trip.
    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.audio.async_processing = true;
        cfg.audio.frame_size = 960;
        cfg.audio.input_device = Some("USB Mic".into());
        cfg.audio.backend = AudioBackend::Compatibility;
        cfg.model.dir = Some(dir.path().join("models"));
        cfg.reopen.max_attempts = 3;
        cfg.reopen.backoff_ms = 250;

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert!(loaded.audio.async_processing);
        assert_eq!(loaded.audio.frame_size, 960);
        assert_eq!(loaded.audio.input_device, Some("USB Mic".into()));
        assert_eq!(loaded.audio.backend, AudioBackend::Compatibility);
        assert_eq!(loaded.model.dir, Some(dir.path().join("models")));
        assert_eq!(loaded.reopen.max_attempts, 3);
    }

    #[test]
    fn changer_options_follow_audio_settings() {
        let mut cfg = AppConfig::default();
        let opts = cfg.changer_options();
        assert_eq!(opts.mode, ProcessingMode::Synchronous);
        assert_eq!(opts.frame_size, 480);

        cfg.audio.async_processing = true;
        assert_eq!(cfg.changer_options().mode, ProcessingMode::Asynchronous);
    }

    #[test]
    fn reopen_settings_build_a_policy() {
        let settings = ReopenSettings {
            max_attempts: 2,
            backoff_ms: 100,
        };
        let policy = settings.policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff, std::time::Duration::from_millis(100));
    }
}
