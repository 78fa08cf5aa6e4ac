//! Model descriptor loading.
//!
//! A voice model ships as a directory containing one TOML descriptor plus the
//! weight files it names.  The descriptor carries the model's display name,
//! the engine version tag it requires, and one `[[voices]]` entry per output
//! timbre:
//!
//! ```toml
//! [model]
//! name = "demo"
//! version = 2
//!
//! [[voices]]
//! name = "alto"
//! average_pitch = 52.0
//! ```
//!
//! [`ModelDescriptor::locate`] finds the first `.toml` file under a directory
//! (recursing into subdirectories), which is how the app discovers the active
//! model in its models folder.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no model descriptor (.toml) found under {0}")]
    NotFound(PathBuf),

    #[error("failed to read model descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// Descriptor types
// ---------------------------------------------------------------------------

/// The `[model]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Engine version tag; maps to [`ModelVersion`](crate::engine::ModelVersion).
    pub version: u32,
}

/// One `[[voices]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Average pitch of this voice in semitone units.
    pub average_pitch: f64,
    /// Optional portrait image path, relative to the descriptor.
    #[serde(default)]
    pub portrait: Option<String>,
}

/// A parsed model descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescriptor {
    pub model: ModelInfo,
    #[serde(default)]
    pub voices: Vec<VoiceDescriptor>,
}

impl ModelDescriptor {
    /// Load and parse the descriptor at `path`.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptor: Self = toml::from_str(&text).map_err(|source| ModelError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            "loaded model '{}' (version {}, {} voices) from {}",
            descriptor.model.name,
            descriptor.model.version,
            descriptor.voices.len(),
            path.display()
        );
        Ok(descriptor)
    }

    /// Find the first `.toml` file under `dir`, searching subdirectories.
    ///
    /// Entries are visited in directory order, files before recursing.
    pub fn locate(dir: &Path) -> Result<PathBuf, ModelError> {
        fn search(dir: &Path) -> std::io::Result<Option<PathBuf>> {
            let mut subdirs = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    subdirs.push(path);
                } else if path.extension().is_some_and(|ext| ext == "toml") {
                    return Ok(Some(path));
                }
            }
            for sub in subdirs {
                if let Some(found) = search(&sub)? {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        }

        match search(dir) {
            Ok(Some(path)) => Ok(path),
            Ok(None) => Err(ModelError::NotFound(dir.to_path_buf())),
            Err(source) => Err(ModelError::Io {
                path: dir.to_path_buf(),
                source,
            }),
        }
    }

    /// The display name of voice `id`, when the descriptor has one.
    pub fn voice_name(&self, id: usize) -> Option<&str> {
        self.voices.get(id).map(|v| v.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
