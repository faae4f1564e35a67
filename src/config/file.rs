//! TOML configuration file loading
//!
//! Supports `~/.config/voice-guide/config.toml` as a persistent config
//! source. Every field is optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GuideConfigFile {
    /// Gemini service settings
    #[serde(default)]
    pub gemini: GeminiFileConfig,

    /// Tour guide persona
    #[serde(default)]
    pub guide: GuideFileConfig,

    /// Audio output
    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Model for streamed text chat
    pub chat_model: Option<String>,
    /// Model for speech synthesis
    pub tts_model: Option<String>,
    /// Prebuilt voice name (e.g. "Kore")
    pub tts_voice: Option<String>,
    /// Model for the live voice session
    pub live_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GuideFileConfig {
    pub system_prompt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Start with audio output on
    pub enabled: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `GuideConfigFile::default()` if the file doesn't exist or can't
/// be parsed.
pub fn load_config_file() -> GuideConfigFile {
    config_file_path().map_or_else(GuideConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a config file from `path`, falling back to defaults
pub fn load_config_file_from(path: &Path) -> GuideConfigFile {
    if !path.exists() {
        return GuideConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                GuideConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
            GuideConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voice-guide/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-guide").join("config.toml"))
}
