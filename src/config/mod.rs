//! Configuration management for the voice guide
//!
//! Values resolve in order: environment variable, config file, default.

pub mod file;

use secrecy::SecretString;

use crate::gemini::DEFAULT_BASE_URL;
use file::GuideConfigFile;

/// Default model for streamed text chat
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

/// Default model for speech synthesis
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";

/// Default prebuilt synthesis voice
pub const DEFAULT_TTS_VOICE: &str = "Kore";

/// Default model for the live voice session
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default persona prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly virtual tour guide. Answer questions \
about the places the visitor is exploring in short spoken sentences, in the visitor's language.";

/// Voice guide configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gemini API key (`GEMINI_API_KEY`)
    pub gemini_api_key: Option<SecretString>,

    /// Gemini REST endpoint (`GUIDE_GEMINI_BASE_URL`)
    pub gemini_base_url: String,

    /// Text chat model (`GUIDE_CHAT_MODEL`)
    pub chat_model: String,

    /// Speech synthesis model (`GUIDE_TTS_MODEL`)
    pub tts_model: String,

    /// Speech synthesis voice (`GUIDE_TTS_VOICE`)
    pub tts_voice: String,

    /// Live session model (`GUIDE_LIVE_MODEL`)
    pub live_model: String,

    /// Persona prompt shared by chat and live sessions (`GUIDE_SYSTEM_PROMPT`)
    pub system_prompt: String,

    /// Whether audio output starts enabled (`GUIDE_PLAYBACK_ENABLED`)
    pub playback_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(GuideConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    #[must_use]
    pub fn load() -> Self {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Merge `env` lookups over a parsed config file
    #[must_use]
    pub fn resolve(file: GuideConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let GuideConfigFile {
            gemini,
            guide,
            playback,
        } = file;
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let playback_enabled = env("GUIDE_PLAYBACK_ENABLED")
            .and_then(|v| parse_bool(&v))
            .or(playback.enabled)
            .unwrap_or(true);

        Self {
            gemini_api_key: env("GEMINI_API_KEY").or(gemini.api_key).map(SecretString::from),
            gemini_base_url: env("GUIDE_GEMINI_BASE_URL")
                .or(gemini.base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            chat_model: env("GUIDE_CHAT_MODEL")
                .or(gemini.chat_model)
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            tts_model: env("GUIDE_TTS_MODEL")
                .or(gemini.tts_model)
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
            tts_voice: env("GUIDE_TTS_VOICE")
                .or(gemini.tts_voice)
                .unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
            live_model: env("GUIDE_LIVE_MODEL")
                .or(gemini.live_model)
                .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string()),
            system_prompt: env("GUIDE_SYSTEM_PROMPT")
                .or(guide.system_prompt)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            playback_enabled,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::file::{GeminiFileConfig, PlaybackFileConfig};
    use super::*;

    fn file_with_voice(voice: &str) -> GuideConfigFile {
        GuideConfigFile {
            gemini: GeminiFileConfig {
                tts_voice: Some(voice.to_string()),
                api_key: Some("file-key".to_string()),
                ..GeminiFileConfig::default()
            },
            playback: PlaybackFileConfig {
                enabled: Some(false),
            },
            ..GuideConfigFile::default()
        }
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::default();
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.tts_voice, DEFAULT_TTS_VOICE);
        assert_eq!(config.gemini_base_url, DEFAULT_BASE_URL);
        assert!(config.playback_enabled);
    }

    #[test]
    fn file_overrides_defaults() {
        let config = Config::resolve(file_with_voice("Puck"), |_| None);
        assert_eq!(config.tts_voice, "Puck");
        assert!(!config.playback_enabled);
        assert_eq!(config.gemini_api_key.unwrap().expose_secret(), "file-key");
    }

    #[test]
    fn env_overrides_file() {
        let config = Config::resolve(file_with_voice("Puck"), |key| match key {
            "GUIDE_TTS_VOICE" => Some("Charon".to_string()),
            "GEMINI_API_KEY" => Some("env-key".to_string()),
            "GUIDE_PLAYBACK_ENABLED" => Some("yes".to_string()),
            _ => None,
        });
        assert_eq!(config.tts_voice, "Charon");
        assert!(config.playback_enabled);
        assert_eq!(config.gemini_api_key.unwrap().expose_secret(), "env-key");
    }

    #[test]
    fn blank_env_is_ignored() {
        let config = Config::resolve(file_with_voice("Puck"), |key| {
            (key == "GUIDE_TTS_VOICE").then(|| "  ".to_string())
        });
        assert_eq!(config.tts_voice, "Puck");
    }
}
