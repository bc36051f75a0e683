//! Configuration management for soundbox.
//!
//! Loads config from YAML files in standard locations. Every section falls
//! back to its defaults, so a partial file only needs the keys it changes.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::speech::effects::SoundEffect;
use crate::speech::presets::{VoicePreset, DEFAULT_TEMPLATE_ID};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL customers reach the payment page on.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            public_url: "http://localhost:3000".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MerchantsConfig {
    /// Merchant names created at startup if missing.
    pub seed: Vec<String>,
    pub default_id: Option<String>,
    pub remember_selection: bool,
}

impl Default for MerchantsConfig {
    fn default() -> Self {
        Self {
            seed: vec![
                "Aling Nena's Sari-Sari Store".into(),
                "Kape ni Juan".into(),
                "Mang Tomas Lechon".into(),
            ],
            default_id: None,
            remember_selection: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub preferred_voice: String,
    pub language: String,
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
    pub catalog_attempts: u32,
    pub catalog_retry_ms: u64,
    pub handoff_ms: u64,
    pub activation_message: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_voice: "af_heart".into(),
            language: "en-US".into(),
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
            catalog_attempts: 10,
            catalog_retry_ms: 500,
            handoff_ms: 100,
            activation_message: "Soundbox activated. Listening for payments.".into(),
        }
    }
}

impl SpeechConfig {
    pub fn catalog_retry(&self) -> Duration {
        Duration::from_millis(self.catalog_retry_ms)
    }

    pub fn handoff(&self) -> Duration {
        Duration::from_millis(self.handoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub preset: VoicePreset,
    pub template: String,
    /// Text for the `custom` template. Empty means the default template text.
    pub custom_message: String,
    pub sound_effect: SoundEffect,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            preset: VoicePreset::default(),
            template: DEFAULT_TEMPLATE_ID.into(),
            custom_message: String::new(),
            sound_effect: SoundEffect::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub notifications: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Depth of the queue between subscriptions and the session.
    pub buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self { buffer: 64 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub merchants: MerchantsConfig,
    pub speech: SpeechConfig,
    pub voice: VoiceConfig,
    pub feedback: FeedbackConfig,
    pub realtime: RealtimeConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./soundbox.yaml
    /// 2. ~/.config/soundbox/config.yaml
    /// 3. /etc/soundbox/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("soundbox.yaml")),
                dirs::home_dir().map(|h| h.join(".config/soundbox/config.yaml")),
                Some(PathBuf::from("/etc/soundbox/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            "server:\n  port: 8080\nvoice:\n  preset: Excited\n  sound_effect: cash-register\n",
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.voice.preset, VoicePreset::Excited);
        assert_eq!(config.voice.sound_effect, SoundEffect::CashRegister);
        assert_eq!(config.voice.template, "en-default");
        assert_eq!(config.speech.preferred_voice, "af_heart");
        assert_eq!(config.merchants.seed.len(), 3);
    }

    #[test]
    fn speech_timings_convert_to_durations() {
        let config = Config::parse("speech:\n  catalog_retry_ms: 250\n  handoff_ms: 40\n").unwrap();
        assert_eq!(config.speech.catalog_retry(), Duration::from_millis(250));
        assert_eq!(config.speech.handoff(), Duration::from_millis(40));
        assert_eq!(config.speech.catalog_attempts, 10);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/soundbox.yaml")));
        assert_eq!(config.server.port, 3000);
        assert!(config.feedback.notifications);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(Config::parse("server:\n  port: not-a-number\n").is_err());
    }
}
