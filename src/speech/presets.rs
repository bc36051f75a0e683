//! Voice presets, message templates and the announcement formatter.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

pub const RATE_RANGE: (f32, f32) = (0.5, 2.0);
pub const PITCH_RANGE: (f32, f32) = (0.5, 2.0);
pub const VOLUME_RANGE: (f32, f32) = (0.0, 1.0);

/// Rate, pitch and volume applied to every utterance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl VoiceSettings {
    /// Copy with every field clamped into its supported range.
    pub fn clamped(self) -> Self {
        Self {
            rate: clamp(self.rate, RATE_RANGE),
            pitch: clamp(self.pitch, PITCH_RANGE),
            volume: clamp(self.volume, VOLUME_RANGE),
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        VoicePreset::Professional.settings()
    }
}

fn clamp(value: f32, (lo, hi): (f32, f32)) -> f32 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoicePreset {
    #[default]
    Professional,
    Friendly,
    Excited,
    Calm,
    Robotic,
    /// The working copy of the settings is the source of truth.
    Custom,
}

impl VoicePreset {
    pub const ALL: [VoicePreset; 6] = [
        VoicePreset::Professional,
        VoicePreset::Friendly,
        VoicePreset::Excited,
        VoicePreset::Calm,
        VoicePreset::Robotic,
        VoicePreset::Custom,
    ];

    pub fn settings(self) -> VoiceSettings {
        let (rate, pitch, volume) = match self {
            Self::Professional => (0.9, 1.0, 1.0),
            Self::Friendly => (1.0, 1.1, 0.9),
            Self::Excited => (1.2, 1.3, 1.0),
            Self::Calm => (0.8, 0.9, 0.8),
            Self::Robotic => (1.0, 0.7, 1.0),
            Self::Custom => (0.9, 1.0, 1.0),
        };
        VoiceSettings { rate, pitch, volume }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Professional => "Clear and formal",
            Self::Friendly => "Warm and welcoming",
            Self::Excited => "Energetic and upbeat",
            Self::Calm => "Soothing and relaxed",
            Self::Robotic => "Mechanical and precise",
            Self::Custom => "Your own settings",
        }
    }

    /// Apply this preset to the working copy. `Custom` leaves it untouched.
    pub fn apply(self, settings: &mut VoiceSettings) {
        if self != Self::Custom {
            *settings = self.settings();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub template: &'static str,
    pub language: &'static str,
}

pub const CUSTOM_TEMPLATE_ID: &str = "custom";
pub const DEFAULT_TEMPLATE_ID: &str = "en-default";

pub const MESSAGE_TEMPLATES: &[MessageTemplate] = &[
    MessageTemplate {
        id: "en-default",
        name: "Default (English)",
        template: "Payment received: {amount} pesos from {customer}",
        language: "en-US",
    },
    MessageTemplate {
        id: "en-formal",
        name: "Formal (English)",
        template: "Transaction completed. Amount: {amount} pesos. Customer: {customer}",
        language: "en-US",
    },
    MessageTemplate {
        id: "en-friendly",
        name: "Friendly (English)",
        template: "Great! {customer} just paid {amount} pesos. Thank you!",
        language: "en-US",
    },
    MessageTemplate {
        id: "en-short",
        name: "Short (English)",
        template: "{amount} pesos from {customer}",
        language: "en-US",
    },
    MessageTemplate {
        id: "tl-default",
        name: "Default (Tagalog)",
        template: "May bayad na: {amount} pesos mula kay {customer}",
        language: "tl-PH",
    },
    MessageTemplate {
        id: "tl-friendly",
        name: "Friendly (Tagalog)",
        template: "Salamat! Si {customer} ay nagbayad ng {amount} pesos",
        language: "tl-PH",
    },
    MessageTemplate {
        id: "es-default",
        name: "Default (Spanish)",
        template: "Pago recibido: {amount} pesos de {customer}",
        language: "es-ES",
    },
    MessageTemplate {
        id: CUSTOM_TEMPLATE_ID,
        name: "Custom Message",
        template: "Payment received: {amount} pesos from {customer}",
        language: "en-US",
    },
];

pub fn find_template(id: &str) -> Option<&'static MessageTemplate> {
    MESSAGE_TEMPLATES.iter().find(|t| t.id == id)
}

pub fn default_template() -> &'static MessageTemplate {
    &MESSAGE_TEMPLATES[0]
}

/// Render an announcement.
///
/// Only the first `{amount}` and the first `{customer}` are substituted; any
/// repeated placeholder is left as written.
pub fn format_message(template: &str, amount: Amount, customer: &str) -> String {
    template
        .replacen("{amount}", &amount.to_string(), 1)
        .replacen("{customer}", customer, 1)
}
