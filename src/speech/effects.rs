//! Short synthesized cues played ahead of each announcement.
//!
//! Every effect is a fixed table of tones. A tone starts at its gain and decays
//! exponentially to [`ENVELOPE_FLOOR`] over its duration. Tones are mixed into a
//! single mono buffer and handed to the audio output without waiting.

use std::f32::consts::TAU;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::output::AudioOutput;

pub const EFFECT_SAMPLE_RATE: u32 = 44_100;
pub const ENVELOPE_FLOOR: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
}

impl Waveform {
    /// Sample at `phase` in [0, 1).
    fn sample(self, phase: f32) -> f32 {
        match self {
            Self::Sine => (TAU * phase).sin(),
            Self::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency: f32,
    /// Seconds from the start of the effect.
    pub offset: f32,
    /// Seconds.
    pub duration: f32,
    pub waveform: Waveform,
    pub gain: f32,
}

const fn tone(frequency: f32, offset: f32, duration: f32, waveform: Waveform, gain: f32) -> Tone {
    Tone {
        frequency,
        offset,
        duration,
        waveform,
        gain,
    }
}

const CHIME: &[Tone] = &[
    tone(800.0, 0.0, 0.15, Waveform::Sine, 0.3),
    tone(1000.0, 0.15, 0.15, Waveform::Sine, 0.3),
];

const CASH_REGISTER: &[Tone] = &[
    tone(1200.0, 0.0, 0.1, Waveform::Triangle, 0.2),
    tone(1400.0, 0.05, 0.1, Waveform::Triangle, 0.2),
    tone(1600.0, 0.1, 0.2, Waveform::Triangle, 0.2),
];

const BELL: &[Tone] = &[tone(1000.0, 0.0, 0.5, Waveform::Sine, 0.3)];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoundEffect {
    #[default]
    Chime,
    Bell,
    CashRegister,
    None,
}

impl SoundEffect {
    pub fn tones(self) -> &'static [Tone] {
        match self {
            Self::Chime => CHIME,
            Self::Bell => BELL,
            Self::CashRegister => CASH_REGISTER,
            Self::None => &[],
        }
    }
}

impl fmt::Display for SoundEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chime => "chime",
            Self::Bell => "bell",
            Self::CashRegister => "cash-register",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Mix an effect's tones into one mono buffer at `sample_rate`.
pub fn render(effect: SoundEffect, sample_rate: u32) -> Vec<f32> {
    let tones = effect.tones();
    let rate = sample_rate as f32;
    let length = tones
        .iter()
        .map(|t| t.offset + t.duration)
        .fold(0.0f32, f32::max);
    let mut buffer = vec![0.0f32; (length * rate).round() as usize];

    for t in tones {
        let start = (t.offset * rate).round() as usize;
        let count = (t.duration * rate).round() as usize;
        let decay = ENVELOPE_FLOOR / t.gain;
        for i in 0..count {
            let Some(slot) = buffer.get_mut(start + i) else {
                break;
            };
            let elapsed = i as f32 / rate;
            let phase = (t.frequency * elapsed).fract();
            let envelope = t.gain * decay.powf(i as f32 / count as f32);
            *slot += t.waveform.sample(phase) * envelope;
        }
    }

    for sample in &mut buffer {
        *sample = sample.clamp(-1.0, 1.0);
    }
    buffer
}

/// Fire-and-forget player. Without an audio output every effect is skipped.
pub struct SoundEffectPlayer {
    output: Option<Arc<AudioOutput>>,
    played: AtomicU64,
}

impl SoundEffectPlayer {
    pub fn new(output: Option<Arc<AudioOutput>>) -> Self {
        Self {
            output,
            played: AtomicU64::new(0),
        }
    }

    pub fn play(&self, effect: SoundEffect) {
        if effect == SoundEffect::None {
            return;
        }
        self.played.fetch_add(1, Ordering::Relaxed);

        let Some(output) = &self.output else {
            warn!("No audio output, skipping {effect} sound");
            return;
        };
        let samples = render(effect, EFFECT_SAMPLE_RATE);
        debug!("Playing {effect} sound ({} samples)", samples.len());
        output.play_detached(samples, EFFECT_SAMPLE_RATE, 1.0);
    }

    /// Number of effects requested so far, including skipped ones.
    #[cfg(test)]
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }
}
