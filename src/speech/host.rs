//! The text-to-speech facility the soundbox speaks through.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech synthesis is not available")]
    Unsupported,
    #[error("speech model is not loaded")]
    NotLoaded,
    #[error("no async runtime to play speech on")]
    NoRuntime,
    #[error("unknown voice: {0}")]
    UnknownVoice(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceDescriptor {
    pub name: String,
    pub lang: String,
}

impl VoiceDescriptor {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
        }
    }
}

/// One unit of speech handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub text: String,
    pub voice: String,
    pub lang: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

pub trait SpeechHost: Send + Sync {
    /// Whether the host can synthesize speech at all.
    fn is_supported(&self) -> bool;

    /// Voices the host reports right now. May be empty while it is still loading.
    fn voices(&self) -> Vec<VoiceDescriptor>;

    /// Bumped every time the voice list changes.
    fn subscribe_changes(&self) -> watch::Receiver<u64>;

    /// Start speaking without waiting for playback to finish.
    fn speak(&self, utterance: Utterance) -> Result<(), SpeechError>;

    /// Stop the current utterance, if any.
    fn cancel(&self);
}

/// Host used when speech is disabled.
pub struct UnavailableHost {
    changes: watch::Sender<u64>,
}

impl UnavailableHost {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self { changes }
    }
}

impl Default for UnavailableHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechHost for UnavailableHost {
    fn is_supported(&self) -> bool {
        false
    }

    fn voices(&self) -> Vec<VoiceDescriptor> {
        Vec::new()
    }

    fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn speak(&self, _utterance: Utterance) -> Result<(), SpeechError> {
        Err(SpeechError::Unsupported)
    }

    fn cancel(&self) {}
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records everything spoken and cancelled.
    pub struct FakeHost {
        supported: bool,
        voices: Mutex<Vec<VoiceDescriptor>>,
        changes: watch::Sender<u64>,
        pub spoken: Mutex<Vec<Utterance>>,
        pub cancels: Mutex<usize>,
    }

    impl FakeHost {
        pub fn new(voices: Vec<VoiceDescriptor>) -> Self {
            let (changes, _) = watch::channel(0);
            Self {
                supported: true,
                voices: Mutex::new(voices),
                changes,
                spoken: Mutex::new(Vec::new()),
                cancels: Mutex::new(0),
            }
        }

        pub fn english() -> Self {
            Self::new(vec![
                VoiceDescriptor::new("af_heart", "en-US"),
                VoiceDescriptor::new("bf_emma", "en-GB"),
            ])
        }

        pub fn unsupported() -> Self {
            Self {
                supported: false,
                ..Self::new(Vec::new())
            }
        }

        pub fn set_voices(&self, voices: Vec<VoiceDescriptor>) {
            *self.voices.lock().unwrap() = voices;
            self.changes.send_modify(|v| *v += 1);
        }

        pub fn spoken_texts(&self) -> Vec<String> {
            self.spoken
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.text.clone())
                .collect()
        }
    }

    impl SpeechHost for FakeHost {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn voices(&self) -> Vec<VoiceDescriptor> {
            self.voices.lock().unwrap().clone()
        }

        fn subscribe_changes(&self) -> watch::Receiver<u64> {
            self.changes.subscribe()
        }

        fn speak(&self, utterance: Utterance) -> Result<(), SpeechError> {
            self.spoken.lock().unwrap().push(utterance);
            Ok(())
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }
}
