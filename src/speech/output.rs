//! Shared rodio output stream used by speech playback and sound effects.

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio output available: {0}")]
    Unavailable(String),
}

/// Default audio device, opened once and kept alive for the process lifetime.
pub struct AudioOutput {
    // In rodio 0.21, OutputStream is the handle; sinks connect to its mixer.
    stream: OutputStream,
}

impl AudioOutput {
    pub fn open_default() -> Result<Self, AudioError> {
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| AudioError::Unavailable(e.to_string()))?;
        info!("Audio output opened");
        Ok(Self { stream })
    }

    /// A new sink on the shared mixer.
    pub fn sink(&self) -> Sink {
        Sink::connect_new(self.stream.mixer())
    }

    /// Queue mono samples and let them play to the end without a handle.
    pub fn play_detached(&self, samples: Vec<f32>, sample_rate: u32, volume: f32) {
        let sink = self.sink();
        sink.set_volume(volume);
        sink.append(SamplesBuffer::new(1, sample_rate, samples));
        sink.detach();
    }
}
