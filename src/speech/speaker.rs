//! Turns payments into spoken announcements.
//!
//! Only the most recent announcement may be audible or pending: every new one
//! cancels whatever the host is saying and supersedes any announcement still
//! waiting out its handoff delay.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::catalog::{select_default, VoiceCatalog};
use super::effects::SoundEffectPlayer;
use super::host::{SpeechHost, Utterance};
use crate::amount::Amount;
use crate::session::SessionContext;

/// What happened to an announcement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// Queued behind the handoff delay.
    Scheduled,
    /// Submitted to the host immediately.
    Spoken,
    CatalogNotReady,
    NoVoice,
    Failed,
}

pub struct NotificationSpeaker {
    host: Arc<dyn SpeechHost>,
    catalog: Arc<VoiceCatalog>,
    effects: SoundEffectPlayer,
    /// Bumped on every interrupt; a pending announcement only plays if it still
    /// holds the latest value.
    generation: Arc<Mutex<u64>>,
    handoff: Duration,
}

impl NotificationSpeaker {
    pub fn new(
        host: Arc<dyn SpeechHost>,
        catalog: Arc<VoiceCatalog>,
        effects: SoundEffectPlayer,
        handoff: Duration,
    ) -> Self {
        Self {
            host,
            catalog,
            effects,
            generation: Arc::new(Mutex::new(0)),
            handoff,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.host.is_supported()
    }

    pub fn catalog(&self) -> &VoiceCatalog {
        &self.catalog
    }

    pub fn effects(&self) -> &SoundEffectPlayer {
        &self.effects
    }

    /// Announce a payment with the session's current voice settings.
    pub fn announce(&self, ctx: &SessionContext, amount: Amount, customer: &str) -> Announcement {
        self.effects.play(ctx.sound_effect);

        if !self.catalog.is_ready() {
            info!("Voice catalog not ready, skipping announcement");
            return Announcement::CatalogNotReady;
        }

        let generation = self.interrupt();
        let Some(utterance) = self.build(ctx, ctx.message_for(amount, customer)) else {
            return Announcement::NoVoice;
        };
        self.submit_after_handoff(generation, utterance);
        Announcement::Scheduled
    }

    /// Speak `text` right away. Used for the activation prompt, which has to
    /// start inside the user's own request.
    pub fn prime(&self, ctx: &SessionContext, text: &str) -> Announcement {
        self.effects.play(ctx.sound_effect);

        let mut current = self.lock_generation();
        *current += 1;
        self.host.cancel();

        let Some(utterance) = self.build(ctx, text.to_string()) else {
            return Announcement::NoVoice;
        };
        match self.host.speak(utterance) {
            Ok(()) => Announcement::Spoken,
            Err(e) => {
                warn!("Failed to speak activation prompt: {e}");
                Announcement::Failed
            }
        }
    }

    /// Cancel the current utterance and drop any pending one.
    pub fn silence(&self) {
        self.interrupt();
    }

    /// The voice to speak with: the user's choice if the host still has it,
    /// otherwise the default for `language`.
    pub fn resolve_voice(&self, selected: Option<&str>, language: &str) -> Option<String> {
        let fresh = self.host.voices();
        if let Some(name) = selected {
            if fresh.iter().any(|v| v.name == name) {
                return Some(name.to_string());
            }
            debug!("Selected voice {name} is no longer available");
        }
        select_default(&fresh, self.catalog.preferred_voice(), language).map(|v| v.name.clone())
    }

    fn build(&self, ctx: &SessionContext, text: String) -> Option<Utterance> {
        let template = ctx.template();
        let Some(voice) = self.resolve_voice(ctx.selected_voice.as_deref(), template.language) else {
            warn!("No voice available, announcement not spoken");
            return None;
        };
        Some(Utterance {
            text,
            voice,
            lang: template.language.to_string(),
            rate: ctx.voice.rate,
            pitch: ctx.voice.pitch,
            volume: ctx.voice.volume,
        })
    }

    fn lock_generation(&self) -> std::sync::MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interrupt(&self) -> u64 {
        let mut current = self.lock_generation();
        *current += 1;
        self.host.cancel();
        *current
    }

    fn submit_after_handoff(&self, generation: u64, utterance: Utterance) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to schedule announcement on");
            return;
        };
        let host = Arc::clone(&self.host);
        let current = Arc::clone(&self.generation);
        let handoff = self.handoff;

        runtime.spawn(async move {
            tokio::time::sleep(handoff).await;
            // Held across speak() so an interrupt cannot slip in between the
            // check and the submission.
            let latest = current.lock().unwrap_or_else(PoisonError::into_inner);
            if *latest != generation {
                debug!("Announcement superseded before playback");
                return;
            }
            debug!("Speaking \"{}\" with {}", utterance.text, utterance.voice);
            if let Err(e) = host.speak(utterance) {
                warn!("Failed to speak announcement: {e}");
            }
        });
    }
}
