//! Voice catalog: which voices the speech host offers and which one to use by default.
//!
//! Hosts populate their voice list asynchronously, so the catalog is loaded by a
//! single task that walks an explicit state machine:
//!
//! UNLOADED → POLLING(attempt) → READY | DEGRADED
//!
//! Polling stops as soon as the host reports at least one voice (READY) or the
//! retry budget runs out (DEGRADED). Either way the catalog counts as ready and
//! the task keeps following host change notifications, re-running default
//! selection whenever the voice list changes.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::host::{SpeechHost, VoiceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CatalogState {
    Unloaded,
    Polling { attempt: u32 },
    Ready,
    /// Retry budget exhausted with no voices; speech is skipped.
    Degraded,
}

impl CatalogState {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

pub struct VoiceCatalog {
    preferred_voice: String,
    language: String,
    state: watch::Sender<CatalogState>,
    voices: RwLock<Vec<VoiceDescriptor>>,
    default_voice: RwLock<Option<String>>,
}

impl VoiceCatalog {
    pub fn new(preferred_voice: impl Into<String>, language: impl Into<String>) -> Self {
        let (state, _) = watch::channel(CatalogState::Unloaded);
        Self {
            preferred_voice: preferred_voice.into(),
            language: language.into(),
            state,
            voices: RwLock::new(Vec::new()),
            default_voice: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CatalogState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Resolves once the catalog is READY or DEGRADED.
    pub async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_ready()).await;
    }

    pub fn preferred_voice(&self) -> &str {
        &self.preferred_voice
    }

    pub fn voices(&self) -> Vec<VoiceDescriptor> {
        self.voices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_voice(&self) -> Option<String> {
        self.default_voice
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store a fresh voice list and re-run default selection.
    ///
    /// A non-empty list makes the catalog READY. Returns whether it was non-empty.
    pub fn ingest(&self, voices: Vec<VoiceDescriptor>) -> bool {
        let default = select_default(&voices, &self.preferred_voice, &self.language)
            .map(|v| v.name.clone());
        let found = !voices.is_empty();

        if let Some(name) = &default {
            debug!("Default voice: {name} ({} voices)", voices.len());
        }
        *self.voices.write().unwrap_or_else(PoisonError::into_inner) = voices;
        *self
            .default_voice
            .write()
            .unwrap_or_else(PoisonError::into_inner) = default;

        if found {
            self.set_state(CatalogState::Ready);
        }
        found
    }

    pub(crate) fn set_state(&self, next: CatalogState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Voice catalog: {previous:?} → {next:?}");
        }
    }

    /// Spawn the loader task. It owns the only timer and the only change
    /// subscription on the host.
    pub fn spawn_loader(self: &Arc<Self>, host: Arc<dyn SpeechHost>, retry: RetryPolicy) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move { catalog.run_loader(host, retry).await })
    }

    async fn run_loader(&self, host: Arc<dyn SpeechHost>, retry: RetryPolicy) {
        let mut changes = host.subscribe_changes();
        let attempts = retry.attempts.max(1);

        for attempt in 1..=attempts {
            self.set_state(CatalogState::Polling { attempt });
            if self.ingest(host.voices()) {
                info!("Voice catalog ready after {attempt} attempt(s)");
                break;
            }
            if attempt == attempts {
                warn!("No voices after {attempts} attempts, continuing without speech");
                self.set_state(CatalogState::Degraded);
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(retry.delay) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        // Host went away: nothing will ever change again.
                        tokio::time::sleep(retry.delay).await;
                    }
                }
            }
        }

        while changes.changed().await.is_ok() {
            let voices = host.voices();
            info!("Voice list changed ({} voices)", voices.len());
            self.ingest(voices);
        }
        debug!("Voice catalog loader finished");
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().replace('_', "-").to_ascii_lowercase()
}

fn primary_subtag(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// Pick the default voice for `language`.
///
/// Priority: the preferred voice by exact name, then an exact language match,
/// then a voice sharing the primary language subtag (`en` for `en-US`), then
/// whatever comes first.
pub fn select_default<'a>(
    voices: &'a [VoiceDescriptor],
    preferred: &str,
    language: &str,
) -> Option<&'a VoiceDescriptor> {
    let target = normalize(language);
    let primary = primary_subtag(&target);

    voices
        .iter()
        .find(|v| v.name == preferred)
        .or_else(|| voices.iter().find(|v| normalize(&v.lang) == target))
        .or_else(|| {
            voices
                .iter()
                .find(|v| primary_subtag(&normalize(&v.lang)) == primary)
        })
        .or_else(|| voices.first())
}
