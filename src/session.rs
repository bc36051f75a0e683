//! Listening session state machine.
//!
//! IDLE → LISTENING → IDLE
//!
//! The session owns at most one live subscription, the newest-first list of
//! payments received while listening, and the [`SessionContext`] every
//! announcement is rendered with.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::config::VoiceConfig;
use crate::notifier::Notifier;
use crate::realtime::{Realtime, RealtimeError, SessionEvent, SubscriptionHandle};
use crate::speech::effects::SoundEffect;
use crate::speech::presets::{
    default_template, find_template, format_message, MessageTemplate, VoicePreset, VoiceSettings,
    CUSTOM_TEMPLATE_ID,
};
use crate::speech::speaker::{Announcement, NotificationSpeaker};
use crate::stats::{self, MerchantStats};
use crate::store::Transaction;

const TEST_AMOUNT: u64 = 100;
const TEST_CUSTOMER: &str = "Test Customer";

/// Everything an announcement depends on, passed explicitly to the speaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub merchant_id: String,
    pub voice: VoiceSettings,
    pub preset: VoicePreset,
    pub template_id: String,
    pub custom_message: String,
    pub sound_effect: SoundEffect,
    /// Voice the user picked explicitly. `None` means the catalog default.
    pub selected_voice: Option<String>,
}

impl SessionContext {
    pub fn new(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            voice: VoiceSettings::default(),
            preset: VoicePreset::default(),
            template_id: default_template().id.to_string(),
            custom_message: default_template().template.to_string(),
            sound_effect: SoundEffect::default(),
            selected_voice: None,
        }
    }

    pub fn from_config(merchant_id: impl Into<String>, config: &VoiceConfig) -> Self {
        let mut ctx = Self::new(merchant_id);
        ctx.preset = config.preset;
        config.preset.apply(&mut ctx.voice);
        ctx.sound_effect = config.sound_effect;
        if let Some(template) = find_template(&config.template) {
            ctx.template_id = template.id.to_string();
        } else {
            warn!("Unknown message template {}, using {}", config.template, ctx.template_id);
        }
        if !config.custom_message.is_empty() {
            ctx.custom_message = config.custom_message.clone();
        }
        ctx
    }

    /// The active template. Falls back to the default if the id is unknown.
    pub fn template(&self) -> &'static MessageTemplate {
        find_template(&self.template_id).unwrap_or_else(default_template)
    }

    pub fn message_for(&self, amount: Amount, customer: &str) -> String {
        let template = self.template();
        if template.id == CUSTOM_TEMPLATE_ID {
            format_message(&self.custom_message, amount, customer)
        } else {
            format_message(template.template, amount, customer)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListeningState {
    Idle,
    Listening,
}

impl fmt::Display for ListeningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Listening => write!(f, "LISTENING"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Text-to-speech is not supported on this device")]
    CapabilityAbsent,
    #[error("Voices are still loading, please try again in a moment")]
    CatalogNotReady,
    #[error("No merchant selected")]
    NoMerchant,
    #[error("Failed to connect to realtime updates: {0}")]
    Subscription(#[from] RealtimeError),
    #[error("Unknown message template: {0}")]
    UnknownTemplate(String),
    #[error("Unknown voice: {0}")]
    UnknownVoice(String),
}

/// Partial settings change. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub preset: Option<VoicePreset>,
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
    pub template_id: Option<String>,
    pub custom_message: Option<String>,
    pub sound_effect: Option<SoundEffect>,
    /// Empty string clears the explicit choice.
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: ListeningState,
    pub context: SessionContext,
    pub payment_link: String,
    pub stats: MerchantStats,
    pub transactions: Vec<Transaction>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub public_url: String,
    pub activation_message: String,
    /// Event queue depth.
    pub buffer: usize,
}

pub struct ListeningSession<R: Realtime> {
    ctx: SessionContext,
    state: ListeningState,
    subscription: Option<SubscriptionHandle>,
    transactions: Vec<Transaction>,
    last_error: Option<String>,
    realtime: R,
    speaker: Arc<NotificationSpeaker>,
    notifier: Arc<Notifier>,
    events: mpsc::Sender<SessionEvent>,
    options: SessionOptions,
}

impl<R: Realtime> ListeningSession<R> {
    /// Create an idle session. Subscription events arrive on the returned receiver
    /// and must be fed back through [`handle_event`](Self::handle_event).
    pub fn new(
        ctx: SessionContext,
        realtime: R,
        speaker: Arc<NotificationSpeaker>,
        notifier: Arc<Notifier>,
        options: SessionOptions,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(options.buffer.max(1));
        let session = Self {
            ctx,
            state: ListeningState::Idle,
            subscription: None,
            transactions: Vec::new(),
            last_error: None,
            realtime,
            speaker,
            notifier,
            events,
            options,
        };
        (session, rx)
    }

    pub fn state(&self) -> ListeningState {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn merchant_id(&self) -> &str {
        &self.ctx.merchant_id
    }

    /// Payments received this session, newest first.
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn payment_link(&self) -> String {
        format!(
            "{}/pay/{}",
            self.options.public_url.trim_end_matches('/'),
            self.ctx.merchant_id
        )
    }

    pub fn stats(&self) -> MerchantStats {
        stats::compute_today(&self.transactions)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            context: self.context().clone(),
            payment_link: self.payment_link(),
            stats: self.stats(),
            transactions: self.transactions().to_vec(),
            last_error: self.last_error().map(str::to_string),
        }
    }

    /// IDLE → LISTENING.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state == ListeningState::Listening {
            debug!("Already listening");
            return Ok(());
        }
        if let Err(e) = self.check_can_start() {
            self.notifier.error("Cannot activate soundbox", &e.to_string());
            return Err(e);
        }

        // Must run inside the caller's request, before anything async.
        self.speaker.prime(&self.ctx, &self.options.activation_message);

        let handle = match self.realtime.open(&self.ctx.merchant_id, self.events.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                let e = SessionError::from(e);
                self.speaker.silence();
                self.notifier.error("Realtime error", &e.to_string());
                return Err(e);
            }
        };

        self.subscription = Some(handle);
        self.last_error = None;
        self.state = ListeningState::Listening;
        info!("State: IDLE → LISTENING (merchant {})", self.ctx.merchant_id);
        self.notifier.notify("Soundbox activated!", "Listening for payments");
        Ok(())
    }

    fn check_can_start(&self) -> Result<(), SessionError> {
        if self.ctx.merchant_id.is_empty() {
            return Err(SessionError::NoMerchant);
        }
        if !self.speaker.is_supported() {
            return Err(SessionError::CapabilityAbsent);
        }
        if !self.speaker.catalog().is_ready() {
            return Err(SessionError::CatalogNotReady);
        }
        Ok(())
    }

    /// LISTENING → IDLE. Keeps the payments received so far.
    pub fn stop(&mut self) -> bool {
        if !self.go_idle() {
            return false;
        }
        self.notifier.notify("Soundbox deactivated", "No longer listening for payments");
        true
    }

    fn go_idle(&mut self) -> bool {
        if self.state == ListeningState::Idle {
            return false;
        }
        if let Some(mut handle) = self.subscription.take() {
            handle.close();
        }
        self.speaker.silence();
        self.state = ListeningState::Idle;
        info!("State: LISTENING → IDLE");
        true
    }

    /// Switch to another merchant. Never resumes listening on its own.
    pub fn switch_merchant(&mut self, merchant_id: impl Into<String>) {
        let merchant_id = merchant_id.into();
        self.go_idle();
        self.transactions.clear();
        self.last_error = None;
        info!("Merchant: {} → {merchant_id}", self.ctx.merchant_id);
        self.ctx.merchant_id = merchant_id;
        debug!("Payment link: {}", self.payment_link());
        self.notifier.notify("Merchant switched successfully!", &self.ctx.merchant_id);
    }

    /// Apply one subscription event. Returns whether it was accepted.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        let live = self
            .subscription
            .as_ref()
            .filter(|h| !h.is_closed())
            .map(SubscriptionHandle::id);
        if self.state != ListeningState::Listening || live != Some(event.handle()) {
            debug!("Discarding event from subscription {}", event.handle());
            return false;
        }

        match event {
            SessionEvent::Inserted { transaction, .. } => {
                info!(
                    "Payment {}: {} from {}",
                    transaction.id, transaction.amount, transaction.customer_name
                );
                let outcome =
                    self.speaker
                        .announce(&self.ctx, transaction.amount, &transaction.customer_name);
                debug!("Announcement: {outcome:?}");
                self.notifier.notify(
                    "Payment received",
                    &format!(
                        "Payment received: ₱{} from {}",
                        transaction.amount, transaction.customer_name
                    ),
                );
                self.transactions.insert(0, transaction);
            }
            SessionEvent::ChannelError { reason, .. } => {
                // Stays LISTENING; the user has to restart to reconnect.
                self.notifier
                    .error("Failed to connect to realtime updates", &reason);
                self.last_error = Some(reason);
            }
        }
        true
    }

    pub fn update_settings(&mut self, update: SettingsUpdate) -> Result<(), SessionError> {
        if let Some(id) = &update.template_id {
            if find_template(id).is_none() {
                return Err(SessionError::UnknownTemplate(id.clone()));
            }
        }
        if let Some(name) = update.voice.as_deref().filter(|n| !n.is_empty()) {
            if !self.speaker.catalog().voices().iter().any(|v| v.name == name) {
                return Err(SessionError::UnknownVoice(name.to_string()));
            }
        }

        if let Some(preset) = update.preset {
            preset.apply(&mut self.ctx.voice);
            self.ctx.preset = preset;
        }
        if update.rate.is_some() || update.pitch.is_some() || update.volume.is_some() {
            let mut voice = self.ctx.voice;
            voice.rate = update.rate.unwrap_or(voice.rate);
            voice.pitch = update.pitch.unwrap_or(voice.pitch);
            voice.volume = update.volume.unwrap_or(voice.volume);
            self.ctx.voice = voice.clamped();
            self.ctx.preset = VoicePreset::Custom;
        }
        if let Some(id) = update.template_id {
            // Choosing the custom template starts from its stock text.
            if id == CUSTOM_TEMPLATE_ID && self.ctx.template_id != CUSTOM_TEMPLATE_ID {
                if let Some(template) = find_template(CUSTOM_TEMPLATE_ID) {
                    self.ctx.custom_message = template.template.to_string();
                }
            }
            self.ctx.template_id = id;
        }
        if let Some(message) = update.custom_message {
            self.ctx.custom_message = message;
        }
        if let Some(effect) = update.sound_effect {
            self.ctx.sound_effect = effect;
        }
        if let Some(name) = update.voice {
            self.ctx.selected_voice = Some(name).filter(|n| !n.is_empty());
        }

        info!(
            "Settings: preset={:?} rate={:.2} pitch={:.2} volume={:.2} template={} effect={}",
            self.ctx.preset,
            self.ctx.voice.rate,
            self.ctx.voice.pitch,
            self.ctx.voice.volume,
            self.ctx.template_id,
            self.ctx.sound_effect
        );
        Ok(())
    }

    /// Announce a sample payment with the current settings.
    pub fn test_voice(&self) -> Announcement {
        self.speaker
            .announce(&self.ctx, Amount::from_whole(TEST_AMOUNT), TEST_CUSTOMER)
    }

    pub fn test_sound(&self) {
        self.speaker.effects().play(self.ctx.sound_effect);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::speech::catalog::VoiceCatalog;
    use crate::speech::effects::SoundEffectPlayer;
    use crate::speech::host::testing::FakeHost;
    use crate::speech::host::SpeechHost;
    use crate::store::TransactionStatus;

    /// Records opens and hands out handles whose tokens the test can inspect.
    #[derive(Clone, Default)]
    struct FakeRealtime {
        opened: Arc<Mutex<Vec<(String, CancellationToken)>>>,
        fail: bool,
    }

    impl FakeRealtime {
        fn merchants(&self) -> Vec<String> {
            self.opened.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        fn closed(&self) -> usize {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t)| t.is_cancelled())
                .count()
        }
    }

    impl Realtime for FakeRealtime {
        fn open(
            &mut self,
            merchant_id: &str,
            _events: mpsc::Sender<SessionEvent>,
        ) -> Result<SubscriptionHandle, RealtimeError> {
            if self.fail {
                return Err(RealtimeError::Rejected("backend down".into()));
            }
            let mut opened = self.opened.lock().unwrap();
            let token = CancellationToken::new();
            opened.push((merchant_id.to_string(), token.clone()));
            Ok(SubscriptionHandle::new(opened.len() as u64, merchant_id, token, None))
        }
    }

    struct Harness {
        session: ListeningSession<FakeRealtime>,
        realtime: FakeRealtime,
        host: Arc<FakeHost>,
        notifier: Arc<Notifier>,
    }

    fn harness_with(host: FakeHost, catalog_ready: bool) -> Harness {
        let host = Arc::new(host);
        let catalog = Arc::new(VoiceCatalog::new("af_heart", "en-US"));
        if catalog_ready {
            catalog.ingest(host.voices());
        }
        let speaker = Arc::new(NotificationSpeaker::new(
            host.clone(),
            catalog,
            SoundEffectPlayer::new(None),
            Duration::from_millis(10),
        ));
        let notifier = Arc::new(Notifier::new(false));
        let realtime = FakeRealtime::default();
        let (session, _rx) = ListeningSession::new(
            SessionContext::new("merchant-a"),
            realtime.clone(),
            speaker,
            notifier.clone(),
            SessionOptions {
                public_url: "http://localhost:3000/".into(),
                activation_message: "Soundbox activated. Listening for payments.".into(),
                buffer: 8,
            },
        );
        Harness {
            session,
            realtime,
            host,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeHost::english(), true)
    }

    fn payment(handle: u64, id: &str, cents: u64) -> SessionEvent {
        SessionEvent::Inserted {
            handle,
            transaction: Transaction {
                id: id.into(),
                merchant_id: "merchant-a".into(),
                amount: Amount::from_cents(cents),
                customer_name: "Juan".into(),
                status: TransactionStatus::Completed,
                created_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn start_blocked_until_catalog_ready() {
        let mut h = harness_with(FakeHost::english(), false);

        let err = h.session.start().unwrap_err();
        assert!(matches!(err, SessionError::CatalogNotReady));
        assert_eq!(h.session.state(), ListeningState::Idle);
        assert!(h.realtime.merchants().is_empty());
        assert!(h.host.spoken_texts().is_empty());
    }

    #[tokio::test]
    async fn start_blocked_without_speech() {
        let mut h = harness_with(FakeHost::unsupported(), true);

        let err = h.session.start().unwrap_err();
        assert!(matches!(err, SessionError::CapabilityAbsent));
        assert!(h.realtime.merchants().is_empty());
        assert_eq!(h.notifier.recent()[0].body, err.to_string());
    }

    #[tokio::test]
    async fn start_primes_speech_and_subscribes() {
        let mut h = harness();

        h.session.start().unwrap();
        h.session.start().unwrap();

        assert_eq!(h.session.state(), ListeningState::Listening);
        assert_eq!(h.realtime.merchants(), ["merchant-a"]);
        assert_eq!(
            h.host.spoken_texts(),
            ["Soundbox activated. Listening for payments."]
        );
    }

    #[tokio::test]
    async fn failed_subscription_stays_idle() {
        let mut h = harness();
        h.session.realtime.fail = true;

        let err = h.session.start().unwrap_err();
        assert!(matches!(err, SessionError::Subscription(_)));
        assert_eq!(h.session.state(), ListeningState::Idle);
    }

    #[tokio::test]
    async fn switch_merchant_tears_down_and_clears() {
        let mut h = harness();
        h.session.start().unwrap();
        assert!(h.session.handle_event(payment(1, "t1", 10_000)));

        h.session.switch_merchant("merchant-b");
        assert_eq!(h.session.state(), ListeningState::Idle);
        assert!(h.session.transactions().is_empty());
        assert_eq!(h.session.payment_link(), "http://localhost:3000/pay/merchant-b");

        h.session.start().unwrap();
        assert_eq!(h.realtime.merchants(), ["merchant-a", "merchant-b"]);
        assert_eq!(h.realtime.closed(), 1);
        assert!(h.session.transactions().is_empty());
    }

    #[tokio::test]
    async fn payments_are_kept_newest_first() {
        let mut h = harness();
        h.session.start().unwrap();

        h.session.handle_event(payment(1, "t1", 10_000));
        h.session.handle_event(payment(1, "t2", 20_000));

        let ids: Vec<&str> = h.session.transactions().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["t2", "t1"]);
        let stats = h.session.stats();
        assert_eq!(stats.transaction_count, 2);
        assert_eq!(stats.total_revenue, Amount::from_whole(300));
        assert_eq!(
            h.notifier.recent()[0].body,
            "Payment received: ₱200.00 from Juan"
        );
    }

    #[tokio::test]
    async fn stale_and_idle_events_are_discarded() {
        let mut h = harness();
        assert!(!h.session.handle_event(payment(1, "early", 100)));

        h.session.start().unwrap();
        h.session.stop();
        h.session.start().unwrap();

        assert!(!h.session.handle_event(payment(1, "stale", 100)));
        assert!(h.session.handle_event(payment(2, "live", 100)));
        assert_eq!(h.session.transactions().len(), 1);
    }

    #[tokio::test]
    async fn stop_keeps_transactions_and_silences() {
        let mut h = harness();
        h.session.start().unwrap();
        h.session.handle_event(payment(1, "t1", 100));

        assert!(h.session.stop());
        assert!(!h.session.stop());
        assert_eq!(h.session.transactions().len(), 1);
        assert_eq!(h.realtime.closed(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the activation prompt; the queued announcement was dropped.
        assert_eq!(h.host.spoken_texts().len(), 1);
    }

    #[tokio::test]
    async fn channel_error_keeps_listening() {
        let mut h = harness();
        h.session.start().unwrap();

        assert!(h.session.handle_event(SessionEvent::ChannelError {
            handle: 1,
            reason: "change feed closed".into(),
        }));
        assert_eq!(h.session.state(), ListeningState::Listening);
        assert_eq!(h.session.last_error(), Some("change feed closed"));
        assert_eq!(h.realtime.merchants().len(), 1);
    }

    #[tokio::test]
    async fn settings_updates_follow_preset_rules() {
        let mut h = harness();

        h.session
            .update_settings(SettingsUpdate {
                preset: Some(VoicePreset::Excited),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(h.session.context().voice, VoicePreset::Excited.settings());

        h.session
            .update_settings(SettingsUpdate {
                rate: Some(5.0),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(h.session.context().voice.rate, 2.0);
        assert_eq!(h.session.context().preset, VoicePreset::Custom);

        h.session
            .update_settings(SettingsUpdate {
                preset: Some(VoicePreset::Custom),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(h.session.context().voice.rate, 2.0);
    }

    #[tokio::test]
    async fn settings_reject_unknown_template_and_voice() {
        let mut h = harness();

        let err = h
            .session
            .update_settings(SettingsUpdate {
                template_id: Some("fr-default".into()),
                ..SettingsUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownTemplate(_)));

        let err = h
            .session
            .update_settings(SettingsUpdate {
                voice: Some("nobody".into()),
                ..SettingsUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownVoice(_)));

        h.session
            .update_settings(SettingsUpdate {
                voice: Some("bf_emma".into()),
                template_id: Some("tl-default".into()),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert_eq!(h.session.context().selected_voice.as_deref(), Some("bf_emma"));
        assert_eq!(h.session.context().template().language, "tl-PH");
    }

    #[tokio::test]
    async fn test_voice_announces_sample_payment() {
        let h = harness();

        assert_eq!(h.session.test_voice(), Announcement::Scheduled);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.host.spoken_texts(),
            ["Payment received: 100.00 pesos from Test Customer"]
        );
    }

    #[test]
    fn custom_message_used_only_for_custom_template() {
        let mut ctx = SessionContext::new("m");
        ctx.custom_message = "{customer} paid {amount}".into();
        assert_eq!(
            ctx.message_for(Amount::from_whole(1500), "Maria"),
            "Payment received: 1500.00 pesos from Maria"
        );

        ctx.template_id = CUSTOM_TEMPLATE_ID.into();
        assert_eq!(ctx.message_for(Amount::from_whole(1500), "Maria"), "Maria paid 1500.00");
    }

    #[test]
    fn context_from_config_applies_preset() {
        let config = VoiceConfig {
            preset: VoicePreset::Calm,
            template: "es-default".into(),
            custom_message: String::new(),
            sound_effect: SoundEffect::Bell,
        };
        let ctx = SessionContext::from_config("m", &config);
        assert_eq!(ctx.voice, VoicePreset::Calm.settings());
        assert_eq!(ctx.template().language, "es-ES");
        assert_eq!(ctx.sound_effect, SoundEffect::Bell);
    }
}
