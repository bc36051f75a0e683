//! soundbox: realtime voice announcements for incoming merchant payments.

mod amount;
mod api;
mod config;
mod notifier;
mod realtime;
mod saved_state;
mod service;
mod session;
mod speech;
mod stats;
mod store;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::realtime::SubscriptionManager;
use crate::saved_state::SavedState;
use crate::session::{ListeningSession, SessionContext, SessionOptions};
use crate::speech::catalog::{RetryPolicy, VoiceCatalog};
use crate::speech::effects::SoundEffectPlayer;
use crate::speech::host::{SpeechHost, UnavailableHost};
use crate::speech::kokoro::KokoroHost;
use crate::speech::output::AudioOutput;
use crate::speech::speaker::NotificationSpeaker;
use crate::store::{MemoryStore, PaymentStore};

#[derive(Parser, Debug)]
#[command(name = "soundbox", about = "Realtime voice notifications for merchant payments")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Merchant id to listen for (overrides the remembered one)
    #[arg(short, long)]
    merchant: Option<String>,

    /// HTTP port (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Run without text-to-speech (sound effects only)
    #[arg(long)]
    no_speech: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("soundbox starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Payment store, seeded with the demo merchants
    let store = Arc::new(MemoryStore::new(config.realtime.buffer));
    store.seed(&config.merchants.seed)?;

    // Audio output is optional: headless machines still get notifications
    let output = match AudioOutput::open_default() {
        Ok(output) => Some(Arc::new(output)),
        Err(e) => {
            warn!("{e}, continuing without sound");
            None
        }
    };

    let host: Arc<dyn SpeechHost> = if args.no_speech || !config.speech.enabled {
        info!("Speech disabled");
        Arc::new(UnavailableHost::new())
    } else {
        info!("Loading Kokoro TTS model...");
        let kokoro = KokoroHost::new(&config.speech, output.clone());
        kokoro.spawn_load();
        Arc::new(kokoro)
    };

    let catalog = Arc::new(VoiceCatalog::new(
        config.speech.preferred_voice.clone(),
        config.speech.language.clone(),
    ));
    catalog.spawn_loader(
        Arc::clone(&host),
        RetryPolicy {
            attempts: config.speech.catalog_attempts,
            delay: config.speech.catalog_retry(),
        },
    );

    tokio::spawn({
        let catalog = Arc::clone(&catalog);
        async move {
            catalog.wait_ready().await;
            match catalog.default_voice() {
                Some(voice) => info!("Voices ready (default: {voice})"),
                None => warn!("No voices available, payments will only play sound effects"),
            }
        }
    });

    let speaker = Arc::new(NotificationSpeaker::new(
        host,
        Arc::clone(&catalog),
        SoundEffectPlayer::new(output),
        config.speech.handoff(),
    ));
    let notifier = Arc::new(notifier::Notifier::new(config.feedback.notifications));

    let state_path = config
        .merchants
        .remember_selection
        .then(saved_state::default_path)
        .flatten();
    let merchant_id = initial_merchant(&args, &config, store.as_ref(), state_path.as_deref());
    info!("Merchant: {}", if merchant_id.is_empty() { "(none)" } else { &merchant_id });

    let (session, events) = ListeningSession::new(
        SessionContext::from_config(merchant_id, &config.voice),
        SubscriptionManager::new(Arc::clone(&store)),
        speaker,
        Arc::clone(&notifier),
        SessionOptions {
            public_url: config.server.public_url.clone(),
            activation_message: config.speech.activation_message.clone(),
            buffer: config.realtime.buffer,
        },
    );
    let (service, handle) = service::SoundboxService::new(session, events, state_path);

    let api_state = api::ApiState {
        store,
        soundbox: handle,
        catalog,
        notifier,
    };
    api::start_api(api_state, &config.server.host, config.server.port).await?;

    service.run().await;

    Ok(())
}

/// Pick the merchant to start with: command line, then the remembered
/// selection, then the configured default, then the first by name.
fn initial_merchant(
    args: &Args,
    config: &Config,
    store: &dyn PaymentStore,
    state_path: Option<&std::path::Path>,
) -> String {
    let remembered = state_path.and_then(|path| match SavedState::load(path) {
        Ok(state) => state.last_merchant_id,
        Err(e) => {
            warn!("Ignoring saved state: {e}");
            None
        }
    });

    let candidates = [
        args.merchant.clone(),
        remembered,
        config.merchants.default_id.clone(),
    ];
    for id in candidates.into_iter().flatten() {
        match store.get_merchant(&id) {
            Ok(Some(merchant)) => return merchant.id,
            Ok(None) => warn!("Unknown merchant {id}, skipping"),
            Err(e) => warn!("Failed to look up merchant {id}: {e}"),
        }
    }

    store
        .list_merchants()
        .ok()
        .and_then(|merchants| merchants.into_iter().next())
        .map(|m| m.id)
        .unwrap_or_default()
}
