//! Soundbox service: one task owns the listening session.
//!
//! HTTP handlers talk to it through [`SoundboxHandle`]; subscription events
//! arrive on the session's own queue. Both are drained by a single select loop,
//! so the transaction list never needs a lock.

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::realtime::{Realtime, SessionEvent};
use crate::saved_state::SavedState;
use crate::session::{ListeningSession, SessionError, SessionSnapshot, SettingsUpdate};
use crate::speech::speaker::Announcement;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("soundbox service is not running")]
    Stopped,
    #[error(transparent)]
    Session(#[from] SessionError),
}

type Reply<T> = oneshot::Sender<T>;

pub enum Command {
    Status(Reply<SessionSnapshot>),
    Start(Reply<Result<SessionSnapshot, SessionError>>),
    Stop(Reply<SessionSnapshot>),
    SwitchMerchant {
        merchant_id: String,
        reply: Reply<SessionSnapshot>,
    },
    UpdateSettings {
        update: SettingsUpdate,
        reply: Reply<Result<SessionSnapshot, SessionError>>,
    },
    TestVoice(Reply<Announcement>),
    TestSound(Reply<()>),
}

/// Cloneable client for the service task.
#[derive(Clone)]
pub struct SoundboxHandle {
    commands: mpsc::Sender<Command>,
}

impl SoundboxHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn status(&self) -> Result<SessionSnapshot, ServiceError> {
        self.request(Command::Status).await
    }

    pub async fn start(&self) -> Result<SessionSnapshot, ServiceError> {
        Ok(self.request(Command::Start).await??)
    }

    pub async fn stop(&self) -> Result<SessionSnapshot, ServiceError> {
        self.request(Command::Stop).await
    }

    pub async fn switch_merchant(&self, merchant_id: String) -> Result<SessionSnapshot, ServiceError> {
        self.request(|reply| Command::SwitchMerchant { merchant_id, reply })
            .await
    }

    pub async fn update_settings(
        &self,
        update: SettingsUpdate,
    ) -> Result<SessionSnapshot, ServiceError> {
        Ok(self
            .request(|reply| Command::UpdateSettings { update, reply })
            .await??)
    }

    pub async fn test_voice(&self) -> Result<Announcement, ServiceError> {
        self.request(Command::TestVoice).await
    }

    pub async fn test_sound(&self) -> Result<(), ServiceError> {
        self.request(Command::TestSound).await
    }
}

pub struct SoundboxService<R: Realtime> {
    session: ListeningSession<R>,
    events: mpsc::Receiver<SessionEvent>,
    commands: mpsc::Receiver<Command>,
    /// Where the selected merchant is remembered, if anywhere.
    state_path: Option<PathBuf>,
}

impl<R: Realtime> SoundboxService<R> {
    pub fn new(
        session: ListeningSession<R>,
        events: mpsc::Receiver<SessionEvent>,
        state_path: Option<PathBuf>,
    ) -> (Self, SoundboxHandle) {
        let (tx, commands) = mpsc::channel(16);
        let service = Self {
            session,
            events,
            commands,
            state_path,
        };
        (service, SoundboxHandle { commands: tx })
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            "Soundbox ready for merchant {} (state: {})",
            self.session.merchant_id(),
            self.session.state()
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => {
                            info!("All handles dropped, shutting down");
                            break;
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.session.handle_event(event);
                }
            }
        }

        self.session.stop();
    }

    fn on_command(&mut self, command: Command) {
        // A dropped reply only means the HTTP caller went away.
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Start(reply) => {
                let result = self.session.start().map(|()| self.session.snapshot());
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.session.stop();
                let _ = reply.send(self.session.snapshot());
            }
            Command::SwitchMerchant { merchant_id, reply } => {
                self.session.switch_merchant(merchant_id);
                self.remember_merchant();
                let _ = reply.send(self.session.snapshot());
            }
            Command::UpdateSettings { update, reply } => {
                let result = self
                    .session
                    .update_settings(update)
                    .map(|()| self.session.snapshot());
                let _ = reply.send(result);
            }
            Command::TestVoice(reply) => {
                let _ = reply.send(self.session.test_voice());
            }
            Command::TestSound(reply) => {
                self.session.test_sound();
                let _ = reply.send(());
            }
        }
    }

    fn remember_merchant(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = SavedState {
            last_merchant_id: Some(self.session.merchant_id().to_string()),
        };
        if let Err(e) = state.save(path) {
            warn!("Failed to remember merchant selection: {e}");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::testing::spawn_service;
    use super::*;
    use crate::amount::Amount;
    use crate::session::ListeningState;
    use crate::store::{MemoryStore, PaymentStore};

    fn store_with_merchant() -> (Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new(16));
        let merchant = store.create_merchant("Aling Nena").unwrap();
        (store, merchant.id)
    }

    #[tokio::test]
    async fn payments_flow_from_store_to_session() {
        let (store, merchant_id) = store_with_merchant();
        let running = spawn_service(&store, &merchant_id, None);

        let snapshot = running.handle.start().await.unwrap();
        assert_eq!(snapshot.state, ListeningState::Listening);

        store
            .create_transaction(&merchant_id, Amount::from_whole(250), "Maria")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = running.handle.status().await.unwrap();
        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.stats.total_revenue, Amount::from_whole(250));
        assert_eq!(
            running.host.spoken_texts().last().map(String::as_str),
            Some("Payment received: 250.00 pesos from Maria")
        );
    }

    #[tokio::test]
    async fn switching_merchant_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (store, merchant_id) = store_with_merchant();
        let running = spawn_service(&store, &merchant_id, Some(path.clone()));

        running.handle.start().await.unwrap();
        let snapshot = running
            .handle
            .switch_merchant("m_other".into())
            .await
            .unwrap();

        assert_eq!(snapshot.state, ListeningState::Idle);
        assert_eq!(snapshot.payment_link, "http://localhost:3000/pay/m_other");
        assert_eq!(
            SavedState::load(&path).unwrap().last_merchant_id.as_deref(),
            Some("m_other")
        );
    }

    #[tokio::test]
    async fn session_errors_reach_the_caller() {
        let (store, merchant_id) = store_with_merchant();
        let running = spawn_service(&store, &merchant_id, None);

        let err = running
            .handle
            .update_settings(SettingsUpdate {
                template_id: Some("nope".into()),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Session(SessionError::UnknownTemplate(_))));
    }
}
