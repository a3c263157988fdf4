use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::channel::ChannelKind;
use crate::config::SyncConfig;
use crate::controller::SessionController;
use crate::error::SyncError;
use crate::handler::RecordHandler;
use crate::message::{Envelope, SyncMessage};
use crate::presentation::{ViewId, WindowManager};
use crate::record::{ParticipantId, RecordEvent, RecordStore, SaveId, SharedRecord};
use crate::session::{DiscoveryFeed, GroupActivity, GroupSession, SessionActivator};

/// Record and controller of one SaveId.
struct SaveEntry {
    store: Arc<RecordStore>,
    controller: Arc<SessionController>,
}

/// Owns every record and controller, keyed by SaveId.
///
/// Entries are created on first `prepare` and live as long as the registry.
/// Callers hold SaveIds, not records.
pub struct SyncRegistry {
    config: SyncConfig,
    origin: ParticipantId,
    activator: Arc<dyn SessionActivator>,
    windows: Option<Arc<WindowManager>>,
    entries: RwLock<HashMap<SaveId, SaveEntry>>,
    events: broadcast::Sender<RecordEvent>,
}

impl SyncRegistry {
    /// `origin` identifies this process in the ordering stamps of local edits.
    pub fn new(
        config: SyncConfig,
        origin: ParticipantId,
        activator: Arc<dyn SessionActivator>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            origin,
            activator,
            windows: None,
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn with_windows(mut self, windows: Arc<WindowManager>) -> Self {
        self.windows = Some(windows);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn origin(&self) -> ParticipantId {
        self.origin
    }

    pub fn windows(&self) -> Option<&Arc<WindowManager>> {
        self.windows.as_ref()
    }

    /// Record changes of every SaveId, local and remote.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    /// Create the record and controller for `save_id` if missing, then join
    /// `session` when one is given.
    pub async fn prepare(
        &self,
        save_id: SaveId,
        file: &str,
        session: Option<Arc<dyn GroupSession>>,
    ) -> Result<Arc<SessionController>, SyncError> {
        let controller = {
            let mut entries = self.entries.write().await;
            match entries.get(&save_id) {
                Some(entry) => entry.controller.clone(),
                None => {
                    let store = Arc::new(RecordStore::new(
                        SharedRecord::new(save_id, file),
                        self.events.clone(),
                    ));
                    let handler = Arc::new(RecordHandler::new(store.clone()));
                    let controller = Arc::new(SessionController::spawn(
                        save_id,
                        handler,
                        self.activator.clone(),
                        self.config.mailbox_capacity,
                    ));
                    info!(%save_id, file, "prepared save");
                    entries.insert(
                        save_id,
                        SaveEntry {
                            store,
                            controller: controller.clone(),
                        },
                    );
                    controller
                }
            }
        };

        if let Some(session) = session {
            controller.join(session).await?;
        }
        Ok(controller)
    }

    /// Join a discovered session and show its volume.
    pub async fn on_found_session(&self, session: Arc<dyn GroupSession>) -> Result<(), SyncError> {
        let activity = session.activity();
        info!(save_id = %activity.save_id, file = %activity.file, "found session");
        if session.system_coordinator().is_none() {
            return Err(SyncError::NoSystemCoordinator);
        }

        self.prepare(activity.save_id, &activity.file, Some(session))
            .await?;

        if let Some(windows) = &self.windows {
            windows.show_volume(activity.save_id);
        }
        Ok(())
    }

    /// Consume discovered sessions until the feed closes.
    ///
    /// Sessions that cannot be joined are skipped.
    pub async fn run_discovery(&self, mut feed: DiscoveryFeed) {
        while let Some(session) = feed.recv().await {
            match self.on_found_session(session).await {
                Ok(()) => {}
                Err(e) if e.skips_discovery() => {
                    warn!(error = %e, code = e.error_code(), "skipping discovered session");
                }
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "failed to handle discovered session");
                }
            }
        }
        debug!("discovery feed closed");
    }

    /// Start a session for `save_id` so other participants can join.
    pub async fn start_session(&self, save_id: SaveId, file: &str) -> Result<(), SyncError> {
        let controller = self.prepare(save_id, file, None).await?;
        let store = self.store(save_id).await?;

        if store.read(|r| r.welcome_message.is_empty()) {
            store.update_local(|r| {
                r.set_welcome_local(self.config.default_welcome_message.clone(), self.origin)
            });
            debug!(%save_id, "seeded default welcome message");
        }

        controller
            .activate_session(GroupActivity::new(save_id, file, &self.config))
            .await;
        Ok(())
    }

    /// Tear down the session of `save_id` and try to reconnect.
    pub async fn reset(&self, save_id: SaveId) -> Result<(), SyncError> {
        let (store, controller) = self.entry(save_id).await?;
        let file = store.read(|r| r.file.clone());
        controller
            .reset(GroupActivity::new(save_id, file, &self.config))
            .await;
        Ok(())
    }

    /// Local edit of the shared file, pushed to every participant.
    pub async fn set_file(&self, save_id: SaveId, file: &str) -> Result<(), SyncError> {
        let (store, controller) = self.entry(save_id).await?;
        let stamp = store.update_local(|r| r.set_file_local(file, self.origin));
        let envelope = Envelope::stamped(
            SyncMessage::Update {
                file: file.to_string(),
            },
            stamp,
        );
        controller
            .send_envelope(ChannelKind::Reliable, envelope, None)
            .await;
        Ok(())
    }

    /// Local edit of the welcome message, pushed to every participant.
    pub async fn set_welcome_message(
        &self,
        save_id: SaveId,
        welcome_message: &str,
    ) -> Result<(), SyncError> {
        let (store, controller) = self.entry(save_id).await?;
        let stamp = store.update_local(|r| r.set_welcome_local(welcome_message, self.origin));
        let envelope = Envelope::stamped(
            SyncMessage::WelcomeParticipant {
                welcome_message: welcome_message.to_string(),
            },
            stamp,
        );
        controller
            .send_envelope(ChannelKind::Reliable, envelope, None)
            .await;
        Ok(())
    }

    /// Toggle a view for `save_id`, preparing the save first.
    pub async fn toggle_view(
        &self,
        view: ViewId,
        save_id: SaveId,
        file: &str,
    ) -> Result<bool, SyncError> {
        self.prepare(save_id, file, None).await?;
        let Some(windows) = &self.windows else {
            return Err(SyncError::PresentationFailed(
                "no presentation gateway configured".to_string(),
            ));
        };
        windows.toggle(view, save_id).await
    }

    pub async fn record(&self, save_id: SaveId) -> Option<SharedRecord> {
        let entries = self.entries.read().await;
        entries.get(&save_id).map(|e| e.store.snapshot())
    }

    pub async fn controller(&self, save_id: SaveId) -> Option<Arc<SessionController>> {
        let entries = self.entries.read().await;
        entries.get(&save_id).map(|e| e.controller.clone())
    }

    pub async fn save_ids(&self) -> Vec<SaveId> {
        let entries = self.entries.read().await;
        let mut ids: Vec<SaveId> = entries.keys().copied().collect();
        ids.sort();
        ids
    }

    async fn store(&self, save_id: SaveId) -> Result<Arc<RecordStore>, SyncError> {
        Ok(self.entry(save_id).await?.0)
    }

    async fn entry(
        &self,
        save_id: SaveId,
    ) -> Result<(Arc<RecordStore>, Arc<SessionController>), SyncError> {
        let entries = self.entries.read().await;
        entries
            .get(&save_id)
            .map(|e| (e.store.clone(), e.controller.clone()))
            .ok_or(SyncError::UnknownSave(save_id))
    }
}
