//! In-process group service.
//!
//! A [`LoopbackHub`] stands in for the platform: each member gets a
//! discovery feed, an activator and a participant id. Activating a save
//! creates one shared session and hands a per-member handle to every
//! member's feed. Frames move between members through tokio queues:
//! reliable queues are deep and report overflow as a send failure,
//! best-effort queues are shallow and drop silently when full.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::channel::{ChannelKind, FrameSink, InboundFrame, RawChannel, Recipients};
use crate::error::SyncError;
use crate::record::{ParticipantId, SaveId};
use crate::session::{
    CoordinatorConfig, DiscoveryFeed, GroupActivity, GroupSession, SessionActivator,
    SessionState, SystemCoordinator,
};

/// Per-participant queue depth of reliable channels.
pub const RELIABLE_QUEUE_DEPTH: usize = 1024;

const FEED_DEPTH: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One endpoint attached to the hub.
pub struct LoopbackMember {
    pub participant: ParticipantId,
    pub feed: DiscoveryFeed,
    pub activator: Arc<dyn SessionActivator>,
}

#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    best_effort_capacity: usize,
    members: Mutex<Vec<(ParticipantId, mpsc::Sender<Arc<dyn GroupSession>>)>>,
    sessions: Mutex<HashMap<SaveId, Arc<SharedSession>>>,
    coordinator_available: AtomicBool,
    activation_failure: Mutex<Option<String>>,
    next_session_id: AtomicU64,
}

impl LoopbackHub {
    pub fn new(best_effort_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                best_effort_capacity: best_effort_capacity.max(1),
                members: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                coordinator_available: AtomicBool::new(true),
                activation_failure: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a new endpoint. Sessions that are already live show up on its
    /// feed right away.
    pub fn add_member(&self) -> LoopbackMember {
        let participant = ParticipantId::new();
        let (tx, rx) = mpsc::channel(FEED_DEPTH);
        let has_coordinator = self.inner.coordinator_available.load(Ordering::SeqCst);
        for shared in lock(&self.inner.sessions).values() {
            let handle = LoopbackSession::new(shared.clone(), participant, has_coordinator);
            if tx.try_send(handle).is_err() {
                debug!(%participant, session = shared.id, "feed full, live session not offered");
            }
        }
        lock(&self.inner.members).push((participant, tx));
        debug!(%participant, "loopback member added");
        LoopbackMember {
            participant,
            feed: rx,
            activator: Arc::new(LoopbackActivator {
                hub: self.inner.clone(),
            }),
        }
    }

    /// Whether sessions created from now on offer a system coordinator.
    pub fn set_coordinator_available(&self, available: bool) {
        self.inner
            .coordinator_available
            .store(available, Ordering::SeqCst);
    }

    /// Make every activation fail with `reason`, or succeed again with `None`.
    pub fn fail_activations(&self, reason: Option<String>) {
        *lock(&self.inner.activation_failure) = reason;
    }

    /// Participants currently joined to the live session of `save_id`.
    pub fn participants(&self, save_id: SaveId) -> BTreeSet<ParticipantId> {
        lock(&self.inner.sessions)
            .get(&save_id)
            .map(|s| s.participants.borrow().clone())
            .unwrap_or_default()
    }

    /// Sessions created so far across all saves.
    pub fn sessions_created(&self) -> u64 {
        self.inner.next_session_id.load(Ordering::SeqCst) - 1
    }

    /// End the live session of `save_id` for everyone.
    pub fn invalidate(&self, save_id: SaveId, reason: &str) -> bool {
        let Some(shared) = lock(&self.inner.sessions).remove(&save_id) else {
            return false;
        };
        info!(%save_id, session = shared.id, reason, "invalidating loopback session");
        shared.invalidate(reason);
        true
    }
}

struct LoopbackActivator {
    hub: Arc<HubInner>,
}

impl SessionActivator for LoopbackActivator {
    fn activate(&self, activity: GroupActivity) -> BoxFuture<'static, Result<(), SyncError>> {
        let hub = self.hub.clone();
        Box::pin(async move {
            if let Some(reason) = lock(&hub.activation_failure).clone() {
                return Err(SyncError::ActivationFailed(reason));
            }

            let shared = {
                let mut sessions = lock(&hub.sessions);
                if sessions.contains_key(&activity.save_id) {
                    debug!(save_id = %activity.save_id, "session already live, not re-advertising");
                    return Ok(());
                }
                let shared = Arc::new(SharedSession::new(
                    hub.next_session_id.fetch_add(1, Ordering::SeqCst),
                    activity.clone(),
                    hub.best_effort_capacity,
                ));
                sessions.insert(activity.save_id, shared.clone());
                shared
            };

            let has_coordinator = hub.coordinator_available.load(Ordering::SeqCst);
            let members = lock(&hub.members).clone();
            info!(
                save_id = %activity.save_id,
                session = shared.id,
                members = members.len(),
                "advertising loopback session"
            );
            for (participant, feed) in members {
                let handle = LoopbackSession::new(shared.clone(), participant, has_coordinator);
                if feed.send(handle).await.is_err() {
                    debug!(%participant, "member stopped listening for sessions");
                }
            }
            Ok(())
        })
    }
}

/// State shared by every member's handle of one session.
struct SharedSession {
    id: u64,
    activity: GroupActivity,
    best_effort_capacity: usize,
    state: watch::Sender<SessionState>,
    participants: watch::Sender<BTreeSet<ParticipantId>>,
    inboxes: Mutex<HashMap<(ParticipantId, ChannelKind), mpsc::Sender<InboundFrame>>>,
}

impl SharedSession {
    fn new(id: u64, activity: GroupActivity, best_effort_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Waiting);
        let (participants, _) = watch::channel(BTreeSet::new());
        Self {
            id,
            activity,
            best_effort_capacity,
            state,
            participants,
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    fn is_invalidated(&self) -> bool {
        self.state.borrow().is_invalidated()
    }

    fn invalidate(&self, reason: &str) {
        self.state.send_replace(SessionState::Invalidated {
            reason: reason.to_string(),
        });
        lock(&self.inboxes).clear();
    }

    fn deliver(
        &self,
        from: ParticipantId,
        kind: ChannelKind,
        to: &Recipients,
        payload: Vec<u8>,
    ) -> Result<(), SyncError> {
        if self.is_invalidated() {
            return Err(SyncError::SendFailed("session invalidated".to_string()));
        }
        let active = self.participants.borrow().clone();
        let mut inboxes = lock(&self.inboxes);
        let mut overflowed = Vec::new();

        inboxes.retain(|(participant, inbox_kind), inbox| {
            if *inbox_kind != kind
                || *participant == from
                || !active.contains(participant)
                || !to.includes(participant)
            {
                return true;
            }
            let frame = InboundFrame {
                from,
                payload: payload.clone(),
            };
            match inbox.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    match kind {
                        ChannelKind::Reliable => overflowed.push(*participant),
                        ChannelKind::BestEffort => {
                            debug!(%participant, "best-effort queue full, dropping frame")
                        }
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if overflowed.is_empty() {
            Ok(())
        } else {
            Err(SyncError::SendFailed(format!(
                "reliable queue full for {} participant(s)",
                overflowed.len()
            )))
        }
    }
}

/// One member's view of a shared session.
struct LoopbackSession {
    shared: Arc<SharedSession>,
    local: ParticipantId,
    coordinator: Option<Arc<LoopbackCoordinator>>,
}

impl LoopbackSession {
    fn new(
        shared: Arc<SharedSession>,
        local: ParticipantId,
        has_coordinator: bool,
    ) -> Arc<dyn GroupSession> {
        Arc::new(Self {
            shared,
            local,
            coordinator: has_coordinator.then(|| Arc::new(LoopbackCoordinator::default())),
        })
    }
}

impl GroupSession for LoopbackSession {
    fn activity(&self) -> GroupActivity {
        self.shared.activity.clone()
    }

    fn local_participant(&self) -> ParticipantId {
        self.local
    }

    fn system_coordinator(&self) -> Option<Arc<dyn SystemCoordinator>> {
        self.coordinator
            .clone()
            .map(|c| c as Arc<dyn SystemCoordinator>)
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    fn active_participants(&self) -> watch::Receiver<BTreeSet<ParticipantId>> {
        self.shared.participants.subscribe()
    }

    fn open_channel(&self, kind: ChannelKind) -> Result<RawChannel, SyncError> {
        if self.shared.is_invalidated() {
            return Err(SyncError::JoinFailed("session invalidated".to_string()));
        }
        let depth = match kind {
            ChannelKind::Reliable => RELIABLE_QUEUE_DEPTH,
            ChannelKind::BestEffort => self.shared.best_effort_capacity,
        };
        let (tx, rx) = mpsc::channel(depth);
        // Replacing an older inbox closes its receiver.
        lock(&self.shared.inboxes).insert((self.local, kind), tx);

        Ok(RawChannel {
            kind,
            sink: Arc::new(LoopbackSink {
                shared: self.shared.clone(),
                from: self.local,
                kind,
            }),
            inbound: rx,
        })
    }

    fn join(&self) {
        let local = self.local;
        self.shared.participants.send_modify(|set| {
            set.insert(local);
        });
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Waiting {
                *state = SessionState::Joined;
                true
            } else {
                false
            }
        });
        debug!(participant = %local, session = self.shared.id, "joined loopback session");
    }

    fn leave(&self) {
        let local = self.local;
        self.shared.participants.send_if_modified(|set| set.remove(&local));
        lock(&self.shared.inboxes).retain(|(participant, _), _| *participant != local);
        debug!(participant = %local, session = self.shared.id, "left loopback session");
    }
}

struct LoopbackSink {
    shared: Arc<SharedSession>,
    from: ParticipantId,
    kind: ChannelKind,
}

impl FrameSink for LoopbackSink {
    fn send_frame(&self, to: &Recipients, payload: Vec<u8>) -> Result<(), SyncError> {
        self.shared.deliver(self.from, self.kind, to, payload)
    }

    fn is_open(&self) -> bool {
        !self.shared.is_invalidated()
            && lock(&self.shared.inboxes).contains_key(&(self.from, self.kind))
    }
}

#[derive(Default)]
struct LoopbackCoordinator {
    config: Mutex<Option<CoordinatorConfig>>,
}

impl SystemCoordinator for LoopbackCoordinator {
    fn configure(&self, config: CoordinatorConfig) {
        let mut current = lock(&self.config);
        if current.as_ref() != Some(&config) {
            debug!(?config, "system coordinator configured");
            *current = Some(config);
        }
    }
}
