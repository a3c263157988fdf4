#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use session_sync::channel::{FrameSink, InboundFrame, RawChannel};
use session_sync::message::{decode_envelope, encode_envelope};
use session_sync::session::{CoordinatorConfig, SystemCoordinator};
use session_sync::{
    ChannelKind, Envelope, GroupActivity, GroupSession, MessageMeta, ParticipantId, Recipients,
    SaveId, SessionActivator, SessionState, SyncConfig, SyncError, SyncHandler, SyncMessage,
};
use tokio::sync::{mpsc, watch};

pub fn activity(save_id: SaveId, file: &str) -> GroupActivity {
    GroupActivity::new(save_id, file, &SyncConfig::default())
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// An outbound frame captured by a [`ScriptedSession`].
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub kind: ChannelKind,
    pub to: Recipients,
    pub envelope: Envelope,
}

struct ScriptedSink {
    kind: ChannelKind,
    sent: Arc<Mutex<Vec<SentFrame>>>,
    fail: Arc<AtomicBool>,
}

impl FrameSink for ScriptedSink {
    fn send_frame(&self, to: &Recipients, payload: Vec<u8>) -> Result<(), SyncError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::SendFailed("transport down".into()));
        }
        let envelope = decode_envelope(&payload)?.expect("current envelope version");
        self.sent.lock().unwrap().push(SentFrame {
            kind: self.kind,
            to: to.clone(),
            envelope,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingCoordinator {
    pub configured: Mutex<Vec<CoordinatorConfig>>,
}

impl SystemCoordinator for CountingCoordinator {
    fn configure(&self, config: CoordinatorConfig) {
        self.configured.lock().unwrap().push(config);
    }
}

/// A session whose state, participants and inbound traffic are driven by the
/// test. Every call the controller makes is appended to `calls`.
pub struct ScriptedSession {
    activity: GroupActivity,
    local: ParticipantId,
    pub coordinator: Option<Arc<CountingCoordinator>>,
    state: watch::Sender<SessionState>,
    participants: watch::Sender<BTreeSet<ParticipantId>>,
    inbound: Mutex<HashMap<ChannelKind, mpsc::Sender<InboundFrame>>>,
    sent: Arc<Mutex<Vec<SentFrame>>>,
    fail_sends: Arc<AtomicBool>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSession {
    pub fn new(activity: GroupActivity) -> Arc<Self> {
        Self::build(activity, true)
    }

    pub fn without_coordinator(activity: GroupActivity) -> Arc<Self> {
        Self::build(activity, false)
    }

    fn build(activity: GroupActivity, with_coordinator: bool) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Waiting);
        let (participants, _) = watch::channel(BTreeSet::new());
        Arc::new(Self {
            activity,
            local: ParticipantId::new(),
            coordinator: with_coordinator.then(|| Arc::new(CountingCoordinator::default())),
            state,
            participants,
            inbound: Mutex::new(HashMap::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn GroupSession> {
        self.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_participants(&self, participants: impl IntoIterator<Item = ParticipantId>) {
        self.participants
            .send_replace(participants.into_iter().collect());
    }

    pub fn invalidate(&self, reason: &str) {
        self.state.send_replace(SessionState::Invalidated {
            reason: reason.into(),
        });
    }

    /// Whether the controller still holds the receiving end of `kind`.
    pub fn receiver_alive(&self, kind: ChannelKind) -> bool {
        self.inbound
            .lock()
            .unwrap()
            .get(&kind)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push a message from `from` into the controller's channel of `kind`.
    pub async fn deliver(&self, kind: ChannelKind, from: ParticipantId, envelope: &Envelope) {
        let tx = self
            .inbound
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .expect("channel opened");
        tx.send(InboundFrame {
            from,
            payload: encode_envelope(envelope).unwrap(),
        })
        .await
        .expect("receiver alive");
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl GroupSession for ScriptedSession {
    fn activity(&self) -> GroupActivity {
        self.activity.clone()
    }

    fn local_participant(&self) -> ParticipantId {
        self.local
    }

    fn system_coordinator(&self) -> Option<Arc<dyn SystemCoordinator>> {
        let coordinator = self.coordinator.clone()?;
        self.record("configure");
        Some(coordinator)
    }

    fn state(&self) -> watch::Receiver<SessionState> {
        self.record("observe state");
        self.state.subscribe()
    }

    fn active_participants(&self) -> watch::Receiver<BTreeSet<ParticipantId>> {
        self.record("observe participants");
        self.participants.subscribe()
    }

    fn open_channel(&self, kind: ChannelKind) -> Result<RawChannel, SyncError> {
        self.record(format!("open {kind}"));
        let (tx, rx) = mpsc::channel(64);
        self.inbound.lock().unwrap().insert(kind, tx);
        Ok(RawChannel {
            kind,
            sink: Arc::new(ScriptedSink {
                kind,
                sent: self.sent.clone(),
                fail: self.fail_sends.clone(),
            }),
            inbound: rx,
        })
    }

    fn join(&self) {
        self.record("join");
        self.state.send_replace(SessionState::Joined);
    }

    fn leave(&self) {
        self.record("leave");
    }
}

/// Records every activation request.
#[derive(Default)]
pub struct RecordingActivator {
    calls: Mutex<Vec<GroupActivity>>,
    failure: Mutex<Option<String>>,
}

impl RecordingActivator {
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Mutex::new(Some(reason.into())),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<GroupActivity> {
        self.calls.lock().unwrap().clone()
    }
}

impl SessionActivator for RecordingActivator {
    fn activate(&self, activity: GroupActivity) -> BoxFuture<'static, Result<(), SyncError>> {
        self.calls.lock().unwrap().push(activity);
        let failure = self.failure.lock().unwrap().clone();
        Box::pin(async move {
            match failure {
                Some(reason) => Err(SyncError::ActivationFailed(reason)),
                None => Ok(()),
            }
        })
    }
}

/// Handler that records what it is given.
pub struct RecordingHandler {
    pub welcome: String,
    pub received: Mutex<Vec<(SyncMessage, ChannelKind, MessageMeta)>>,
}

impl RecordingHandler {
    pub fn new(welcome: &str) -> Self {
        Self {
            welcome: welcome.into(),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<(SyncMessage, ChannelKind, MessageMeta)> {
        self.received.lock().unwrap().clone()
    }
}

impl SyncHandler for RecordingHandler {
    fn on_receive_message(&self, message: &SyncMessage, channel: ChannelKind, meta: &MessageMeta) {
        self.received
            .lock()
            .unwrap()
            .push((message.clone(), channel, *meta));
    }

    fn welcome_envelope(&self) -> Envelope {
        Envelope::new(SyncMessage::WelcomeParticipant {
            welcome_message: self.welcome.clone(),
        })
    }
}
