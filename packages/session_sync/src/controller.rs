//! Per-SaveId session lifecycle.
//!
//! A [`SessionController`] is a handle to an actor task that exclusively owns
//! the attached session, its two channels and the four background tasks
//! (two receive loops, the state observer and the participant observer).
//! Background tasks never touch controller state directly: they forward
//! events tagged with the generation of the attachment that spawned them,
//! and the actor drops anything from an older generation. Teardown cancels
//! the attachment's token, aborts its tasks and bumps the generation in one
//! step, so nothing a cancelled task still has in flight can land afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelKind, ChannelReceiver, ChannelSet, MessageChannel, Received, Recipients};
use crate::error::SyncError;
use crate::handler::{MessageMeta, SyncHandler};
use crate::message::{Envelope, SyncMessage};
use crate::record::{ParticipantId, SaveId};
use crate::session::{
    CoordinatorConfig, GroupActivity, GroupSession, SessionActivator, SessionState,
};

/// Coarse controller state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Activating,
    Joined,
}

/// Snapshot of controller resources and counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub save_id: SaveId,
    pub phase: Phase,
    pub open_channels: usize,
    pub receive_loops: usize,
    pub observers: usize,
    /// Calls made to the session activator.
    pub activations: u64,
    /// Teardowns of an attached session that led to a reconnection attempt.
    pub resets: u64,
    pub welcomes_sent: u64,
    pub send_failures: u64,
    pub generation: u64,
}

enum Command {
    Activate {
        activity: GroupActivity,
    },
    Join {
        session: Arc<dyn GroupSession>,
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Reset {
        activity: GroupActivity,
        respond_to: oneshot::Sender<()>,
    },
    Send {
        kind: ChannelKind,
        envelope: Envelope,
        to: Recipients,
    },
    Stats {
        respond_to: oneshot::Sender<ControllerStats>,
    },
}

/// Reported by background tasks.
enum Event {
    Received {
        generation: u64,
        received: Received,
    },
    StateChanged {
        generation: u64,
        state: SessionState,
    },
    ParticipantsJoined {
        generation: u64,
        joined: BTreeSet<ParticipantId>,
    },
    ActivationFinished {
        activity: GroupActivity,
        result: Result<(), SyncError>,
    },
}

enum Mail {
    Command(Command),
    Event(Event),
}

/// Handle to the controller actor of one SaveId.
///
/// Dropping the handle stops the actor, which leaves any attached session.
pub struct SessionController {
    save_id: SaveId,
    sender: mpsc::Sender<Mail>,
    shutdown: CancellationToken,
}

impl SessionController {
    /// Spawn the actor. Must be called from within a tokio runtime.
    pub fn spawn(
        save_id: SaveId,
        handler: Arc<dyn SyncHandler>,
        activator: Arc<dyn SessionActivator>,
        mailbox_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(mailbox_capacity.max(1));
        let shutdown = CancellationToken::new();

        let actor = ControllerActor {
            save_id,
            handler,
            activator,
            mailbox: sender.clone(),
            receiver,
            shutdown: shutdown.clone(),
            phase: Phase::Idle,
            attachment: None,
            generation: 0,
            activations: 0,
            resets: 0,
            welcomes_sent: 0,
            send_failures: 0,
        };
        tokio::spawn(actor.run());

        Self {
            save_id,
            sender,
            shutdown,
        }
    }

    pub fn save_id(&self) -> SaveId {
        self.save_id
    }

    async fn command(&self, command: Command) -> Result<(), SyncError> {
        self.sender
            .send(Mail::Command(command))
            .await
            .map_err(|_| SyncError::ControllerGone)
    }

    /// Ask the platform to create and advertise a session for `activity`.
    ///
    /// Returns once the request is queued. The outcome is only logged.
    pub async fn activate_session(&self, activity: GroupActivity) {
        if let Err(e) = self.command(Command::Activate { activity }).await {
            warn!(save_id = %self.save_id, error = %e, "cannot activate session");
        }
    }

    /// Attach a discovered session, tearing down any previous attachment.
    pub async fn join(&self, session: Arc<dyn GroupSession>) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Join {
            session,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ControllerGone)?
    }

    /// Tear down the attached session, if any, and try to reconnect.
    pub async fn reset(&self, activity: GroupActivity) {
        let (tx, rx) = oneshot::channel();
        let queued = self
            .command(Command::Reset {
                activity,
                respond_to: tx,
            })
            .await;
        if queued.is_err() || rx.await.is_err() {
            warn!(save_id = %self.save_id, "reset on a stopped controller");
        }
    }

    /// Fire-and-forget send on the reliable channel. `None` broadcasts.
    pub async fn send(&self, message: SyncMessage, to: Option<BTreeSet<ParticipantId>>) {
        self.send_envelope(ChannelKind::Reliable, message.into(), to)
            .await
    }

    /// Fire-and-forget send on a specific channel.
    pub async fn send_on(
        &self,
        kind: ChannelKind,
        message: SyncMessage,
        to: Option<BTreeSet<ParticipantId>>,
    ) {
        self.send_envelope(kind, message.into(), to).await
    }

    pub async fn send_envelope(
        &self,
        kind: ChannelKind,
        envelope: Envelope,
        to: Option<BTreeSet<ParticipantId>>,
    ) {
        let command = Command::Send {
            kind,
            envelope,
            to: to.into(),
        };
        if let Err(e) = self.command(command).await {
            warn!(save_id = %self.save_id, %kind, error = %e, "dropping outbound message");
        }
    }

    pub async fn stats(&self) -> Result<ControllerStats, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stats { respond_to: tx }).await?;
        rx.await.map_err(|_| SyncError::ControllerGone)
    }

    pub async fn phase(&self) -> Result<Phase, SyncError> {
        Ok(self.stats().await?.phase)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Everything owned on behalf of one attached session.
struct Attachment {
    session: Arc<dyn GroupSession>,
    activity: GroupActivity,
    channels: ChannelSet,
    token: CancellationToken,
    receive_loops: Vec<JoinHandle<()>>,
    observers: Vec<JoinHandle<()>>,
}

impl Attachment {
    fn cancel(&self) {
        self.token.cancel();
        for task in self.receive_loops.iter().chain(&self.observers) {
            task.abort();
        }
    }
}

struct ControllerActor {
    save_id: SaveId,
    handler: Arc<dyn SyncHandler>,
    activator: Arc<dyn SessionActivator>,
    mailbox: mpsc::Sender<Mail>,
    receiver: mpsc::Receiver<Mail>,
    shutdown: CancellationToken,
    phase: Phase,
    attachment: Option<Attachment>,
    generation: u64,
    activations: u64,
    resets: u64,
    welcomes_sent: u64,
    send_failures: u64,
}

impl ControllerActor {
    async fn run(mut self) {
        debug!(save_id = %self.save_id, "session controller started");

        loop {
            let mail = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                mail = self.receiver.recv() => match mail {
                    Some(mail) => mail,
                    None => break,
                },
            };
            match mail {
                Mail::Command(command) => self.handle_command(command),
                Mail::Event(event) => self.handle_event(event),
            }
        }

        if let Some(attachment) = self.detach() {
            attachment.session.leave();
        }
        debug!(save_id = %self.save_id, "session controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activate { activity } => self.activate(activity),
            Command::Join {
                session,
                respond_to,
            } => {
                let result = self.join(session);
                let _ = respond_to.send(result);
            }
            Command::Reset {
                activity,
                respond_to,
            } => {
                self.reset(activity);
                let _ = respond_to.send(());
            }
            Command::Send { kind, envelope, to } => self.send(kind, &envelope, &to),
            Command::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ActivationFinished { activity, result } => {
                self.on_activation_finished(activity, result)
            }
            Event::Received {
                generation,
                received,
            } => {
                if self.is_stale(generation) {
                    return;
                }
                let meta = MessageMeta {
                    from: received.from,
                    stamp: received.envelope.stamp,
                };
                self.handler
                    .on_receive_message(&received.envelope.message, received.channel, &meta);
            }
            Event::StateChanged { generation, state } => {
                if self.is_stale(generation) {
                    return;
                }
                match state {
                    SessionState::Invalidated { reason } => self.on_invalidated(&reason),
                    other => debug!(save_id = %self.save_id, state = ?other, "session state changed"),
                }
            }
            Event::ParticipantsJoined { generation, joined } => {
                if self.is_stale(generation) {
                    return;
                }
                self.welcome(joined);
            }
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        let stale = self.attachment.is_none() || generation != self.generation;
        if stale {
            debug!(
                save_id = %self.save_id,
                generation,
                current = self.generation,
                "discarding event from a torn-down session"
            );
        }
        stale
    }

    fn activate(&mut self, activity: GroupActivity) {
        self.activations += 1;
        if self.phase == Phase::Idle {
            self.phase = Phase::Activating;
        }
        info!(save_id = %activity.save_id, file = %activity.file, "activating session");

        let pending = self.activator.activate(activity.clone());
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = pending.await;
            let _ = mailbox
                .send(Mail::Event(Event::ActivationFinished { activity, result }))
                .await;
        });
    }

    fn on_activation_finished(&mut self, activity: GroupActivity, result: Result<(), SyncError>) {
        match result {
            Ok(()) => {
                info!(save_id = %activity.save_id, file = %activity.file, "session activated");
            }
            Err(e) => {
                warn!(
                    save_id = %activity.save_id,
                    file = %activity.file,
                    error = %e,
                    "session activation failed, continuing without a session"
                );
                if self.phase == Phase::Activating {
                    self.phase = Phase::Idle;
                }
            }
        }
    }

    fn join(&mut self, session: Arc<dyn GroupSession>) -> Result<(), SyncError> {
        let activity = session.activity();
        if activity.save_id != self.save_id {
            return Err(SyncError::JoinFailed(format!(
                "session belongs to save {}",
                activity.save_id
            )));
        }
        let Some(coordinator) = session.system_coordinator() else {
            warn!(save_id = %self.save_id, "discovered session has no system coordinator");
            return Err(SyncError::NoSystemCoordinator);
        };

        if let Some(previous) = self.detach() {
            info!(save_id = %self.save_id, "replacing attached session");
            previous.session.leave();
        }

        coordinator.configure(CoordinatorConfig::SHARED_VOLUME);

        let reliable = session
            .open_channel(ChannelKind::Reliable)
            .map_err(into_join_failed)?;
        let best_effort = session
            .open_channel(ChannelKind::BestEffort)
            .map_err(into_join_failed)?;
        let (reliable_tx, reliable_rx) = MessageChannel::new(reliable).into_parts();
        let (best_effort_tx, best_effort_rx) = MessageChannel::new(best_effort).into_parts();

        self.generation += 1;
        let generation = self.generation;
        let token = self.shutdown.child_token();

        let state = session.state();
        // Baseline taken before join() so a participant who lands right after
        // it is diffed against it.
        let mut participants = session.active_participants();
        let previous = participants.borrow_and_update().clone();
        let observers = vec![
            spawn_state_observer(state, self.mailbox.clone(), generation, token.clone()),
            spawn_participant_observer(
                participants,
                previous,
                session.local_participant(),
                self.mailbox.clone(),
                generation,
                token.clone(),
            ),
        ];
        let receive_loops = vec![
            spawn_receive_loop(reliable_rx, self.mailbox.clone(), generation, token.clone()),
            spawn_receive_loop(best_effort_rx, self.mailbox.clone(), generation, token.clone()),
        ];

        info!(
            save_id = %self.save_id,
            file = %activity.file,
            participant = %session.local_participant(),
            generation,
            "joining session"
        );

        self.attachment = Some(Attachment {
            session: session.clone(),
            activity,
            channels: ChannelSet::new(reliable_tx, best_effort_tx),
            token,
            receive_loops,
            observers,
        });
        self.phase = Phase::Joined;

        session.join();
        Ok(())
    }

    /// Cancel and drop the current attachment without reconnecting.
    fn detach(&mut self) -> Option<Attachment> {
        let attachment = self.attachment.take()?;
        attachment.cancel();
        self.generation += 1;
        self.phase = Phase::Idle;
        Some(attachment)
    }

    fn reset(&mut self, activity: GroupActivity) {
        let Some(attachment) = self.detach() else {
            debug!(save_id = %self.save_id, "reset with no attached session, not reconnecting");
            return;
        };
        info!(save_id = %self.save_id, "leaving session");
        attachment.session.leave();
        self.reconnect(activity);
    }

    fn on_invalidated(&mut self, reason: &str) {
        let Some(attachment) = self.detach() else {
            return;
        };
        info!(save_id = %self.save_id, reason, "session invalidated");
        self.reconnect(attachment.activity);
    }

    fn reconnect(&mut self, activity: GroupActivity) {
        self.resets += 1;
        self.activate(activity);
    }

    fn welcome(&mut self, joined: BTreeSet<ParticipantId>) {
        info!(
            save_id = %self.save_id,
            count = joined.len(),
            "sending welcome to new participants"
        );
        let envelope = self.handler.welcome_envelope();
        self.send(ChannelKind::Reliable, &envelope, &Recipients::Only(joined));
        self.welcomes_sent += 1;
    }

    fn send(&mut self, kind: ChannelKind, envelope: &Envelope, to: &Recipients) {
        let Some(attachment) = &self.attachment else {
            debug!(save_id = %self.save_id, %kind, "no session attached, dropping outbound message");
            return;
        };
        if let Err(e) = attachment.channels.get(kind).send(envelope, to) {
            self.send_failures += 1;
            warn!(save_id = %self.save_id, %kind, error = %e, "send failed");
        }
    }

    fn stats(&self) -> ControllerStats {
        let (open_channels, receive_loops, observers) = match &self.attachment {
            Some(a) => (a.channels.len(), a.receive_loops.len(), a.observers.len()),
            None => (0, 0, 0),
        };
        ControllerStats {
            save_id: self.save_id,
            phase: self.phase,
            open_channels,
            receive_loops,
            observers,
            activations: self.activations,
            resets: self.resets,
            welcomes_sent: self.welcomes_sent,
            send_failures: self.send_failures,
            generation: self.generation,
        }
    }
}

fn into_join_failed(err: SyncError) -> SyncError {
    match err {
        SyncError::JoinFailed(_) => err,
        other => SyncError::JoinFailed(other.to_string()),
    }
}

fn spawn_receive_loop(
    mut receiver: ChannelReceiver,
    mailbox: mpsc::Sender<Mail>,
    generation: u64,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = receiver.kind();
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(received) => received,
                    None => {
                        debug!(channel = %kind, generation, "channel closed");
                        break;
                    }
                },
            };
            let event = Event::Received {
                generation,
                received,
            };
            if mailbox.send(Mail::Event(event)).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_state_observer(
    mut state: watch::Receiver<SessionState>,
    mailbox: mpsc::Sender<Mail>,
    generation: u64,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut current = state.borrow_and_update().clone();
        loop {
            if current.is_invalidated() {
                let event = Event::StateChanged {
                    generation,
                    state: current,
                };
                let _ = mailbox.send(Mail::Event(event)).await;
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            current = state.borrow_and_update().clone();
            if !current.is_invalidated() {
                let event = Event::StateChanged {
                    generation,
                    state: current.clone(),
                };
                if mailbox.send(Mail::Event(event)).await.is_err() {
                    break;
                }
            }
        }
    })
}

fn spawn_participant_observer(
    mut participants: watch::Receiver<BTreeSet<ParticipantId>>,
    mut previous: BTreeSet<ParticipantId>,
    local: ParticipantId,
    mailbox: mpsc::Sender<Mail>,
    generation: u64,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = participants.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let current = participants.borrow_and_update().clone();
            let joined: BTreeSet<ParticipantId> = current
                .difference(&previous)
                .filter(|p| **p != local)
                .copied()
                .collect();
            previous = current;
            if joined.is_empty() {
                continue;
            }
            let event = Event::ParticipantsJoined { generation, joined };
            if mailbox.send(Mail::Event(event)).await.is_err() {
                break;
            }
        }
    })
}
