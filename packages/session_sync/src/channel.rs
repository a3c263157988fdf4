//! Typed message channels over a group session.
//!
//! The group service hands out [`RawChannel`]s that move opaque frames. This
//! module layers the envelope codec on top: sends are at-most-once with no
//! acknowledgment, and inbound frames that fail to decode are dropped here so
//! the controller only ever sees well-formed messages.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SyncError;
use crate::message::{Envelope, decode_envelope, encode_envelope};
use crate::record::ParticipantId;

/// Delivery guarantee of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Ordered and reliable. Use for anything that must arrive.
    Reliable,
    /// Low latency, may drop. Use for fast, superseded updates.
    BestEffort,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Reliable, ChannelKind::BestEffort];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reliable => "reliable",
            Self::BestEffort => "best_effort",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a frame is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every other participant in the session.
    All,
    /// Only these participants.
    Only(BTreeSet<ParticipantId>),
}

impl Recipients {
    pub fn includes(&self, participant: &ParticipantId) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(participant),
        }
    }
}

impl From<Option<BTreeSet<ParticipantId>>> for Recipients {
    fn from(to: Option<BTreeSet<ParticipantId>>) -> Self {
        match to {
            Some(set) => Recipients::Only(set),
            None => Recipients::All,
        }
    }
}

/// Outbound half provided by the group service.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, to: &Recipients, payload: Vec<u8>) -> Result<(), SyncError>;

    /// Whether the transport still accepts frames on this channel.
    fn is_open(&self) -> bool {
        true
    }
}

/// A frame received from another participant.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: ParticipantId,
    pub payload: Vec<u8>,
}

/// Untyped channel as handed out by the group service.
pub struct RawChannel {
    pub kind: ChannelKind,
    pub sink: Arc<dyn FrameSink>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// A decoded inbound message with out-of-band sender metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub envelope: Envelope,
    pub from: ParticipantId,
    pub channel: ChannelKind,
}

/// Typed channel: envelope codec over a [`RawChannel`].
pub struct MessageChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl MessageChannel {
    pub fn new(raw: RawChannel) -> Self {
        Self {
            sender: ChannelSender {
                kind: raw.kind,
                sink: raw.sink,
            },
            receiver: ChannelReceiver {
                kind: raw.kind,
                inbound: raw.inbound,
            },
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.sender.kind
    }

    pub fn send(&self, envelope: &Envelope, to: &Recipients) -> Result<(), SyncError> {
        self.sender.send(envelope, to)
    }

    pub fn into_parts(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half; cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    kind: ChannelKind,
    sink: Arc<dyn FrameSink>,
}

impl ChannelSender {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn send(&self, envelope: &Envelope, to: &Recipients) -> Result<(), SyncError> {
        let payload = encode_envelope(envelope)?;
        self.sink.send_frame(to, payload)
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Receiving half. Yields messages until the channel is torn down.
pub struct ChannelReceiver {
    kind: ChannelKind,
    inbound: mpsc::Receiver<InboundFrame>,
}

impl ChannelReceiver {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Next decodable message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Received> {
        while let Some(frame) = self.inbound.recv().await {
            match decode_envelope(&frame.payload) {
                Ok(Some(envelope)) => {
                    return Some(Received {
                        envelope,
                        from: frame.from,
                        channel: self.kind,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(channel = %self.kind, from = %frame.from, error = %e, "dropping undecodable frame");
                    continue;
                }
            }
        }
        None
    }
}

/// The two channels of a joined session.
#[derive(Clone, Debug)]
pub struct ChannelSet {
    reliable: ChannelSender,
    best_effort: ChannelSender,
}

impl ChannelSet {
    pub fn new(reliable: ChannelSender, best_effort: ChannelSender) -> Self {
        Self {
            reliable,
            best_effort,
        }
    }

    pub fn get(&self, kind: ChannelKind) -> &ChannelSender {
        match kind {
            ChannelKind::Reliable => &self.reliable,
            ChannelKind::BestEffort => &self.best_effort,
        }
    }

    /// Channels in the set whose transport is still open.
    pub fn len(&self) -> usize {
        ChannelKind::ALL
            .iter()
            .filter(|kind| self.get(**kind).is_open())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SyncMessage;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<(Recipients, Vec<u8>)>>,
        closed: AtomicBool,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, to: &Recipients, payload: Vec<u8>) -> Result<(), SyncError> {
            self.frames.lock().unwrap().push((to.clone(), payload));
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    fn raw(kind: ChannelKind) -> (RawChannel, Arc<RecordingSink>, mpsc::Sender<InboundFrame>) {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let raw = RawChannel {
            kind,
            sink: sink.clone(),
            inbound: rx,
        };
        (raw, sink, tx)
    }

    #[test]
    fn recipients_from_option() {
        assert_eq!(Recipients::from(None), Recipients::All);
        let a = ParticipantId::new();
        let only = Recipients::from(Some(BTreeSet::from([a])));
        assert!(only.includes(&a));
        assert!(!only.includes(&ParticipantId::new()));
    }

    #[test]
    fn send_encodes_envelope() {
        let (raw, sink, _tx) = raw(ChannelKind::Reliable);
        let channel = MessageChannel::new(raw);
        let env = Envelope::new(SyncMessage::Update { file: "x".into() });
        channel.send(&env, &Recipients::All).unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, Recipients::All);
        assert_eq!(decode_envelope(&frames[0].1).unwrap(), Some(env));
    }

    #[tokio::test]
    async fn recv_skips_undecodable_frames() {
        let (raw, _sink, tx) = raw(ChannelKind::BestEffort);
        let (_sender, mut receiver) = MessageChannel::new(raw).into_parts();
        let from = ParticipantId::new();
        let env = Envelope::new(SyncMessage::WelcomeParticipant {
            welcome_message: "hi".into(),
        });

        tx.send(InboundFrame {
            from,
            payload: b"garbage".to_vec(),
        })
        .await
        .unwrap();
        tx.send(InboundFrame {
            from,
            payload: encode_envelope(&env).unwrap(),
        })
        .await
        .unwrap();
        drop(tx);

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.envelope, env);
        assert_eq!(received.from, from);
        assert_eq!(received.channel, ChannelKind::BestEffort);
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn channel_set_counts_only_open_transports() {
        let (reliable, reliable_sink, _r) = raw(ChannelKind::Reliable);
        let (best_effort, best_effort_sink, _b) = raw(ChannelKind::BestEffort);
        let set = ChannelSet::new(
            MessageChannel::new(reliable).into_parts().0,
            MessageChannel::new(best_effort).into_parts().0,
        );
        assert_eq!(set.len(), 2);

        best_effort_sink.closed.store(true, Ordering::SeqCst);
        assert_eq!(set.len(), 1);
        assert!(!set.get(ChannelKind::BestEffort).is_open());
        assert!(set.get(ChannelKind::Reliable).is_open());

        reliable_sink.closed.store(true, Ordering::SeqCst);
        assert!(set.is_empty());
    }
}
