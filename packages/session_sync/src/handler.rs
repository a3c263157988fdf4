//! Inbound message dispatch.

use std::sync::Arc;

use tracing::debug;

use crate::channel::ChannelKind;
use crate::message::{Envelope, SyncMessage};
use crate::record::{ParticipantId, RecordStore, Stamp};

/// Out-of-band metadata of a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageMeta {
    pub from: ParticipantId,
    pub stamp: Option<Stamp>,
}

/// Injected into a controller; called on the controller's task.
pub trait SyncHandler: Send + Sync {
    fn on_receive_message(&self, message: &SyncMessage, channel: ChannelKind, meta: &MessageMeta);

    /// What to send to newly joined participants.
    fn welcome_envelope(&self) -> Envelope;
}

/// Applies inbound messages to a [`RecordStore`].
pub struct RecordHandler {
    store: Arc<RecordStore>,
}

impl RecordHandler {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }
}

impl SyncHandler for RecordHandler {
    fn on_receive_message(&self, message: &SyncMessage, channel: ChannelKind, meta: &MessageMeta) {
        debug!(
            save_id = %self.store.save_id(),
            %channel,
            from = %meta.from,
            kind = message.kind(),
            "applying inbound message"
        );
        self.store.apply_remote(message, channel, meta.stamp);
    }

    fn welcome_envelope(&self) -> Envelope {
        self.store.read(|record| {
            let message = SyncMessage::WelcomeParticipant {
                welcome_message: record.welcome_message.clone(),
            };
            match record.welcome_stamp() {
                Some(stamp) => Envelope::stamped(message, stamp),
                None => Envelope::new(message),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{SaveId, SharedRecord};
    use tokio::sync::broadcast;

    fn handler() -> (RecordHandler, Arc<RecordStore>) {
        let (tx, _rx) = broadcast::channel(8);
        let store = Arc::new(RecordStore::new(SharedRecord::new(SaveId::new(), "start"), tx));
        (RecordHandler::new(store.clone()), store)
    }

    fn meta() -> MessageMeta {
        MessageMeta {
            from: ParticipantId::new(),
            stamp: None,
        }
    }

    #[test]
    fn update_sets_file_only() {
        let (handler, store) = handler();
        store.update_local(|r| r.welcome_message = "keep me".into());

        handler.on_receive_message(
            &SyncMessage::Update {
                file: "a.txt".into(),
            },
            ChannelKind::Reliable,
            &meta(),
        );

        let record = store.snapshot();
        assert_eq!(record.file, "a.txt");
        assert_eq!(record.welcome_message, "keep me");
    }

    #[test]
    fn welcome_sets_welcome_message_only() {
        let (handler, store) = handler();
        handler.on_receive_message(
            &SyncMessage::WelcomeParticipant {
                welcome_message: "hi".into(),
            },
            ChannelKind::BestEffort,
            &meta(),
        );

        let record = store.snapshot();
        assert_eq!(record.welcome_message, "hi");
        assert_eq!(record.file, "start");
    }

    #[test]
    fn welcome_envelope_carries_current_value_and_stamp() {
        let (handler, store) = handler();
        let unstamped = handler.welcome_envelope();
        assert_eq!(unstamped.stamp, None);

        let me = ParticipantId::new();
        let stamp = store.update_local(|r| r.set_welcome_local("hello", me));
        let envelope = handler.welcome_envelope();
        assert_eq!(envelope.stamp, Some(stamp));
        assert_eq!(
            envelope.message,
            SyncMessage::WelcomeParticipant {
                welcome_message: "hello".into()
            }
        );
    }
}
