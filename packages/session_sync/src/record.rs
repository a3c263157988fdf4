//! The shared record and the identifiers that scope it.
//!
//! A record is the `(file, welcome_message)` pair kept consistent across the
//! participants of one session. Each field remembers the Lamport stamp of the
//! write that produced it, so a stale value arriving late on the other
//! channel cannot overwrite a newer one.

use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::channel::ChannelKind;
use crate::message::SyncMessage;

/// Identifies one synchronized document/context.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveId(pub Uuid);

impl SaveId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SaveId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SaveId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies one endpoint attached to a session.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let s = self.0.simple().to_string();
        write!(f, "participant-{}", &s[..8])
    }
}

/// Lamport stamp attached to a write. Ordered by clock, then origin.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub origin: ParticipantId,
}

/// Synchronized state for one SaveId.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRecord {
    pub save_id: SaveId,
    pub file: String,
    pub welcome_message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    file_stamp: Option<Stamp>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    welcome_stamp: Option<Stamp>,
    #[serde(default)]
    clock: u64,
}

impl SharedRecord {
    pub fn new(save_id: SaveId, file: impl Into<String>) -> Self {
        Self {
            save_id,
            file: file.into(),
            welcome_message: String::new(),
            file_stamp: None,
            welcome_stamp: None,
            clock: 0,
        }
    }

    pub fn file_stamp(&self) -> Option<Stamp> {
        self.file_stamp
    }

    pub fn welcome_stamp(&self) -> Option<Stamp> {
        self.welcome_stamp
    }

    /// Current value of the local Lamport clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn tick(&mut self, origin: ParticipantId) -> Stamp {
        self.clock += 1;
        Stamp {
            clock: self.clock,
            origin,
        }
    }

    /// Local edit of `file`. Returns the stamp to ship with the update.
    pub fn set_file_local(&mut self, file: impl Into<String>, origin: ParticipantId) -> Stamp {
        let stamp = self.tick(origin);
        self.file = file.into();
        self.file_stamp = Some(stamp);
        stamp
    }

    /// Local edit of `welcome_message`. Returns the stamp to ship with it.
    pub fn set_welcome_local(
        &mut self,
        welcome_message: impl Into<String>,
        origin: ParticipantId,
    ) -> Stamp {
        let stamp = self.tick(origin);
        self.welcome_message = welcome_message.into();
        self.welcome_stamp = Some(stamp);
        stamp
    }

    /// Apply an inbound message. `Update` only touches `file`,
    /// `WelcomeParticipant` only touches `welcome_message`.
    ///
    /// Stamped values older than (or equal to) the field's current stamp are
    /// dropped. Unstamped values apply in arrival order until the field holds
    /// a stamped value, and never replace one. Returns whether the record
    /// changed.
    pub fn apply(&mut self, message: &SyncMessage, stamp: Option<Stamp>) -> bool {
        if let Some(stamp) = stamp {
            self.clock = self.clock.max(stamp.clock);
        }

        let (value, field, current) = match message {
            SyncMessage::Update { file } => (file, &mut self.file, &mut self.file_stamp),
            SyncMessage::WelcomeParticipant { welcome_message } => (
                welcome_message,
                &mut self.welcome_message,
                &mut self.welcome_stamp,
            ),
        };

        match (stamp, *current) {
            (Some(incoming), Some(existing)) if incoming <= existing => return false,
            (None, Some(_)) => return false,
            (Some(_), _) => *current = stamp,
            (None, None) => {}
        }
        if *field == *value {
            return false;
        }
        field.clone_from(value);
        true
    }
}

/// Where a record change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ChangeOrigin {
    Local,
    Remote { channel: ChannelKind },
}

/// Published whenever a record changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordEvent {
    pub save_id: SaveId,
    pub record: SharedRecord,
    pub origin: ChangeOrigin,
}

/// A record plus the notification channel its changes are published on.
pub struct RecordStore {
    record: RwLock<SharedRecord>,
    events: broadcast::Sender<RecordEvent>,
}

impl RecordStore {
    pub fn new(record: SharedRecord, events: broadcast::Sender<RecordEvent>) -> Self {
        Self {
            record: RwLock::new(record),
            events,
        }
    }

    pub fn save_id(&self) -> SaveId {
        self.snapshot().save_id
    }

    pub fn snapshot(&self) -> SharedRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply an inbound message and publish the change, if any.
    pub fn apply_remote(
        &self,
        message: &SyncMessage,
        channel: ChannelKind,
        stamp: Option<Stamp>,
    ) -> bool {
        let snapshot = {
            let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
            if !record.apply(message, stamp) {
                debug!(save_id = %record.save_id, ?channel, "inbound message left record unchanged");
                return false;
            }
            record.clone()
        };
        self.publish(snapshot, ChangeOrigin::Remote { channel });
        true
    }

    /// Run a local edit under the record lock and publish the result.
    pub fn update_local<T>(&self, edit: impl FnOnce(&mut SharedRecord) -> T) -> T {
        let (result, snapshot) = {
            let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
            let result = edit(&mut record);
            (result, record.clone())
        };
        self.publish(snapshot, ChangeOrigin::Local);
        result
    }

    /// Read a value under the record lock.
    pub fn read<T>(&self, f: impl FnOnce(&SharedRecord) -> T) -> T {
        f(&self.record.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, record: SharedRecord, origin: ChangeOrigin) {
        // No subscribers is fine.
        let _ = self.events.send(RecordEvent {
            save_id: record.save_id,
            record,
            origin,
        });
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("record", &self.snapshot())
            .finish()
    }
}
