//! Capabilities the core consumes from the group-communication platform.
//!
//! Everything here is a black box to the controller: a discovery feed of
//! session handles, an activator that advertises new sessions, and the
//! session handle itself with its coordinator and channels.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::channel::{ChannelKind, RawChannel};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::record::{ParticipantId, SaveId};

/// Launch metadata carried by every session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupActivity {
    pub save_id: SaveId,
    pub file: String,
    pub title: String,
    pub content_id: String,
}

impl GroupActivity {
    pub fn new(save_id: SaveId, file: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            save_id,
            file: file.into(),
            title: config.activity_title.clone(),
            content_id: config.content_id.clone(),
        }
    }
}

/// Lifecycle of a session as reported by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Waiting,
    Joined,
    Invalidated { reason: String },
}

impl SessionState {
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmersionStyle {
    Progressive,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialTemplate {
    /// Content in the middle, participants around it.
    Surround,
    SideBySide,
}

/// Configuration applied to a session's system coordinator before joining.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub immersion: ImmersionStyle,
    pub supports_group_immersive_space: bool,
    pub spatial_template: SpatialTemplate,
}

impl CoordinatorConfig {
    /// The one configuration every joined session gets.
    pub const SHARED_VOLUME: CoordinatorConfig = CoordinatorConfig {
        immersion: ImmersionStyle::Progressive,
        supports_group_immersive_space: true,
        spatial_template: SpatialTemplate::Surround,
    };
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::SHARED_VOLUME
    }
}

/// Platform coordinator for spatial placement. `configure` is idempotent.
pub trait SystemCoordinator: Send + Sync {
    fn configure(&self, config: CoordinatorConfig);
}

/// Handle to one discovered group session.
pub trait GroupSession: Send + Sync {
    fn activity(&self) -> GroupActivity;

    fn local_participant(&self) -> ParticipantId;

    /// `None` when the platform offers no coordinator for this session.
    fn system_coordinator(&self) -> Option<Arc<dyn SystemCoordinator>>;

    fn state(&self) -> watch::Receiver<SessionState>;

    /// Participants currently attached, the local one included.
    fn active_participants(&self) -> watch::Receiver<BTreeSet<ParticipantId>>;

    fn open_channel(&self, kind: ChannelKind) -> Result<RawChannel, SyncError>;

    fn join(&self);

    fn leave(&self);
}

/// Creates and advertises a session so other participants can discover it.
pub trait SessionActivator: Send + Sync {
    fn activate(&self, activity: GroupActivity) -> BoxFuture<'static, Result<(), SyncError>>;
}

/// Discovered sessions, delivered one at a time.
pub type DiscoveryFeed = mpsc::Receiver<Arc<dyn GroupSession>>;
