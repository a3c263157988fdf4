//! Window and immersive-space visibility.
//!
//! The platform window manager is reached through [`PresentationGateway`].
//! [`WindowManager`] keeps the local visibility flags and the active SaveId,
//! and rolls a flag back when an immersive space fails to open.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::record::SaveId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViewId {
    MainWindow,
    Volume,
    ImmersiveSpace,
}

impl ViewId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainWindow => "MainWindow",
            Self::Volume => "Volume",
            Self::ImmersiveSpace => "ImmersiveSpace",
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the platform to open an immersive space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmersiveOutcome {
    Opened,
    Error,
    UserCancelled,
}

/// Platform window manager.
pub trait PresentationGateway: Send + Sync {
    fn show_window(&self, id: ViewId);
    fn hide_window(&self, id: ViewId);
    fn show_immersive_space(&self, id: ViewId) -> BoxFuture<'static, ImmersiveOutcome>;
    fn hide_immersive_space(&self, id: ViewId) -> BoxFuture<'static, ()>;
}

/// Visibility flags plus the SaveId the visible content belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRegister {
    pub active_save_id: Option<SaveId>,
    pub open_windows: BTreeMap<ViewId, bool>,
}

impl Default for WindowRegister {
    fn default() -> Self {
        Self {
            active_save_id: None,
            open_windows: BTreeMap::from([(ViewId::MainWindow, true)]),
        }
    }
}

impl WindowRegister {
    pub fn is_open(&self, id: ViewId) -> bool {
        self.open_windows.get(&id).copied().unwrap_or(false)
    }
}

pub struct WindowManager {
    gateway: Arc<dyn PresentationGateway>,
    register: Mutex<WindowRegister>,
}

impl WindowManager {
    pub fn new(gateway: Arc<dyn PresentationGateway>) -> Self {
        Self {
            gateway,
            register: Mutex::new(WindowRegister::default()),
        }
    }

    pub fn snapshot(&self) -> WindowRegister {
        self.with_register(|r| r.clone())
    }

    pub fn is_open(&self, id: ViewId) -> bool {
        self.with_register(|r| r.is_open(id))
    }

    pub fn active_save_id(&self) -> Option<SaveId> {
        self.with_register(|r| r.active_save_id)
    }

    /// Show the shared volume for a session that was just joined.
    pub fn show_volume(&self, save_id: SaveId) {
        self.with_register(|r| {
            r.open_windows.insert(ViewId::Volume, true);
            r.active_save_id = Some(save_id);
        });
        self.gateway.show_window(ViewId::Volume);
    }

    /// Close `id` if open, open it otherwise. Returns the new visibility.
    pub async fn toggle(&self, id: ViewId, save_id: SaveId) -> Result<bool, SyncError> {
        if self.is_open(id) {
            if id == ViewId::ImmersiveSpace {
                self.gateway.hide_immersive_space(id).await;
            } else {
                self.gateway.hide_window(id);
            }
            self.set_open(id, false);
            info!(view = %id, "closed view");
            return Ok(false);
        }

        self.with_register(|r| {
            r.open_windows.insert(id, true);
            r.active_save_id = Some(save_id);
        });

        if id != ViewId::ImmersiveSpace {
            self.gateway.show_window(id);
            info!(view = %id, %save_id, "opened view");
            return Ok(true);
        }

        match self.gateway.show_immersive_space(id).await {
            ImmersiveOutcome::Opened => {
                info!(view = %id, %save_id, "opened immersive space");
                Ok(true)
            }
            outcome => {
                self.set_open(id, false);
                warn!(view = %id, ?outcome, "failed to open immersive space");
                Err(SyncError::PresentationFailed(format!(
                    "immersive space not opened: {outcome:?}"
                )))
            }
        }
    }

    fn set_open(&self, id: ViewId, open: bool) {
        self.with_register(|r| {
            r.open_windows.insert(id, open);
        });
    }

    fn with_register<T>(&self, f: impl FnOnce(&mut WindowRegister) -> T) -> T {
        f(&mut self.register.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
