//! Session Sync - group session lifecycle and shared record synchronization
//!
//! Keeps a small shared record (`file`, `welcome_message`) consistent across
//! the participants of an ad-hoc group session. The platform pieces (session
//! discovery and activation, the system coordinator, the window manager) are
//! traits; [`loopback`] provides an in-process implementation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_sync::{LoopbackHub, SaveId, SyncConfig, SyncRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let hub = LoopbackHub::new(config.best_effort_capacity);
//!     let member = hub.add_member();
//!
//!     let registry = Arc::new(SyncRegistry::new(
//!         config,
//!         member.participant,
//!         member.activator.clone(),
//!     ));
//!     tokio::spawn({
//!         let registry = registry.clone();
//!         async move { registry.run_discovery(member.feed).await }
//!     });
//!
//!     let save_id = SaveId::new();
//!     registry.start_session(save_id, "scene.usdz").await.unwrap();
//!     registry.set_file(save_id, "other.usdz").await.unwrap();
//!
//!     let mut events = registry.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {:?}", event.save_id, event.record);
//!     }
//! }
//! ```

pub mod channel;
mod config;
pub mod controller;
mod error;
pub mod handler;
pub mod loopback;
pub mod message;
pub mod presentation;
pub mod record;
mod registry;
pub mod session;

pub use channel::{ChannelKind, Recipients};
pub use config::SyncConfig;
pub use controller::{ControllerStats, Phase, SessionController};
pub use error::SyncError;
pub use handler::{MessageMeta, RecordHandler, SyncHandler};
pub use loopback::{LoopbackHub, LoopbackMember};
pub use message::{Envelope, SyncMessage};
pub use presentation::{ImmersiveOutcome, PresentationGateway, ViewId, WindowManager};
pub use record::{ChangeOrigin, ParticipantId, RecordEvent, SaveId, SharedRecord, Stamp};
pub use registry::SyncRegistry;
pub use session::{GroupActivity, GroupSession, SessionActivator, SessionState};
