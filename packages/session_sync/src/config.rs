use serde::{Deserialize, Serialize};

/// Tunables for the synchronization core.
///
/// Every field has a serde default, so a partial `sync.toml` (or none at all)
/// deserializes cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seeded into a record's empty welcome message when a session is started.
    #[serde(default = "default_welcome_message")]
    pub default_welcome_message: String,
    /// Title advertised with every activity.
    #[serde(default = "default_activity_title")]
    pub activity_title: String,
    /// Scene content the activity is associated with.
    #[serde(default = "default_content_id")]
    pub content_id: String,
    /// Capacity of each controller's mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Per-participant queue length of best-effort loopback channels.
    #[serde(default = "default_best_effort_capacity")]
    pub best_effort_capacity: usize,
    /// Capacity of the record change broadcast.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_welcome_message: default_welcome_message(),
            activity_title: default_activity_title(),
            content_id: default_content_id(),
            mailbox_capacity: default_mailbox_capacity(),
            best_effort_capacity: default_best_effort_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_welcome_message() -> String {
    "Welcome to the Group Activity!".to_string()
}
fn default_activity_title() -> String {
    "Let's Play Together".to_string()
}
fn default_content_id() -> String {
    "shareplay-test-volume".to_string()
}
fn default_mailbox_capacity() -> usize {
    64
}
fn default_best_effort_capacity() -> usize {
    32
}
fn default_event_capacity() -> usize {
    256
}
