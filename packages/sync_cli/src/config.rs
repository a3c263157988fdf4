use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use session_sync::SyncConfig;
use tracing::info;

/// Settings of the loopback demo itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Participants in the simulated group, host included.
    #[serde(default = "default_participants")]
    pub participants: usize,
    /// How long to wait for replicas to converge before giving up.
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            participants: default_participants(),
            settle_timeout_ms: default_settle_timeout_ms(),
        }
    }
}

fn default_participants() -> usize {
    3
}
fn default_settle_timeout_ms() -> u64 {
    2_000
}

/// Shape of `sync.toml`.
///
/// ```toml
/// [session]
/// default_welcome_message = "Hi!"
///
/// [demo]
/// participants = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub session: SyncConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Layer defaults, `<data_dir>/sync.toml`, then `SYNC_*` environment
/// variables (`__` separates sections, e.g. `SYNC_DEMO__PARTICIPANTS=5`).
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("sync.toml")))
        .merge(Env::prefixed("SYNC_").split("__"))
}

/// Where the demo keeps its files.
#[derive(Debug, Clone)]
pub struct DemoPaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

impl DemoPaths {
    /// Use `custom_dir`, or `~/.session-sync` when none is given, creating it
    /// if needed.
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("could not find home directory"))?
                .join(".session-sync"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            config_path: data_dir.join("sync.toml"),
            data_dir,
        })
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Failed to load {}", self.config_path.display()))
    }
}
