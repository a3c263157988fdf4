//! Simulated group session over the in-process loopback transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::future::BoxFuture;
use serde::Serialize;
use session_sync::{
    ControllerStats, ImmersiveOutcome, LoopbackHub, ParticipantId, PresentationGateway, SaveId,
    SharedRecord, SyncConfig, SyncRegistry, ViewId, WindowManager,
};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the demo should do once everyone has joined.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub participants: usize,
    /// File the host starts the session with.
    pub file: String,
    /// Welcome message the host publishes after the group formed.
    pub welcome: Option<String>,
    /// File the last participant switches to.
    pub update: Option<String>,
    /// End the session once and let everyone reconnect.
    pub invalidate: bool,
    pub settle_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerReport {
    pub participant: ParticipantId,
    pub record: SharedRecord,
    pub stats: ControllerStats,
    pub open_views: Vec<ViewId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub save_id: SaveId,
    pub sessions_created: u64,
    pub converged: bool,
    pub peers: Vec<PeerReport>,
}

/// Presentation gateway that only logs what the platform would show.
struct LoggingGateway {
    participant: ParticipantId,
}

impl PresentationGateway for LoggingGateway {
    fn show_window(&self, id: ViewId) {
        info!(participant = %self.participant, view = %id, "show window");
    }

    fn hide_window(&self, id: ViewId) {
        info!(participant = %self.participant, view = %id, "hide window");
    }

    fn show_immersive_space(&self, id: ViewId) -> BoxFuture<'static, ImmersiveOutcome> {
        info!(participant = %self.participant, view = %id, "show immersive space");
        Box::pin(async { ImmersiveOutcome::Opened })
    }

    fn hide_immersive_space(&self, id: ViewId) -> BoxFuture<'static, ()> {
        info!(participant = %self.participant, view = %id, "hide immersive space");
        Box::pin(async {})
    }
}

struct Peer {
    participant: ParticipantId,
    registry: Arc<SyncRegistry>,
    windows: Arc<WindowManager>,
}

fn spawn_peer(hub: &LoopbackHub, config: &SyncConfig) -> Peer {
    let member = hub.add_member();
    let windows = Arc::new(WindowManager::new(Arc::new(LoggingGateway {
        participant: member.participant,
    })));
    let registry = Arc::new(
        SyncRegistry::new(config.clone(), member.participant, member.activator.clone())
            .with_windows(windows.clone()),
    );
    let discovery = registry.clone();
    let feed = member.feed;
    tokio::spawn(async move { discovery.run_discovery(feed).await });
    Peer {
        participant: member.participant,
        registry,
        windows,
    }
}

/// Poll `check` until it holds or `timeout` passes.
async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

async fn all_match(peers: &[Peer], save_id: SaveId, file: &str, welcome: &str) -> bool {
    for peer in peers {
        match peer.registry.record(save_id).await {
            Some(record) if record.file == file && record.welcome_message == welcome => {}
            _ => return false,
        }
    }
    true
}

/// Form a group of `options.participants`, apply the requested edits and
/// report every replica once they agree (or the settle timeout passes).
pub async fn run_demo(config: &SyncConfig, options: &DemoOptions) -> Result<DemoReport> {
    if options.participants == 0 {
        bail!("the demo needs at least one participant");
    }

    let hub = LoopbackHub::new(config.best_effort_capacity);
    let peers: Vec<Peer> = (0..options.participants)
        .map(|_| spawn_peer(&hub, config))
        .collect();
    let save_id = SaveId::new();
    let expected = options.participants;

    info!(%save_id, participants = expected, file = %options.file, "starting group");
    peers[0]
        .registry
        .start_session(save_id, &options.file)
        .await
        .context("host failed to start the session")?;

    let hub_ref = &hub;
    let formed = wait_until(options.settle_timeout, move || async move {
        hub_ref.participants(save_id).len() == expected
    })
    .await;
    if !formed {
        bail!(
            "only {} of {} participants joined",
            hub.participants(save_id).len(),
            expected
        );
    }

    if let Some(welcome) = &options.welcome {
        peers[0]
            .registry
            .set_welcome_message(save_id, welcome)
            .await?;
    }
    if let Some(file) = &options.update {
        if let Some(last) = peers.last() {
            last.registry.set_file(save_id, file).await?;
        }
    }

    if options.invalidate {
        hub.invalidate(save_id, "ended by demo");
        let rejoined = wait_until(options.settle_timeout, move || async move {
            hub_ref.participants(save_id).len() == expected
        })
        .await;
        if !rejoined {
            warn!(%save_id, "not every participant rejoined after invalidation");
        }
    }

    let file = options.update.as_deref().unwrap_or(&options.file);
    let welcome = options
        .welcome
        .as_deref()
        .unwrap_or(&config.default_welcome_message);
    let peers_ref = &peers;
    let converged = wait_until(options.settle_timeout, move || {
        all_match(peers_ref, save_id, file, welcome)
    })
    .await;
    debug!(%save_id, converged, "settled");

    let mut reports = Vec::with_capacity(peers.len());
    for peer in &peers {
        let record = peer
            .registry
            .record(save_id)
            .await
            .with_context(|| format!("participant {} never prepared the save", peer.participant))?;
        let controller = peer
            .registry
            .controller(save_id)
            .await
            .with_context(|| format!("participant {} has no controller", peer.participant))?;
        let stats = controller.stats().await?;
        let open_views = [ViewId::MainWindow, ViewId::Volume, ViewId::ImmersiveSpace]
            .into_iter()
            .filter(|view| peer.windows.is_open(*view))
            .collect();
        reports.push(PeerReport {
            participant: peer.participant,
            record,
            stats,
            open_views,
        });
    }

    Ok(DemoReport {
        save_id,
        sessions_created: hub.sessions_created(),
        converged,
        peers: reports,
    })
}
