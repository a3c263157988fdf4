use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sync_cli::{DemoOptions, DemoPaths, run_demo};

#[derive(Parser)]
#[command(name = "sync-demo")]
#[command(about = "Run a simulated shared session and print what every participant ends up with")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding sync.toml (default: ~/.session-sync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Form a loopback group, apply edits and print the resulting records as JSON
    Run(RunArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Participants in the group, host included (default from config)
    #[arg(short = 'n', long)]
    participants: Option<usize>,

    /// File the host starts the session with
    #[arg(long, default_value = "scene.usdz")]
    file: String,

    /// Welcome message the host publishes once the group formed
    #[arg(long)]
    welcome: Option<String>,

    /// File the last participant switches to
    #[arg(long)]
    update: Option<String>,

    /// End the session once and let everyone reconnect
    #[arg(long)]
    invalidate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "session_sync=debug,sync_demo=debug,sync_cli=debug,info"
    } else {
        "session_sync=info,sync_demo=info,sync_cli=info,warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let paths = DemoPaths::new(cli.data_dir)?;
    let config = paths.load()?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run(args) => {
            let options = DemoOptions {
                participants: args.participants.unwrap_or(config.demo.participants),
                file: args.file,
                welcome: args.welcome,
                update: args.update,
                invalidate: args.invalidate,
                settle_timeout: Duration::from_millis(config.demo.settle_timeout_ms),
            };
            let report = run_demo(&config.session, &options).await?;
            info!(
                save_id = %report.save_id,
                converged = report.converged,
                sessions = report.sessions_created,
                "demo finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.converged {
                anyhow::bail!("participants did not converge");
            }
        }
    }

    Ok(())
}
