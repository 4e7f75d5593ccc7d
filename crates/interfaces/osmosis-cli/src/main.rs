use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use osmosis_cli::{commands, CliConflictPolicy, CliDeletedPolicy};
use osmosis_engine::SyncStatus;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Directory holding the mapping store (defaults to the platform data dir)
    #[arg(long, global = true, env = "OSMOSIS_STATE_DIR")]
    state_dir: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync pass from a source folder into one or more sink folders
    Sync {
        source: Utf8PathBuf,
        #[arg(required = true)]
        sinks: Vec<Utf8PathBuf>,
        #[arg(long, help = "Propagate changes in both directions")]
        two_way: bool,
        #[arg(long, help = "Show what the pass would do, transferring nothing")]
        dry_run: bool,
        #[arg(long, value_enum, default_value_t = CliConflictPolicy::Skip)]
        conflict: CliConflictPolicy,
        #[arg(long, value_enum, default_value_t = CliDeletedPolicy::Skip)]
        deleted: CliDeletedPolicy,
        #[arg(long, help = "Abort the pass after this many seconds")]
        timeout_secs: Option<u64>,
        #[arg(long, help = "Abort the pass after this many item failures")]
        max_item_errors: Option<usize>,
    },
    /// Preview what a sync pass would do, transferring nothing
    Status {
        source: Utf8PathBuf,
        #[arg(required = true)]
        sinks: Vec<Utf8PathBuf>,
        #[arg(long)]
        two_way: bool,
        #[arg(long)]
        json: bool,
    },
    /// Inspect persisted mappings (all pairs, or one pair's rows)
    Mappings {
        #[arg(long, requires = "sink")]
        source: Option<Utf8PathBuf>,
        #[arg(long, requires = "source")]
        sink: Option<Utf8PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Drop a pair's mappings so the next sync starts from scratch
    Reset {
        source: Utf8PathBuf,
        sink: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("default subscriber");

    match cli.command {
        Commands::Sync {
            source,
            sinks,
            two_way,
            dry_run,
            conflict,
            deleted,
            timeout_secs,
            max_item_errors,
        } => {
            if dry_run {
                commands::cmd_status(source, sinks, two_way, false, cli.state_dir).await?;
                return Ok(());
            }
            let report = commands::cmd_sync(
                source,
                sinks,
                two_way,
                conflict,
                deleted,
                timeout_secs,
                max_item_errors,
                cli.state_dir,
            )
            .await?;
            match report.status {
                SyncStatus::Aborted => anyhow::bail!("sync aborted"),
                SyncStatus::Error => anyhow::bail!("sync finished with errors"),
                _ => {}
            }
        }
        Commands::Status {
            source,
            sinks,
            two_way,
            json,
        } => {
            commands::cmd_status(source, sinks, two_way, json, cli.state_dir).await?;
        }
        Commands::Mappings { source, sink, json } => {
            commands::cmd_mappings(source, sink, json, cli.state_dir)?;
        }
        Commands::Reset { source, sink } => {
            commands::cmd_reset(source, sink, cli.state_dir)?;
        }
    }

    Ok(())
}
