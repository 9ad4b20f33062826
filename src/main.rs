use anyhow::Result;
use clap::{Parser, Subcommand};
use modforge::{App, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "modforge")]
#[command(author, version = "0.3.2", about = "A CLI mod manager for Factorio")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Mods directory override for this invocation
    #[arg(long)]
    mods_dir: Option<String>,

    /// Answer yes to all confirmation prompts
    #[arg(short = 'y', long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed mods
    List,

    /// Check the portal for available updates
    Sync,

    /// Update a mod, or everything with --all
    Update {
        /// Mod name to update
        name: Option<String>,

        /// Update all mods with known updates
        #[arg(long)]
        all: bool,
    },

    /// Install a mod and its dependencies from the portal
    Install { name: String },

    /// Enable a mod and its disabled dependencies
    Enable { name: String },

    /// Disable a mod
    Disable { name: String },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "modforge=info",
        1 => "modforge=debug",
        2 => "modforge=trace",
        _ => "trace",
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = Config::load().await?;
    if let Some(mods_dir) = cli.mods_dir.as_deref() {
        let trimmed = mods_dir.trim();
        if trimmed.is_empty() {
            anyhow::bail!("--mods-dir cannot be empty");
        }
        config.mods_dir_override = Some(trimmed.to_string());
    }

    let app = App::new(config, cli.yes).await?;

    match cli.command {
        Commands::List => app.cmd_list().await?,
        Commands::Sync => app.cmd_sync().await?,
        Commands::Update { name, all } => match (name, all) {
            (Some(name), false) => app.cmd_update(&name).await?,
            (None, true) => app.cmd_update_all().await?,
            (Some(_), true) => anyhow::bail!("Pass either a mod name or --all, not both"),
            (None, false) => anyhow::bail!("Pass a mod name or --all"),
        },
        Commands::Install { name } => app.cmd_install(&name).await?,
        Commands::Enable { name } => app.cmd_enable(&name).await?,
        Commands::Disable { name } => app.cmd_disable(&name).await?,
    }

    Ok(())
}
