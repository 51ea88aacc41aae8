use clap::{CommandFactory, Parser, Subcommand};
use helpdock::config::Config;
use helpdock::{db, logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "helpdock", version = VERSION, about = "Visitor session engine for the HelpDock support widget")]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the session engine (HTTP API, presence sockets, sweeper)
    Start,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(MainCommand::Start) => {}
        Some(MainCommand::Version) => {
            println!("helpdock {VERSION}");
            return Ok(());
        }
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    }

    logging::init_console_logging();

    let config = Config::load()?;
    info!("Starting HelpDock session engine...");

    let database = db::Database::new(&config.data_dir)?;
    runtime::run(config, database).await
}
