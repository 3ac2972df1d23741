//! Applier CLI - automatic proposal submission
//!
//! Usage:
//!   applier init [path]            Write default configuration
//!   applier connect <session-id>   Join an existing session
//!   applier start                  Create a new session and join it
//!   applier resume                 Rejoin the stored session
//!
//! Long-running commands drive a Chrome instance and read control commands
//! from stdin: `status`, `confirm-login`, `disconnect`, `quit`.

use anyhow::{bail, Context, Result};
use applier_agent::InProcessTabs;
use applier_browser::BrowserSession;
use applier_controller::{Controller, Dispatcher, HttpSessionApi, SessionTransport, WebSocketConnector};
use applier_core::{ApplierConfig, ControlCommand, ControlResponse, JsonFileStore, TabHost};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "applier")]
#[command(author, version, about = "Automatic job proposal submission")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to .applier/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Attach to a Chrome already listening on this debugging port
    #[arg(long, global = true, value_name = "PORT")]
    chrome_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Project path (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Join an existing session
    Connect {
        /// Session id handed out by the job source
        session_id: String,
    },

    /// Create a new session on the job source and join it
    Start,

    /// Rejoin the session stored by a previous run
    Resume,
}

/// How the controller joins a session once it is running
enum Startup {
    Connect(String),
    Start,
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let startup = match cli.command {
        Commands::Init { path } => return cmd_init(&path),
        Commands::Connect { session_id } => Startup::Connect(session_id),
        Commands::Start => Startup::Start,
        Commands::Resume => Startup::Resume,
    };

    let root = std::env::current_dir().context("Failed to read current directory")?;
    let config = match &cli.config {
        Some(path) => ApplierConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ApplierConfig::load_or_default(&root).context("Failed to load config")?,
    };

    cmd_run(config, &root, cli.chrome_port, startup).await
}

fn cmd_init(path: &Path) -> Result<()> {
    ApplierConfig::write_default(path).context("Failed to write default config")?;
    println!("Initialized Applier in {:?}", path);
    println!("Created:");
    println!("  .applier/config.toml");
    Ok(())
}

async fn cmd_run(
    config: ApplierConfig,
    root: &Path,
    chrome_port: Option<u16>,
    startup: Startup,
) -> Result<()> {
    let browser = match chrome_port {
        Some(port) => BrowserSession::connect(port, config.browser.clone())
            .with_context(|| format!("Failed to attach to Chrome on port {}", port))?,
        None => BrowserSession::launch(config.browser.clone()).context("Failed to launch Chrome")?,
    };

    let (reporter, reports) = mpsc::unbounded_channel();
    let tabs = Arc::new(InProcessTabs::new(Arc::new(browser), &config, reporter)?);
    tabs.create_tab(&config.site.home_url)
        .await
        .with_context(|| format!("Failed to open {}", config.site.home_url))?;

    let store = JsonFileStore::open(root.join(".applier/state.json"))
        .await
        .context("Failed to open state store")?;
    let (transport, events) = SessionTransport::new(
        Arc::new(WebSocketConnector::new()),
        config.ws_base_url(),
        &config.transport,
    );
    let dispatcher = Dispatcher::new(tabs.clone(), &config);
    let api = Arc::new(HttpSessionApi::from_config(&config.server));
    let controller = Controller::new(config, transport, dispatcher, Arc::new(store), api)?;
    tokio::spawn(Arc::clone(&controller).run(events, reports));

    match startup {
        Startup::Connect(session_id) => {
            print_response(
                &controller
                    .handle_control(ControlCommand::ConnectToSession { session_id })
                    .await,
            )?;
        }
        Startup::Start => {
            print_response(&controller.handle_control(ControlCommand::StartSession).await)?;
        }
        Startup::Resume => {
            if !controller.resume_from_store().await? {
                bail!("No stored session to resume; use `applier connect <session-id>` or `applier start`");
            }
        }
    }

    control_loop(&controller).await?;
    info!("Shutting down");
    Ok(())
}

/// Read control commands from stdin until `quit`, `disconnect`, EOF or Ctrl-C
async fn control_loop(controller: &Controller) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Commands: status, confirm-login, disconnect, quit");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    // Keep serving when stdin is closed (e.g. running detached)
                    tokio::signal::ctrl_c().await?;
                    controller.transport().disconnect();
                    return Ok(());
                };
                match line.trim() {
                    "" => {}
                    "status" => {
                        print_response(&controller.handle_control(ControlCommand::GetStatus).await)?
                    }
                    "confirm-login" => print_response(
                        &controller
                            .handle_control(ControlCommand::ConfirmLogin { session_id: None })
                            .await,
                    )?,
                    "disconnect" => {
                        print_response(&controller.handle_control(ControlCommand::Disconnect).await)?;
                        return Ok(());
                    }
                    "quit" | "exit" => {
                        controller.transport().disconnect();
                        return Ok(());
                    }
                    other => warn!("Unknown command '{}'", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // The stored session stays available for `applier resume`
                controller.transport().disconnect();
                return Ok(());
            }
        }
    }
}

fn print_response(response: &ControlResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
