//! `nexus` command line entry point

use std::path::PathBuf;
use std::time::Duration;

use actors::ActorRegistry;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use nexus::{init_logging, ControlServer, LogPublisher, Nexus, ServerPorts};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nexus", author, version, about = "Run actor pipelines", long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, env = "NEXUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline headless until Ctrl-C or the duration elapses
    Run(RunArgs),
    /// Run a pipeline behind the remote control channel
    Server(ServerArgs),
    /// Interactive controller for a running server
    Client(ClientArgs),
    /// Actor process entry
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline configuration file
    config: PathBuf,

    /// Object store capacity in bytes, overrides the configuration
    #[arg(long, env = "NEXUS_STORE_SIZE")]
    store_size: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Pipeline configuration file
    config: PathBuf,

    #[arg(long, env = "NEXUS_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Control socket port
    #[arg(short, long, env = "NEXUS_CONTROL_PORT", default_value_t = 5555)]
    control: u16,

    /// Output socket port
    #[arg(short, long, env = "NEXUS_OUTPUT_PORT", default_value_t = 5556)]
    output: u16,

    /// Logging socket port
    #[arg(short, long, env = "NEXUS_LOGGING_PORT", default_value_t = 5557)]
    logging: u16,

    /// Also write logs to this file
    #[arg(short = 'f', long, env = "NEXUS_LOG_FILE")]
    logfile: Option<PathBuf>,

    /// Object store capacity in bytes, overrides the configuration
    #[arg(long, env = "NEXUS_STORE_SIZE")]
    store_size: Option<u64>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[arg(long, env = "NEXUS_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Control socket port
    #[arg(short, long, env = "NEXUS_CONTROL_PORT", default_value_t = 5555)]
    control: u16,

    /// Output socket port
    #[arg(short, long, env = "NEXUS_OUTPUT_PORT", default_value_t = 5556)]
    output: u16,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Worker manifest written by the supervisor
    #[arg(long)]
    manifest: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args, &cli.log_level),
        Command::Server(args) => server(args, &cli.log_level),
        Command::Client(args) => client(args),
        Command::Worker(args) => worker(args, &cli.log_level),
    }
}

fn run(args: RunArgs, log_level: &str) -> anyhow::Result<()> {
    let _log_guard = init_logging(log_level, None, None)?;

    let mut nexus = Nexus::new("Nexus", ActorRegistry::with_samples());
    nexus
        .create_from_file(&args.config, args.store_size)
        .with_context(|| format!("failed to create pipeline from {:?}", args.config))?;
    nexus.start().context("failed to start pipeline")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let deadline = async {
            match args.duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = &mut deadline => {
                    info!("Run duration elapsed");
                    break;
                }
                _ = ticker.tick() => {
                    nexus.poll();
                }
            }
        }
    });

    info!(status = %nexus.status(), "Shutting down");
    nexus.destroy().context("failed to shut down pipeline")?;
    Ok(())
}

fn server(args: ServerArgs, log_level: &str) -> anyhow::Result<()> {
    let publisher = LogPublisher::new();
    let _log_guard = init_logging(log_level, args.logfile.as_deref(), Some(publisher.clone()))?;

    let mut nexus = Nexus::new("Nexus", ActorRegistry::with_samples());
    nexus
        .create_from_file(&args.config, args.store_size)
        .with_context(|| format!("failed to create pipeline from {:?}", args.config))?;
    nexus.launch().context("failed to launch workers")?;

    let ports = ServerPorts {
        control: args.control,
        output: args.output,
        logging: args.logging,
    };
    let runtime = tokio::runtime::Runtime::new().context("failed to build runtime")?;
    runtime.block_on(async {
        let server = ControlServer::bind(&args.host, ports, publisher.sender())
            .await
            .context("failed to bind control sockets")?;
        server.run(nexus).await.context("control server failed")
    })
}

fn client(args: ClientArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let control = format!("{}:{}", args.host, args.control);
    let output = format!("{}:{}", args.host, args.output);
    runtime.block_on(nexus::client::run_client(&control, Some(&output)))
}

/// Runs without a tokio runtime: async actors bring their own.
fn worker(args: WorkerArgs, log_level: &str) -> anyhow::Result<()> {
    let _log_guard = init_logging(log_level, None, None)?;
    let outcome = nexus::run_worker(&args.manifest, &ActorRegistry::with_samples())
        .with_context(|| format!("worker failed for manifest {:?}", args.manifest))?;
    info!(steps = outcome.steps, failed = outcome.failed, "Worker exiting");
    Ok(())
}
