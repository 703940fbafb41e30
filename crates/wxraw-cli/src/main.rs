use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wxraw_ingest::{build_scheduler, AppConfig, RunParams, Services};
use wxraw_web::{app, function_app, serve, AppState};

#[derive(Debug, Parser)]
#[command(name = "wxraw")]
#[command(about = "Raw weather history ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured location/date once and persist it.
    Job,
    /// Run the HTTP service.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the single-endpoint function host.
    Function {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the job on a cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
    /// Print the upstream payload without persisting it.
    Fetch {
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        date: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("WXRAW_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is the normal case in deployed environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Job)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("wxraw failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    info!(sink = config.sink.backend.as_str(), "configuration loaded");

    match command {
        Commands::Job => {
            let services = Services::from_config(config).await?;
            let report = services.direct.run(&RunParams::default()).await?;
            println!("{}", report.to_json("success"));
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            let services = Services::from_config(config).await?;
            serve(app(AppState::new(services)), port).await?;
        }
        Commands::Function { port } => {
            let port = port.unwrap_or(config.server.port);
            let services = Services::from_config(config).await?;
            serve(function_app(AppState::new(services)), port).await?;
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.schedule_cron.clone());
            let services = Services::from_config(config).await?;
            let mut sched = build_scheduler(Arc::clone(&services.direct), &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Fetch { location, date } => {
            let services = Services::from_config(config).await?;
            let (_request, payload) = services
                .direct
                .fetch_only(&RunParams::new(location, date))
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("encoding payload")?
            );
        }
    }
    Ok(())
}
