use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use parcelflow::bootstrap;
use parcelflow::channels::web::{start_server, AppState};
use parcelflow::channels::HttpChannelSender;
use parcelflow::cli::doctor;
use parcelflow::config::Config;
use parcelflow::payments::gateway::HttpPaymentGateway;
use parcelflow::rates::HttpRateProvider;
use parcelflow::runtime::{event_queue, Runtime};

#[derive(Parser)]
#[command(name = "parcelflow", version, about = "Chat-based parcel order intake")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service: webhook server, event workers, background sweeps.
    Serve,
    /// Check configuration and database connectivity, then exit.
    Doctor,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parcelflow=info,tower_http=warn"));
    let json = std::env::var("PARCELFLOW_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::load_env();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Doctor => doctor::run().await,
        Command::Serve => serve().await,
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::resolve()?;

    let store = bootstrap::open_database(&config.database).await?;
    let sender = Arc::new(HttpChannelSender::new(&config.channel)?);
    let rates = Arc::new(HttpRateProvider::new(config.providers.rates_url.clone()));
    let gateway = Arc::new(HttpPaymentGateway::new(config.providers.gateway_url.clone()));

    let services = bootstrap::build_services(&config, store, sender, rates, gateway);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app_state = Arc::new(AppState {
        ledger: Arc::clone(&services.ledger),
        shared_secret: config.webhook.shared_secret.clone(),
    });
    let bound = start_server(config.webhook.bind_addr, app_state, shutdown_rx.clone()).await?;
    tracing::info!(addr = %bound, "webhook server up");

    // The inbound transport adapter (long-poll or channel webhook) pushes
    // events into this queue; it is deployment-specific and lives outside
    // the core. Holding `event_tx` keeps the workers alive either way.
    let (event_tx, event_rx) = event_queue();
    let runtime = Arc::new(Runtime::new(
        Arc::clone(&services.engine),
        Arc::clone(&services.outbound),
        Arc::clone(&services.store),
        config.flow.clone(),
    ));
    let runtime_task = tokio::spawn(runtime.run(event_rx, shutdown_rx));

    tracing::info!(queue_capacity = parcelflow::runtime::EVENT_QUEUE_CAPACITY, "parcelflow serving");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    drop(event_tx);
    let _ = shutdown_tx.send(true);
    runtime_task.await?;
    Ok(())
}
