/// # aas-bridge CLI Interface (Module)
///
/// Command parsing and orchestration for the `aas-bridge` binary. All synchronisation,
/// proxying and availability logic lives in [`aas_bridge_core`]; this module only loads
/// configuration, picks a catalog backend and drives the core [`Runtime`].
///
/// ## Commands
/// - `sync`: one foreground cycle per selected environment, report printed to stdout.
///   `--dry-run` mirrors into an in-memory catalog and leaves the on-disk inventory alone.
/// - `run`: long-running mode. Every environment syncs on its own interval; SIGHUP
///   triggers all environments at once; Ctrl-C shuts down gracefully.
/// - `fetch`: proxy one cataloged element to a file or stdout.
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
use crate::load_config::{load_config, CliConfig};
use crate::management::ManagementClient;
use aas_bridge_core::catalog::MemoryCatalog;
use aas_bridge_core::contract::CatalogStore;
use aas_bridge_core::reference::StableId;
use aas_bridge_core::runtime::Runtime;
use aas_bridge_core::synchronise::SynchroniseReport;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// CLI for aas-bridge: mirror AAS repositories into a dataspace connector catalog.
#[derive(Parser)]
#[clap(
    name = "aas-bridge",
    version,
    about = "Synchronise AAS repositories into a dataspace connector catalog and proxy element data"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one synchronisation cycle and print the report
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Only this environment (default: all)
        #[clap(long)]
        environment: Option<String>,
        /// Use an in-memory catalog and inventory instead of the management API
        #[clap(long)]
        dry_run: bool,
    },
    /// Keep every environment synchronised until interrupted
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Stream one cataloged element from its repository
    Fetch {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        #[clap(long)]
        environment: String,
        /// Stable id of the cataloged resource
        #[clap(long)]
        resource: String,
        /// Write here instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

/// Async CLI entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync {
            config,
            environment,
            dry_run,
        } => sync(load_config(config)?, environment, dry_run).await,
        Commands::Run { config } => serve(load_config(config)?).await,
        Commands::Fetch {
            config,
            environment,
            resource,
            output,
        } => fetch(load_config(config)?, &environment, &resource, output).await,
    }
}

fn management_catalog(config: &CliConfig) -> Result<Arc<dyn CatalogStore>> {
    let section = config
        .management
        .as_ref()
        .ok_or_else(|| anyhow!("no management section configured (use --dry-run to sync without one)"))?;
    Ok(Arc::new(ManagementClient::new(section)?))
}

async fn sync(mut config: CliConfig, only: Option<String>, dry_run: bool) -> Result<()> {
    if let Some(name) = &only {
        if config.bridge.environment(name).is_none() {
            bail!("unknown environment {name:?}");
        }
    }
    let catalog: Arc<dyn CatalogStore> = if dry_run {
        for env in config.bridge.environments.iter_mut() {
            env.inventory_path = None;
        }
        tracing::info!(command = "sync", "Dry run: using in-memory catalog and inventory");
        Arc::new(MemoryCatalog::new())
    } else {
        management_catalog(&config)?
    };

    let mut runtime = Runtime::build(&config.bridge, catalog)?;
    let names = match only {
        Some(name) => vec![name],
        None => runtime.environment_names(),
    };

    let mut failed = Vec::new();
    for name in names {
        tracing::info!(command = "sync", environment = %name, "Starting synchronisation cycle");
        let report = runtime.run_once(&name).await?;
        println!("{}", summary(&report));
        for skipped in &report.skipped {
            println!("  skipped {}: {}", skipped.reference, skipped.violations.join("; "));
        }
        for error in &report.errors {
            println!("  error: {error}");
        }
        if !report.is_success() {
            failed.push(name);
        }
    }
    runtime.shutdown().await;

    if !failed.is_empty() {
        bail!("synchronisation did not complete for {}", failed.join(", "));
    }
    tracing::info!(command = "sync", "Synchronisation complete");
    Ok(())
}

fn summary(report: &SynchroniseReport) -> String {
    format!(
        "Synchronised {}: {:?} created={} updated={} deleted={} stale={} revived={} unchanged={} \
         bindings_upserted={} bindings_deleted={} skipped={} duration={:?}",
        report.environment,
        report.outcome,
        report.created,
        report.updated,
        report.deleted,
        report.marked_stale,
        report.revived,
        report.unchanged,
        report.bindings_upserted,
        report.bindings_deleted,
        report.skipped.len(),
        report.duration,
    )
}

enum Signal {
    Trigger,
    Shutdown,
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        let hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .context("installing SIGHUP handler")?;
        Ok(Self { hangup })
    }

    async fn next(&mut self) -> Signal {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => Signal::Shutdown,
            _ = self.hangup.recv() => Signal::Trigger,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Signal {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Shutdown
    }
}

async fn serve(config: CliConfig) -> Result<()> {
    let catalog = management_catalog(&config)?;
    let mut runtime = Runtime::build(&config.bridge, catalog)?;
    let mut signals = Signals::new()?;
    runtime.start();
    tracing::info!(
        command = "run",
        environments = ?runtime.environment_names(),
        "Bridge running; SIGHUP triggers a sync, Ctrl-C stops"
    );

    loop {
        match signals.next().await {
            Signal::Trigger => {
                for (environment, ack) in runtime.trigger_all() {
                    tracing::info!(command = "run", %environment, ?ack, "Manual trigger");
                }
            }
            Signal::Shutdown => break,
        }
    }
    runtime.shutdown().await;
    Ok(())
}

async fn fetch(
    config: CliConfig,
    environment: &str,
    resource: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let env = config
        .bridge
        .environment(environment)
        .ok_or_else(|| anyhow!("unknown environment {environment:?}"))?;
    if env.inventory_path.is_none() {
        bail!("environment {environment:?} has no inventory_path; nothing has been cataloged to fetch");
    }
    let id: StableId = resource
        .parse()
        .with_context(|| format!("invalid resource id {resource:?}"))?;

    let runtime = Runtime::build(&config.bridge, Arc::new(MemoryCatalog::new()))?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = match &output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            let result = transfer(&runtime, environment, &id, &mut file, &cancel).await;
            if result.is_err() {
                let _ = tokio::fs::remove_file(path).await;
            }
            result
        }
        None => transfer(&runtime, environment, &id, &mut tokio::io::stdout(), &cancel).await,
    };
    runtime.shutdown().await;
    result
}

async fn transfer<W>(
    runtime: &Runtime,
    environment: &str,
    id: &StableId,
    sink: &mut W,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let report = runtime
        .fetch(environment, id, sink, cancel)
        .await
        .with_context(|| format!("fetching {id}"))?;
    tracing::info!(
        command = "fetch",
        url = %report.url,
        bytes = report.bytes,
        attempts = report.attempts,
        content_type = ?report.content_type,
        "Transfer complete"
    );
    Ok(())
}
