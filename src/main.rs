use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use git_bundle_server::bundles::FsManifestStore;
use git_bundle_server::config::{self, Config, ServerConfig, TlsConfig, TlsVersion};
use git_bundle_server::engine::{BundleEngine, UpdateError, UpdateOutcome};
use git_bundle_server::git::GitCli;
use git_bundle_server::http::BundleWebServer;
use git_bundle_server::registry::RouteRegistry;
use git_bundle_server::scheduler;
use git_bundle_server::storage::{Route, StorageLayout};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "git-bundle-server",
    version,
    about = "Host incrementally-updated Git bundles over HTTP(S)"
)]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply if it is absent.
    #[arg(
        short,
        long,
        global = true,
        env = "GIT_BUNDLE_SERVER_CONFIG",
        default_value = "/etc/git-bundle-server/config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone <url> and publish its base bundle at <route>.
    Init { url: String, route: Route },
    /// Fetch and publish a new bundle for <route> if anything changed.
    Update { route: Route },
    /// Update every registered route.
    UpdateAll,
    /// Register <route> again on its existing working copy.
    Start { route: Route },
    /// Stop hosting <route> and delete its data.
    Stop { route: Route },
    /// List registered routes.
    List,
    /// Run the web server and the update scheduler.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Address to listen on, e.g. `0.0.0.0:8443`.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// PEM certificate chain; enables TLS together with `--key`.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key for `--cert`.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Minimum TLS protocol version.
    #[arg(long, value_enum)]
    tls_version: Option<TlsVersion>,
    /// CA bundle for verifying client certificates (mutual TLS).
    #[arg(long)]
    client_ca: Option<PathBuf>,
    /// Serve only; do not run scheduled updates in this process.
    #[arg(long)]
    no_scheduler: bool,
}

/// Fold command-line flags over the `server` section of the config file.
fn apply_serve_overrides(server: &mut ServerConfig, args: &ServeArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        server.listen = listen;
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        let previous = server.tls.take();
        server.tls = Some(TlsConfig {
            cert_file: cert.clone(),
            key_file: key.clone(),
            min_version: previous.as_ref().map(|t| t.min_version).unwrap_or_default(),
            client_ca_file: previous.and_then(|t| t.client_ca_file),
        });
    }
    if let Some(version) = args.tls_version {
        server
            .tls
            .as_mut()
            .context("--tls-version requires a certificate")?
            .min_version = version;
    }
    if let Some(ca) = &args.client_ca {
        server
            .tls
            .as_mut()
            .context("--client-ca requires a certificate")?
            .client_ca_file = Some(ca.clone());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn report_outcome(route: &Route, outcome: &UpdateOutcome) {
    match (&outcome.descriptor, outcome.created) {
        (Some(bundle), true) => println!("{route}: published {}", bundle.filename),
        (Some(bundle), false) => println!("{route}: up to date ({})", bundle.filename),
        (None, _) => println!("{route}: nothing published"),
    }
}

async fn run_update(engine: &BundleEngine, route: &Route) -> Result<()> {
    match engine.update(route).await {
        Ok(outcome) => report_outcome(route, &outcome),
        Err(e) if e.is_transient() => println!("{route}: skipped: {e}"),
        Err(e) => return Err(e).with_context(|| format!("update of {route} failed")),
    }
    Ok(())
}

async fn run_serve(
    mut config: Config,
    args: ServeArgs,
    registry: Arc<RouteRegistry>,
    engine: Arc<BundleEngine>,
) -> Result<()> {
    apply_serve_overrides(&mut config.server, &args)?;

    let shutdown = CancellationToken::new();
    let server = BundleWebServer::new(&config.server, registry)?;
    let running = server.start(shutdown.clone()).await?;

    let scheduler_handle = (config.scheduler.enabled && !args.no_scheduler).then(|| {
        tokio::spawn(scheduler::run(
            engine,
            config.scheduler.interval(),
            shutdown.clone(),
        ))
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let result = running.wait().await;
    // The server may also stop on its own error; take the scheduler down too.
    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "scheduler task panicked");
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config_or_default(&cli.config)?;

    // ---- Tracing ----
    // Logs go to stderr so command output on stdout stays clean.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::debug!(config_path = %cli.config.display(), "configuration loaded");

    // ---- Storage + registry ----
    std::fs::create_dir_all(&config.storage.root).with_context(|| {
        format!(
            "failed to create storage root: {}",
            config.storage.root.display()
        )
    })?;
    let layout = StorageLayout::new(&config.storage.root);
    let registry = Arc::new(
        RouteRegistry::open(layout, config.server.registry_refresh_interval())
            .context("failed to open route registry")?,
    );

    // ---- Engine ----
    let engine = Arc::new(BundleEngine::new(
        Arc::clone(&registry),
        Arc::new(FsManifestStore),
        Arc::new(GitCli::new(&config.engine.git_binary)),
        config.engine.policy(),
    ));

    match cli.command {
        Command::Init { url, route } => {
            let outcome = engine.init(&url, &route).await.map_err(|e| match e {
                UpdateError::EmptyRepository(_) => {
                    anyhow::Error::new(e).context("refused to publish an empty bundle; is the repository empty?")
                }
                other => anyhow::Error::new(other).context(format!("init of {route} failed")),
            })?;
            report_outcome(&route, &outcome);
        }
        Command::Update { route } => run_update(&engine, &route).await?,
        Command::UpdateAll => {
            let summary = engine.update_all().await?;
            println!(
                "created {}, unchanged {}, skipped {}, failed {}",
                summary.created, summary.unchanged, summary.skipped, summary.failed
            );
            anyhow::ensure!(summary.failed == 0, "{} route(s) failed to update", summary.failed);
        }
        Command::Start { route } => {
            let record = engine
                .start(&route)
                .await
                .with_context(|| format!("failed to start {route}"))?;
            println!("{route}: started ({})", record.web_dir.display());
        }
        Command::Stop { route } => {
            engine
                .remove(&route)
                .await
                .with_context(|| format!("failed to stop {route}"))?;
            println!("{route}: removed");
        }
        Command::List => {
            for record in registry.list()? {
                println!(
                    "{}\t{}\t{}",
                    record.route,
                    record.repo_dir.display(),
                    record.web_dir.display()
                );
            }
        }
        Command::Serve(args) => run_serve(config, args, registry, engine).await?,
    }

    Ok(())
}
