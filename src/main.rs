//! Switchboard CLI entry point.
//!
//! Provides `serve`, `sessions`, and `check-config` subcommands for running
//! the orchestrator daemon, listing persisted sessions, and validating the
//! configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use switchboard::auth::FileAuthStore;
use switchboard::broadcast::{CoreEvent, EventScope};
use switchboard::config::{self, Config};
use switchboard::hints::MemoryHintCache;
use switchboard::session::QrArtifact;
use switchboard::store::{MessageStore, SqliteStore};
use switchboard::transport::bridge::BridgeTransport;
use switchboard::Switchboard;

/// Switchboard: multi-tenant chat session orchestrator.
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Config file (default: `$SWITCHBOARD_CONFIG` or `~/.switchboard/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory relative paths resolve against (default: `~/.switchboard`).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Serve,
    /// List persisted sessions.
    Sessions {
        /// Only sessions of this tenant.
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => config::config_dir()?,
    };

    match cli.command {
        Command::Serve => handle_serve(cli.config.as_deref(), &root).await,
        Command::Sessions { tenant } => {
            handle_sessions(cli.config.as_deref(), &root, tenant.as_deref()).await
        }
        Command::CheckConfig => handle_check_config(cli.config.as_deref()),
    }
}

/// Run the orchestrator daemon.
async fn handle_serve(config_path: Option<&Path>, root: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let _logging_guard = switchboard::logging::init_production(&config.paths.logs_dir(root))?;

    let database = config.paths.database(root);
    let store = Arc::new(
        SqliteStore::connect(&database)
            .await
            .with_context(|| format!("failed to open {}", database.display()))?,
    );
    let auth = Arc::new(FileAuthStore::new(config.paths.auth_dir(root)));
    let transport = Arc::new(
        BridgeTransport::new(&config.bridge.base_url, config.bridge_timeout())
            .context("failed to create bridge client")?,
    );
    if !transport.health_check().await {
        warn!(url = %transport.base_url(), "bridge is not reachable yet, sessions will retry");
    }

    let messages: Arc<dyn MessageStore> = Arc::clone(&store) as Arc<dyn MessageStore>;
    let mut builder = Switchboard::builder(transport, messages, auth).config(config.switchboard());
    if config.hints.enabled {
        builder = builder.hints(Arc::new(MemoryHintCache::new(
            std::time::Duration::from_secs(config.hints.ttl_secs),
        )));
    }
    let switchboard = builder.build();
    switchboard.start();

    // Subscribe before any session starts so no challenge is missed.
    let mut tenants: BTreeSet<String> =
        config.sessions.iter().map(|s| s.tenant.clone()).collect();
    if config.auto_resume {
        tenants.extend(
            switchboard
                .resumable_sessions()
                .await?
                .into_iter()
                .map(|row| row.tenant_id),
        );
    }
    let qr_printers: Vec<_> = tenants
        .into_iter()
        .map(|tenant| {
            let subscription = switchboard.subscribe(EventScope::tenant(tenant));
            tokio::spawn(print_qr_challenges(subscription))
        })
        .collect();

    if config.auto_resume {
        switchboard.resume_all().await?;
    }
    for session in &config.sessions {
        match switchboard
            .create_session(&session.tenant, &session.name)
            .await
        {
            Ok(id) => info!(session_id = %id, "bootstrap session started"),
            Err(e) => warn!(
                tenant = %session.tenant,
                name = %session.name,
                error = %e,
                "bootstrap session failed"
            ),
        }
    }

    info!(
        database = %database.display(),
        bridge = %config.bridge.base_url,
        "switchboard serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received");

    switchboard.shutdown().await;
    for printer in qr_printers {
        printer.abort();
    }
    store.close().await;
    Ok(())
}

/// Print every QR challenge to the terminal so an operator can pair.
async fn print_qr_challenges(mut subscription: switchboard::broadcast::Subscription) {
    while let Some(published) = subscription.recv().await {
        let CoreEvent::Qr(qr) = &published.event else {
            continue;
        };
        let artifact = QrArtifact {
            code: qr.code.clone(),
            issued_at: qr.issued_at,
        };
        match artifact.render_terminal() {
            Ok(rendered) => eprintln!("\nScan to pair {}:\n{rendered}", qr.session_id),
            Err(e) => warn!(session_id = %qr.session_id, error = %e, "cannot render QR challenge"),
        }
    }
}

/// List persisted sessions.
async fn handle_sessions(
    config_path: Option<&Path>,
    root: &Path,
    tenant: Option<&str>,
) -> anyhow::Result<()> {
    switchboard::logging::init_cli();
    let config = Config::load(config_path)?;
    let database = config.paths.database(root);
    let store = SqliteStore::connect(&database)
        .await
        .with_context(|| format!("failed to open {}", database.display()))?;

    let rows = store.list_sessions(tenant).await?;
    if rows.is_empty() {
        println!("no sessions");
    }
    for row in rows {
        println!(
            "{}\t{}\t{}\t{}",
            row.id,
            row.status,
            row.phone.as_deref().unwrap_or("-"),
            row.last_activity_at.to_rfc3339()
        );
    }
    store.close().await;
    Ok(())
}

/// Validate and print the effective configuration.
fn handle_check_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    switchboard::logging::init_cli();
    let config = Config::load(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("{rendered}");
    Ok(())
}
