use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use portal_client::api::PortalApi;
use portal_client::config::{ClientConfig, DEFAULT_LOG_FILTER, LOG_ENV};
use portal_client::driver::{self, Command, DriverExit, Snapshot};
use portal_client::host::ConsoleHost;
use portal_client::models::InstanceEntry;
use portal_client::session::PortalClient;
use portal_client::storage::FileMarkerStore;
use portal_domain::AuthMethod;
use portal_domain::lifecycle::ViewState;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Client = PortalClient<FileMarkerStore, ConsoleHost>;

#[derive(Debug, Parser)]
#[command(name = "portal", version, about = "Workspace portal client")]
struct Cli {
    /// Portal API base, e.g. https://portal.example/_hakoniwa/api
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Follow the session and instance lifecycle; reads commands from stdin.
    Watch {
        /// Address the provider redirected back to after a login attempt.
        #[arg(long)]
        entry_url: Option<String>,
    },
    Status,
    /// Sign in anonymously.
    Login,
    Logout,
    Types,
    List,
    Create {
        type_id: String,
        #[arg(long)]
        persistent: bool,
    },
    Delete {
        id: String,
    },
    Open {
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?.with_overrides(cli.base_url.as_deref(), cli.state_file)?;
    info!(api = %config.api_base_url, state_file = %config.state_file.display(), "portal client configured");

    match cli.command {
        CliCommand::Watch { entry_url } => run_watch(&config, entry_url).await,
        CliCommand::Status => {
            let mut client = build_client(&config)?;
            client.load_configuration().await;
            client.refresh_session().await;
            client.refresh_instances().await;
            render(&client.snapshot());
            Ok(())
        }
        CliCommand::Login => {
            let mut client = build_client(&config)?;
            client.load_configuration().await;
            client.refresh_session().await;
            if client.session().is_none() {
                if client
                    .config()
                    .is_some_and(|c| !c.auth_methods.contains(&AuthMethod::Anonymous))
                {
                    bail!("anonymous login is not enabled on this portal");
                }
                client.login_anonymous().await?;
            }
            render(&client.snapshot());
            Ok(())
        }
        CliCommand::Logout => {
            let mut client = build_client(&config)?;
            client.logout().await?;
            println!("Signed out.");
            Ok(())
        }
        CliCommand::Types => {
            let mut client = signed_in(&config).await?;
            client.show_create().await;
            for ty in client.instance_types() {
                let persistence = if client.persistence_eligibility(&ty.id)?.is_allowed() {
                    "persistent storage available"
                } else {
                    "ephemeral"
                };
                println!(
                    "{:<16} {:<24} {persistence}",
                    ty.id,
                    ty.name
                );
            }
            Ok(())
        }
        CliCommand::List => {
            let mut client = signed_in(&config).await?;
            client.refresh_instances().await;
            if let Some(notice) = client.list_notice() {
                bail!("{notice}");
            }
            print_instances(&client.instances());
            Ok(())
        }
        CliCommand::Create {
            type_id,
            persistent,
        } => {
            let mut client = signed_in(&config).await?;
            let instance = client.create_instance(&type_id, persistent).await?;
            if persistent
                && let Some(reason) = client.persistence_eligibility(&type_id)?.denial()
            {
                println!("{reason}; the instance was created without persistent storage.");
            }
            println!("Created {} ({}), status {}", instance.id, instance.name, instance.status);
            Ok(())
        }
        CliCommand::Delete { id } => {
            let mut client = signed_in(&config).await?;
            if !client.delete_instance(&id).await {
                bail!("failed to delete instance {id}");
            }
            println!("Deleted {id}");
            Ok(())
        }
        CliCommand::Open { id } => {
            let mut client = signed_in(&config).await?;
            client.open_instance(&id).await?;
            println!("Selected {id}; run `portal watch` to follow it until it is ready.");
            Ok(())
        }
    }
}

fn build_client(config: &ClientConfig) -> anyhow::Result<Client> {
    let api = PortalApi::new(config.api_base_url.clone());
    let store = FileMarkerStore::new(config.state_file.clone(), config.storage_key.clone());
    let client = PortalClient::new(api, store, ConsoleHost).context("load session markers")?;
    Ok(client.with_poll_interval(config.poll_interval))
}

async fn signed_in(config: &ClientConfig) -> anyhow::Result<Client> {
    let mut client = build_client(config)?;
    client.load_configuration().await;
    client.refresh_session().await;
    if let Some(err) = client.last_error() {
        bail!("{err}");
    }
    if client.session().is_none() {
        bail!("not signed in; run `portal login` or `portal watch`");
    }
    Ok(client)
}

/// Each reload starts a fresh client, like a page load.
async fn run_watch(config: &ClientConfig, mut entry_url: Option<String>) -> anyhow::Result<()> {
    let (commands_tx, mut commands) = mpsc::channel(16);
    tokio::spawn(read_commands(commands_tx));

    loop {
        let mut client = build_client(config)?;
        let (updates, updates_rx) = watch::channel(Snapshot::default());
        let printer = tokio::spawn(print_snapshots(updates_rx));

        let entry = entry_url.take();
        let exit = driver::run(&mut client, entry.as_deref(), &mut commands, &updates).await;
        drop(updates);
        let _ = printer.await;

        match exit? {
            DriverExit::Reloaded => info!("reloading"),
            DriverExit::InstanceReady { address } => {
                match address {
                    Some(address) => println!("Instance ready at {address}"),
                    None => println!("Instance ready"),
                }
                return Ok(());
            }
            DriverExit::Navigated(url) => {
                println!(
                    "After signing in at {url}, run `portal watch --entry-url <address you were sent back to>`."
                );
                return Ok(());
            }
            DriverExit::Closed => return Ok(()),
        }
    }
}

async fn read_commands(commands: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => {
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            Err(err) => eprintln!("{err}"),
        }
    }
}

async fn print_snapshots(mut updates: watch::Receiver<Snapshot>) {
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        render(&snapshot);
    }
}

fn render(snapshot: &Snapshot) {
    let title = snapshot.title.as_deref().unwrap_or("Portal");
    if let Some(notice) = &snapshot.notice {
        println!("! {notice}");
    }
    match &snapshot.view {
        None => println!("[{title}] instance ready, handing off"),
        Some(ViewState::Connecting) => println!("[{title}] connecting..."),
        Some(ViewState::Unauthenticated) => {
            println!("[{title}] not signed in; commands: login, oidc, quit")
        }
        Some(ViewState::PendingInstance(status)) => {
            println!("[{title}] preparing your instance, status: {status}")
        }
        Some(ViewState::Error(message)) => {
            println!("[{title}] error: {message}; type `retry` to reload")
        }
        Some(ViewState::Dashboard) => {
            let who = snapshot.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-");
            println!("[{title}] signed in as {who}; commands: new, open <id>, delete <id>, logout");
            if let Some(notice) = &snapshot.list_notice {
                println!("! {notice}");
            }
            print_instances(&snapshot.instances);
        }
        Some(ViewState::Create) => {
            println!("[{title}] choose a type: create <type> [persistent], back");
            for ty in &snapshot.instance_types {
                let marker = if ty.persistable { " (persistable)" } else { "" };
                println!("  {:<16} {}{marker}", ty.id, ty.name);
            }
            if snapshot.creating {
                println!("  creating...");
            }
            if let Some(err) = &snapshot.create_error {
                println!("! {err}");
            }
        }
    }
}

fn print_instances(entries: &[InstanceEntry]) {
    if entries.is_empty() {
        println!("  no instances");
        return;
    }
    for entry in entries {
        println!(
            "  {:<12} {:<24} {:<16} {}",
            entry.instance.id,
            entry.instance.name,
            entry.type_label(),
            entry.instance.status
        );
    }
}
