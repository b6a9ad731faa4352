//! The cooperative driver: one task owns the client, ticks the poll timers
//! the reconciler asks for, applies user commands and publishes snapshots.

use crate::host::HostController;
use crate::models::InstanceEntry;
use crate::session::{ClientError, HostExit, PortalClient};
use crate::storage::MarkerStore;
use chrono::{DateTime, Utc};
use portal_domain::lifecycle::{PollPlan, Reconciliation, ViewState};
use portal_domain::{InstanceStatus, InstanceType, User};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LoginAnonymous,
    LoginExternal,
    Logout,
    ShowCreate,
    ShowDashboard,
    Create { type_id: String, persistent: bool },
    Delete { id: String },
    Open { id: String },
    Retry,
    Refresh,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(CommandParseError::Empty);
        };
        let arg = words.next().map(str::to_string);
        let command = match verb {
            "login" => Self::LoginAnonymous,
            "oidc" => Self::LoginExternal,
            "logout" => Self::Logout,
            "new" => Self::ShowCreate,
            "back" => Self::ShowDashboard,
            "create" => Self::Create {
                type_id: arg.ok_or(CommandParseError::Usage("create <type> [persistent]"))?,
                persistent: match words.next() {
                    None => false,
                    Some("persistent") => true,
                    Some(_) => return Err(CommandParseError::Usage("create <type> [persistent]")),
                },
            },
            "delete" => Self::Delete {
                id: arg.ok_or(CommandParseError::Usage("delete <id>"))?,
            },
            "open" => Self::Open {
                id: arg.ok_or(CommandParseError::Usage("open <id>"))?,
            },
            "retry" => Self::Retry,
            "refresh" => Self::Refresh,
            "quit" | "exit" => Self::Quit,
            other => return Err(CommandParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// Immutable view handed to readers. `view` is `None` once the client has
/// handed off to a ready instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub view: Option<ViewState>,
    pub title: Option<String>,
    pub user: Option<User>,
    pub instance_status: Option<InstanceStatus>,
    pub instances: Vec<InstanceEntry>,
    pub instance_types: Vec<InstanceType>,
    pub creating: bool,
    pub create_error: Option<String>,
    pub notice: Option<String>,
    pub list_notice: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Equality ignoring the timestamp.
    pub fn same_as(&self, other: &Self) -> bool {
        Self {
            updated_at: other.updated_at,
            ..self.clone()
        } == *other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExit {
    InstanceReady { address: Option<String> },
    Reloaded,
    Navigated(String),
    Closed,
}

impl From<HostExit> for DriverExit {
    fn from(exit: HostExit) -> Self {
        match exit {
            HostExit::Reloaded => Self::Reloaded,
            HostExit::Navigated(url) => Self::Navigated(url),
        }
    }
}

pub async fn run<S: MarkerStore, H: HostController>(
    client: &mut PortalClient<S, H>,
    entry_url: Option<&str>,
    commands: &mut mpsc::Receiver<Command>,
    updates: &watch::Sender<Snapshot>,
) -> Result<DriverExit, ClientError> {
    publish(client, updates);
    client.start(entry_url).await?;

    let mut plan = PollPlan::IDLE;
    let mut session_timer: Option<Interval> = None;
    let mut instance_timer: Option<Interval> = None;

    loop {
        if let Some(exit) = client.take_exit() {
            publish(client, updates);
            info!(?exit, "driver stopped");
            return Ok(exit.into());
        }

        let reconciliation = client.reconcile();
        if reconciliation == Reconciliation::Reload {
            let address = client.hand_off()?;
            client.take_exit();
            publish(client, updates);
            return Ok(DriverExit::InstanceReady { address });
        }
        publish(client, updates);

        // Stale timers are dropped before the next wait.
        let next = reconciliation.poll();
        if next != plan {
            debug!(?next, "poll plan changed");
            session_timer = next.session.map(delayed_timer);
            instance_timer = next.instances.map(immediate_timer);
            plan = next;
        }

        tokio::select! {
            _ = tick(&mut session_timer) => {
                client.refresh_session().await;
            }
            _ = tick(&mut instance_timer) => {
                client.refresh_instances().await;
            }
            command = commands.recv() => {
                match command {
                    None | Some(Command::Quit) => {
                        info!("driver closed");
                        return Ok(DriverExit::Closed);
                    }
                    Some(command) => {
                        if let Err(err) = apply(client, command, updates).await {
                            warn!(%err, "command failed");
                        }
                    }
                }
            }
        }

        client.run_auto_login().await?;
    }
}

async fn apply<S: MarkerStore, H: HostController>(
    client: &mut PortalClient<S, H>,
    command: Command,
    updates: &watch::Sender<Snapshot>,
) -> Result<(), ClientError> {
    debug!(?command, "applying command");
    match command {
        Command::LoginAnonymous => client.login_anonymous().await,
        Command::LoginExternal => client.login_external(),
        Command::Logout => client.logout().await,
        Command::ShowCreate => {
            client.show_create().await;
            Ok(())
        }
        Command::ShowDashboard => {
            client.show_dashboard();
            Ok(())
        }
        Command::Create {
            type_id,
            persistent,
        } => client
            .create_instance_observed(&type_id, persistent, |client| publish(client, updates))
            .await
            .map(|_| ()),
        Command::Delete { id } => {
            client.delete_instance(&id).await;
            Ok(())
        }
        Command::Open { id } => client.open_instance(&id).await,
        Command::Retry => client.retry(),
        Command::Refresh => {
            client.refresh_session().await;
            client.refresh_instances().await;
            Ok(())
        }
        Command::Quit => Ok(()),
    }
}

fn publish<S: MarkerStore, H: HostController>(
    client: &PortalClient<S, H>,
    updates: &watch::Sender<Snapshot>,
) {
    let next = client.snapshot();
    updates.send_if_modified(|current| {
        if current.same_as(&next) {
            return false;
        }
        if current.view != next.view {
            debug!(view = next.view.as_ref().map_or("handed-off", ViewState::label), "view changed");
        }
        *current = next;
        true
    });
}

// The session loop waits a full period: the session was just fetched.
fn delayed_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

fn immediate_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
