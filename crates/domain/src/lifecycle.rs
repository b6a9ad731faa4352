//! View-state reconciliation.
//!
//! Everything here is a pure projection of the latest known inputs; nothing
//! is carried over between calls.

use crate::{InstanceStatus, Session};
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Local screen selection while the user is on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Screen {
    #[default]
    Dashboard,
    Create,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Connecting,
    Unauthenticated,
    PendingInstance(InstanceStatus),
    Dashboard,
    Create,
    Error(String),
}

impl ViewState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Unauthenticated => "login",
            Self::PendingInstance(_) => "pending",
            Self::Dashboard => "dashboard",
            Self::Create => "create",
            Self::Error(_) => "error",
        }
    }
}

/// Which loops should be ticking, and how often. `None` means stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollPlan {
    pub session: Option<Duration>,
    pub instances: Option<Duration>,
}

impl PollPlan {
    pub const IDLE: Self = Self {
        session: None,
        instances: None,
    };

    pub fn is_idle(&self) -> bool {
        self.session.is_none() && self.instances.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub loaded: bool,
    pub session: Option<&'a Session>,
    pub error: Option<&'a str>,
    pub screen: Screen,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The instance is ready; the client hands off to it with a full reload.
    Reload,
    Show { view: ViewState, poll: PollPlan },
}

impl Reconciliation {
    pub fn view(&self) -> Option<&ViewState> {
        match self {
            Self::Reload => None,
            Self::Show { view, .. } => Some(view),
        }
    }

    pub fn poll(&self) -> PollPlan {
        match self {
            Self::Reload => PollPlan::IDLE,
            Self::Show { poll, .. } => *poll,
        }
    }

    pub fn should_poll(&self) -> bool {
        !self.poll().is_idle()
    }

    pub fn poll_interval_ms(&self) -> u64 {
        let plan = self.poll();
        plan.session
            .or(plan.instances)
            .map(|period| period.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub fn reconcile(input: &ReconcileInput<'_>) -> Reconciliation {
    let status = input.session.and_then(Session::instance_status);

    // A ready instance supersedes any stale error.
    if status == Some(InstanceStatus::Running) {
        return Reconciliation::Reload;
    }

    let Some(session) = input.session else {
        let view = match input.error {
            Some(message) => ViewState::Error(message.to_string()),
            None if !input.loaded => ViewState::Connecting,
            None => ViewState::Unauthenticated,
        };
        return Reconciliation::Show {
            view,
            poll: PollPlan::IDLE,
        };
    };

    if let Some(status) = session.instance_status()
        && status.is_transitional()
    {
        return Reconciliation::Show {
            view: ViewState::PendingInstance(status),
            poll: PollPlan {
                session: Some(input.poll_interval),
                instances: None,
            },
        };
    }

    match input.screen {
        Screen::Dashboard => Reconciliation::Show {
            view: ViewState::Dashboard,
            poll: PollPlan {
                session: None,
                instances: Some(input.poll_interval),
            },
        },
        Screen::Create => Reconciliation::Show {
            view: ViewState::Create,
            poll: PollPlan::IDLE,
        },
    }
}
