use crate::{AuthMethod, Configuration, InstanceType, Session, User, UserKind};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoLoginAction {
    RedirectToProvider,
    LoginAnonymous,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoLoginInput<'a> {
    pub config: Option<&'a Configuration>,
    pub session_loaded: bool,
    pub session: Option<&'a Session>,
    pub has_error: bool,
    pub entry_error: bool,
}

/// Returns the login to trigger without user interaction, if any. The caller
/// is responsible for firing the returned action at most once.
pub fn auto_login(input: &AutoLoginInput<'_>) -> Option<AutoLoginAction> {
    let config = input.config?;
    if !config.auto_login_enabled
        || !input.session_loaded
        || input.session.is_some()
        || input.has_error
        || input.entry_error
        || config.auth_methods.len() != 1
    {
        return None;
    }

    match config.auth_methods.first()? {
        AuthMethod::ExternalIdentity => Some(AutoLoginAction::RedirectToProvider),
        AuthMethod::Anonymous => Some(AutoLoginAction::LoginAnonymous),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceDenial {
    DisabledGlobally,
    RequiresIdentity,
    TypeNotPersistable,
}

impl fmt::Display for PersistenceDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DisabledGlobally => "Persistent storage is disabled by the administrator",
            Self::RequiresIdentity => {
                "Persistent storage is only available for authenticated users"
            }
            Self::TypeNotPersistable => "This instance type does not support persistent storage",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Allowed,
    Denied(PersistenceDenial),
}

impl Eligibility {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn denial(&self) -> Option<PersistenceDenial> {
        match self {
            Self::Allowed => None,
            Self::Denied(reason) => Some(*reason),
        }
    }

    /// The `persistent` flag actually sent for a creation request.
    pub fn effective(&self, requested: bool) -> bool {
        requested && self.is_allowed()
    }
}

/// Checks run in a fixed order and the first failing one is reported.
pub fn persistence_eligibility(
    config: &Configuration,
    user: &User,
    selected: Option<&InstanceType>,
) -> Eligibility {
    if !config.persistence_enabled {
        return Eligibility::Denied(PersistenceDenial::DisabledGlobally);
    }
    if user.kind != UserKind::ExternalIdentity {
        return Eligibility::Denied(PersistenceDenial::RequiresIdentity);
    }
    if !selected.is_some_and(|ty| ty.persistable) {
        return Eligibility::Denied(PersistenceDenial::TypeNotPersistable);
    }
    Eligibility::Allowed
}
