use crate::api::{FetchError, PortalApi};
use crate::auth::{EntryError, SessionMarkers, take_entry_error};
use crate::driver::Snapshot;
use crate::host::HostController;
use crate::models::{CreateInstanceRequest, InstanceEntry};
use crate::poller::{InstancePoller, PollOutcome};
use crate::storage::MarkerStore;
use chrono::Utc;
use portal_domain::lifecycle::{self, POLL_INTERVAL, ReconcileInput, Reconciliation, Screen};
use portal_domain::policy::{
    self, AutoLoginAction, AutoLoginInput, Eligibility, PersistenceDenial,
};
use portal_domain::{Configuration, Instance, InstanceType, Session};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const IDENTITY_PROVIDER: &str = "oidc";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("Failed to connect to server")]
    ConnectionFailed,
    #[error("Login failed")]
    LoginFailed,
    #[error("Maximum number of instances reached. Please try again later.")]
    CapacityExceeded,
    #[error("Failed to create instance")]
    CreateFailed,
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("invalid entry url: {0}")]
    InvalidEntryUrl(#[from] url::ParseError),
    #[error("api error: {0}")]
    Api(#[from] FetchError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("host error: {0}")]
    Host(String),
}

/// Why the client handed control back to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostExit {
    Reloaded,
    Navigated(String),
}

/// Clears the in-flight creation flag however the creation future ends.
struct CreatingGuard(Arc<AtomicBool>);

impl CreatingGuard {
    fn hold(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag.clone())
    }
}

impl Drop for CreatingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the one session cell. Every write to `session` goes through
/// `refresh_session` or `logout`.
pub struct PortalClient<S: MarkerStore, H: HostController> {
    api: PortalApi,
    store: S,
    host: H,
    poll_interval: Duration,
    config: Option<Configuration>,
    session: Option<Session>,
    session_loaded: bool,
    last_error: Option<String>,
    entry_error: Option<EntryError>,
    screen: Screen,
    poller: InstancePoller,
    list_notice: Option<String>,
    create_error: Option<String>,
    creating: Arc<AtomicBool>,
    auto_login_fired: bool,
    persisted: SessionMarkers,
    exit: Option<HostExit>,
}

impl<S: MarkerStore, H: HostController> PortalClient<S, H> {
    pub fn new(api: PortalApi, store: S, host: H) -> Result<Self, ClientError> {
        let persisted = store
            .load_markers()
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        api.replace_markers(persisted.clone());
        Ok(Self {
            api,
            store,
            host,
            poll_interval: POLL_INTERVAL,
            config: None,
            session: None,
            session_loaded: false,
            last_error: None,
            entry_error: None,
            screen: Screen::Dashboard,
            poller: InstancePoller::default(),
            list_notice: None,
            create_error: None,
            creating: Arc::new(AtomicBool::new(false)),
            auto_login_fired: false,
            persisted,
            exit: None,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Entry point: strip any provider error from the entry address, load the
    /// portal configuration, fetch the session, then consider auto-login.
    pub async fn start(&mut self, entry_url: Option<&str>) -> Result<(), ClientError> {
        if let Some(entry_url) = entry_url {
            self.handle_entry_url(entry_url)?;
        }
        self.load_configuration().await;
        self.refresh_session().await;
        self.run_auto_login().await?;
        Ok(())
    }

    pub fn handle_entry_url(&mut self, entry_url: &str) -> Result<(), ClientError> {
        let Some(entry_error) = take_entry_error(entry_url)? else {
            return Ok(());
        };
        info!(code = %entry_error.code, "login provider reported an error");
        self.host
            .replace_address(&entry_error.cleaned_url)
            .map_err(|e| ClientError::Host(e.to_string()))?;
        self.entry_error = Some(entry_error);
        Ok(())
    }

    pub async fn load_configuration(&mut self) {
        match self.api.configuration().await {
            Ok(config) => {
                debug!(title = %config.title, methods = config.auth_methods.len(), "configuration loaded");
                self.config = Some(config);
            }
            Err(err) => warn!(%err, "configuration unavailable; auto-login disabled"),
        }
    }

    /// One session lookup. A missing session is a steady state, not an error;
    /// a failed lookup keeps whatever session was last known.
    pub async fn refresh_session(&mut self) {
        match self.api.current_session().await {
            Ok(Some(session)) => {
                if let Some(status) = session.instance_status() {
                    debug!(user_id = %session.user.id, %status, "session refreshed");
                }
                self.session = Some(session);
                self.last_error = None;
            }
            Ok(None) => {
                if self.session.is_some() {
                    info!("session ended");
                }
                self.session = None;
                self.last_error = None;
                self.poller.reset();
                self.api.forget_session();
            }
            Err(err) => {
                warn!(%err, "session refresh failed");
                self.last_error = Some(ClientError::ConnectionFailed.to_string());
            }
        }
        self.session_loaded = true;
        self.sync_markers();
    }

    pub async fn refresh_instances(&mut self) {
        let Some(user_id) = self.session.as_ref().map(|s| s.user.id.clone()) else {
            return;
        };
        match self.poller.poll(&self.api, &user_id).await {
            Ok(PollOutcome::Updated) => self.list_notice = None,
            Ok(PollOutcome::Unauthenticated) => {
                debug!("instance list rejected the session; re-checking");
                self.refresh_session().await;
            }
            Err(err) => {
                warn!(%err, "instance list refresh failed");
                self.list_notice = Some("Failed to load instances".to_string());
            }
        }
    }

    pub fn reconcile(&self) -> Reconciliation {
        lifecycle::reconcile(&ReconcileInput {
            loaded: self.session_loaded,
            session: self.session.as_ref(),
            error: self.last_error.as_deref(),
            screen: self.screen,
            poll_interval: self.poll_interval,
        })
    }

    /// Fires the configured auto-login at most once per client lifetime.
    pub async fn run_auto_login(&mut self) -> Result<Option<AutoLoginAction>, ClientError> {
        if self.auto_login_fired {
            return Ok(None);
        }
        let action = policy::auto_login(&AutoLoginInput {
            config: self.config.as_ref(),
            session_loaded: self.session_loaded,
            session: self.session.as_ref(),
            has_error: self.last_error.is_some(),
            entry_error: self.entry_error.is_some(),
        });
        let Some(action) = action else {
            return Ok(None);
        };
        self.auto_login_fired = true;
        info!(?action, "auto-login");
        match action {
            AutoLoginAction::RedirectToProvider => self.login_external()?,
            AutoLoginAction::LoginAnonymous => {
                if let Err(err) = self.login_anonymous().await {
                    debug!(%err, "auto-login did not complete");
                }
            }
        }
        Ok(Some(action))
    }

    pub async fn login_anonymous(&mut self) -> Result<(), ClientError> {
        self.last_error = None;
        match self.api.login_anonymous().await {
            Ok(Some(session)) => {
                info!(user_id = %session.user.id, "anonymous login succeeded");
                self.sync_markers();
                self.refresh_session().await;
                Ok(())
            }
            Ok(None) => {
                warn!("anonymous login rejected");
                self.last_error = Some(ClientError::LoginFailed.to_string());
                Err(ClientError::LoginFailed)
            }
            Err(err) => {
                warn!(%err, "anonymous login failed");
                self.last_error = Some(ClientError::LoginFailed.to_string());
                Err(ClientError::LoginFailed)
            }
        }
    }

    /// Hands the host to the identity provider. The provider redirects back
    /// to the entry URL, carrying `error` on failure.
    pub fn login_external(&mut self) -> Result<(), ClientError> {
        let url = self.api.authorize_url(IDENTITY_PROVIDER);
        self.host
            .navigate(&url)
            .map_err(|e| ClientError::Host(e.to_string()))?;
        self.exit = Some(HostExit::Navigated(url));
        Ok(())
    }

    /// Best effort on the server; local markers are cleared and the host
    /// reloaded whatever the server answered.
    pub async fn logout(&mut self) -> Result<(), ClientError> {
        if let Err(err) = self.api.logout().await {
            warn!(%err, "logout request failed; clearing local session anyway");
        }
        self.api.replace_markers(SessionMarkers::default());
        self.session = None;
        self.poller.reset();
        self.screen = Screen::Dashboard;
        match self.store.clear_markers() {
            Ok(()) => self.persisted = SessionMarkers::default(),
            Err(err) => warn!(%err, "failed to clear stored session markers"),
        }
        self.reload()
    }

    pub async fn create_instance(
        &mut self,
        type_id: &str,
        persistent: bool,
    ) -> Result<Instance, ClientError> {
        self.create_instance_observed(type_id, persistent, |_| {}).await
    }

    /// Like `create_instance`, calling `on_start` once the creating flag is
    /// raised and before anything is sent.
    pub async fn create_instance_observed(
        &mut self,
        type_id: &str,
        persistent: bool,
        on_start: impl FnOnce(&Self),
    ) -> Result<Instance, ClientError> {
        let user_id = self
            .session
            .as_ref()
            .map(|s| s.user.id.clone())
            .ok_or(ClientError::NotAuthenticated)?;
        let _guard = CreatingGuard::hold(&self.creating);
        self.create_error = None;
        on_start(self);

        if let Err(err) = self.poller.ensure_catalog(&self.api, &user_id).await {
            warn!(%err, "instance type catalog unavailable");
        }
        let eligibility = self.persistence_eligibility(type_id)?;
        if persistent && let Some(reason) = eligibility.denial() {
            info!(type_id, %reason, "persistent storage not available");
        }
        let request = CreateInstanceRequest {
            type_id: type_id.to_string(),
            persistent: eligibility.effective(persistent),
        };

        match self.api.create_instance(&request).await {
            Ok(Some(instance)) => {
                info!(instance_id = %instance.id, type_id, persistent = request.persistent, "instance created");
                self.screen = Screen::Dashboard;
                self.refresh_instances().await;
                Ok(instance)
            }
            Ok(None) => {
                self.create_error = Some(ClientError::CreateFailed.to_string());
                self.refresh_session().await;
                Err(ClientError::NotAuthenticated)
            }
            Err(err) if err.status() == Some(503) => {
                warn!(type_id, "instance capacity exhausted");
                self.create_error = Some(ClientError::CapacityExceeded.to_string());
                Err(ClientError::CapacityExceeded)
            }
            Err(err) => {
                warn!(%err, type_id, "instance creation failed");
                self.create_error = Some(ClientError::CreateFailed.to_string());
                Err(ClientError::CreateFailed)
            }
        }
    }

    /// Failures are logged only; the next poll shows the real state.
    pub async fn delete_instance(&mut self, instance_id: &str) -> bool {
        match self.api.delete_instance(instance_id).await {
            Ok(Some(())) => {
                info!(instance_id, "instance deleted");
                self.refresh_instances().await;
                true
            }
            Ok(None) => {
                warn!(instance_id, "instance deletion rejected: no session");
                self.refresh_session().await;
                false
            }
            Err(err) => {
                warn!(%err, instance_id, "instance deletion failed");
                false
            }
        }
    }

    /// Selects an instance and reloads; the gateway routes the next page
    /// load to it.
    pub async fn open_instance(&mut self, instance_id: &str) -> Result<(), ClientError> {
        if self.session.is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        if !self.poller.is_loaded() {
            self.refresh_instances().await;
        }
        if !self.poller.instances().iter().any(|i| i.id == instance_id) {
            return Err(ClientError::UnknownInstance(instance_id.to_string()));
        }
        info!(instance_id, "opening instance");
        self.api.select_instance(Some(instance_id.to_string()));
        self.sync_markers();
        self.reload()
    }

    pub async fn show_create(&mut self) {
        self.screen = Screen::Create;
        self.create_error = None;
        if let Some(user_id) = self.session.as_ref().map(|s| s.user.id.clone())
            && let Err(err) = self.poller.ensure_catalog(&self.api, &user_id).await
        {
            warn!(%err, "instance type catalog unavailable");
        }
    }

    pub fn show_dashboard(&mut self) {
        self.screen = Screen::Dashboard;
    }

    pub fn retry(&mut self) -> Result<(), ClientError> {
        self.reload()
    }

    /// Reloads the host into the ready instance and returns its address.
    pub fn hand_off(&mut self) -> Result<Option<String>, ClientError> {
        let address = self
            .session
            .as_ref()
            .and_then(|s| s.instance.as_ref())
            .and_then(|i| i.address.clone());
        info!(address = address.as_deref().unwrap_or("-"), "instance ready");
        self.reload()?;
        Ok(address)
    }

    pub fn persistence_eligibility(&self, type_id: &str) -> Result<Eligibility, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::NotAuthenticated)?;
        Ok(match &self.config {
            Some(config) => policy::persistence_eligibility(
                config,
                &session.user,
                self.poller.instance_type(type_id),
            ),
            None => Eligibility::Denied(PersistenceDenial::DisabledGlobally),
        })
    }

    pub fn config(&self) -> Option<&Configuration> {
        self.config.as_ref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn entry_error(&self) -> Option<&EntryError> {
        self.entry_error.as_ref()
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn instances(&self) -> Vec<InstanceEntry> {
        self.poller.entries()
    }

    pub fn instance_types(&self) -> &[InstanceType] {
        self.poller.catalog()
    }

    pub fn is_creating(&self) -> bool {
        self.creating.load(Ordering::SeqCst)
    }

    pub fn create_error(&self) -> Option<&str> {
        self.create_error.as_deref()
    }

    pub fn list_notice(&self) -> Option<&str> {
        self.list_notice.as_deref()
    }

    pub fn exit(&self) -> Option<&HostExit> {
        self.exit.as_ref()
    }

    pub fn take_exit(&mut self) -> Option<HostExit> {
        self.exit.take()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            view: self.reconcile().view().cloned(),
            title: self.config.as_ref().map(|c| c.title.clone()),
            user: self.session.as_ref().map(|s| s.user.clone()),
            instance_status: self.session.as_ref().and_then(Session::instance_status),
            instances: self.poller.entries(),
            instance_types: self.poller.catalog().to_vec(),
            creating: self.is_creating(),
            create_error: self.create_error.clone(),
            notice: self.entry_error.as_ref().map(EntryError::message),
            list_notice: self.list_notice.clone(),
            updated_at: Utc::now(),
        }
    }

    fn reload(&mut self) -> Result<(), ClientError> {
        self.host
            .reload()
            .map_err(|e| ClientError::Host(e.to_string()))?;
        self.exit = Some(HostExit::Reloaded);
        Ok(())
    }

    fn sync_markers(&mut self) {
        let current = self.api.markers();
        if current == self.persisted {
            return;
        }
        let result = if current.is_empty() {
            self.store.clear_markers()
        } else {
            self.store.save_markers(&current)
        };
        match result {
            Ok(()) => self.persisted = current,
            Err(err) => warn!(%err, "failed to persist session markers"),
        }
    }
}
