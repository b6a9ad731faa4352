use crate::auth::{INSTANCE_MARKER, SESSION_MARKER};
use crate::models::CreateInstanceRequest;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use portal_domain::{
    AuthMethod, Configuration, Instance, InstanceStatus, InstanceSummary, InstanceType, Session,
    User, UserKind,
};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TOKEN: &str = "tok-1";

#[derive(Debug)]
pub struct MockPortal {
    pub config: Configuration,
    pub user: Option<User>,
    pub instance: Option<InstanceSummary>,
    /// Popped into `instance` on each authenticated session lookup.
    pub instance_script: VecDeque<Option<InstanceSummary>>,
    pub instances: Vec<Instance>,
    pub types: Vec<InstanceType>,
    pub create_failure: Option<(u16, String)>,
    /// Held before answering a create, outside the state lock.
    pub create_delay: Duration,
    pub login_fails: bool,
    pub logout_fails: bool,
    pub delete_fails: bool,
    pub session_fails: bool,
    pub instances_fail: bool,
    pub create_requests: Vec<CreateInstanceRequest>,
    pub deleted: Vec<String>,
    pub last_selected_instance: Option<String>,
    pub session_calls: usize,
    pub instance_calls: usize,
    pub type_calls: usize,
    pub login_calls: usize,
    pub logout_calls: usize,
}

impl Default for MockPortal {
    fn default() -> Self {
        Self {
            config: configuration(
                &[AuthMethod::Anonymous, AuthMethod::ExternalIdentity],
                false,
                true,
            ),
            user: None,
            instance: None,
            instance_script: VecDeque::new(),
            instances: Vec::new(),
            types: Vec::new(),
            create_failure: None,
            create_delay: Duration::ZERO,
            login_fails: false,
            logout_fails: false,
            delete_fails: false,
            session_fails: false,
            instances_fail: false,
            create_requests: Vec::new(),
            deleted: Vec::new(),
            last_selected_instance: None,
            session_calls: 0,
            instance_calls: 0,
            type_calls: 0,
            login_calls: 0,
            logout_calls: 0,
        }
    }
}

impl MockPortal {
    pub fn sign_in_external(&mut self, user_id: &str) {
        self.user = Some(User {
            id: user_id.to_string(),
            kind: UserKind::ExternalIdentity,
        });
    }

    pub fn sign_in_anonymous(&mut self, user_id: &str) {
        self.user = Some(User {
            id: user_id.to_string(),
            kind: UserKind::Anonymous,
        });
    }

    pub fn set_instance(&mut self, status: Option<InstanceStatus>) {
        self.instance = status.map(|status| InstanceSummary {
            status,
            address: (status == InstanceStatus::Running).then(|| "10.0.0.4".to_string()),
        });
    }

    pub fn script_instance(&mut self, statuses: &[Option<InstanceStatus>]) {
        self.instance_script = statuses
            .iter()
            .map(|status| {
                status.map(|status| InstanceSummary {
                    status,
                    address: (status == InstanceStatus::Running)
                        .then(|| "10.0.0.4".to_string()),
                })
            })
            .collect();
    }
}

type Shared = Arc<Mutex<MockPortal>>;

pub struct MockServer {
    pub base_url: String,
    state: Shared,
}

impl MockServer {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockPortal::default()));
        let app = Router::new()
            .route("/api/configuration", get(configuration_handler))
            .route("/api/auth/me", get(current_session))
            .route("/api/auth/anonymous", post(login_anonymous))
            .route("/api/auth/logout", post(logout))
            .route("/api/instances", get(list_instances).post(create_instance))
            .route("/api/instance-types", get(list_instance_types))
            .route("/api/instances/{id}", delete(delete_instance))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Self {
            base_url: format!("http://{addr}/api"),
            state,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockPortal) -> R) -> R {
        let mut portal = self.state.lock().expect("lock");
        f(&mut *portal)
    }
}

pub fn configuration(methods: &[AuthMethod], auto_login: bool, persistence: bool) -> Configuration {
    Configuration {
        title: "Portal".to_string(),
        message: "Welcome".to_string(),
        logo_url: "/logo.webp".to_string(),
        terms_of_service_url: None,
        privacy_policy_url: None,
        auth_methods: methods.iter().copied().collect(),
        identity_provider_name: "Corp SSO".to_string(),
        auto_login_enabled: auto_login,
        persistence_enabled: persistence,
    }
}

pub fn instance(id: &str, type_id: &str, status: InstanceStatus) -> Instance {
    Instance {
        id: id.to_string(),
        name: format!("{type_id}-{id}"),
        type_id: type_id.to_string(),
        status,
        address: None,
    }
}

pub fn instance_type(id: &str, persistable: bool) -> InstanceType {
    InstanceType {
        id: id.to_string(),
        name: id.to_uppercase(),
        description: Some(format!("{id} desktop")),
        logo_url: None,
        persistable,
    }
}

pub fn unique_tmp_file(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}-{now}.json"))
}

fn api_error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Returns the signed-in user when the request carries the session marker.
fn authorize(portal: &mut MockPortal, headers: &HeaderMap) -> Option<User> {
    portal.last_selected_instance = cookie(headers, INSTANCE_MARKER).map(str::to_string);
    if cookie(headers, SESSION_MARKER) != Some(TOKEN) {
        return None;
    }
    portal.user.clone()
}

async fn configuration_handler(State(state): State<Shared>) -> Response {
    Json(state.lock().expect("lock").config.clone()).into_response()
}

async fn current_session(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut portal = state.lock().expect("lock");
    portal.session_calls += 1;
    if portal.session_fails {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "session_lookup_failed");
    }
    let Some(user) = authorize(&mut portal, &headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if let Some(next) = portal.instance_script.pop_front() {
        portal.instance = next;
    }
    Json(Session {
        user,
        instance: portal.instance.clone(),
    })
    .into_response()
}

async fn login_anonymous(State(state): State<Shared>) -> Response {
    let mut portal = state.lock().expect("lock");
    portal.login_calls += 1;
    if portal.login_fails {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "anonymous_login_failed");
    }
    portal.sign_in_anonymous("anon-1");
    let session = Session {
        user: portal.user.clone().expect("user just signed in"),
        instance: None,
    };
    (
        [(
            header::SET_COOKIE,
            format!("{SESSION_MARKER}={TOKEN}; Path=/; HttpOnly"),
        )],
        Json(session),
    )
        .into_response()
}

async fn logout(State(state): State<Shared>) -> Response {
    let mut portal = state.lock().expect("lock");
    portal.logout_calls += 1;
    if portal.logout_fails {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "logout_failed");
    }
    portal.user = None;
    portal.instance = None;
    (
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            format!("{SESSION_MARKER}=; Path=/; Max-Age=0"),
        )],
    )
        .into_response()
}

async fn list_instances(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut portal = state.lock().expect("lock");
    if authorize(&mut portal, &headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    portal.instance_calls += 1;
    if portal.instances_fail {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "list_failed");
    }
    Json(portal.instances.clone()).into_response()
}

async fn list_instance_types(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut portal = state.lock().expect("lock");
    if authorize(&mut portal, &headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    portal.type_calls += 1;
    Json(portal.types.clone()).into_response()
}

async fn create_instance(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(request): Json<CreateInstanceRequest>,
) -> Response {
    let delay = state.lock().expect("lock").create_delay;
    tokio::time::sleep(delay).await;
    let mut portal = state.lock().expect("lock");
    if authorize(&mut portal, &headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    portal.create_requests.push(request.clone());
    if let Some((status, code)) = portal.create_failure.clone() {
        let status = StatusCode::from_u16(status).expect("valid status");
        return api_error(status, &code);
    }
    let id = format!("i-{}", portal.instances.len() + 1);
    let created = instance(&id, &request.type_id, InstanceStatus::Pending);
    portal.instances.push(created.clone());
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn delete_instance(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut portal = state.lock().expect("lock");
    if authorize(&mut portal, &headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if portal.delete_fails {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "delete_failed");
    }
    let before = portal.instances.len();
    portal.instances.retain(|i| i.id != id);
    if portal.instances.len() == before {
        return api_error(StatusCode::NOT_FOUND, "instance_not_found");
    }
    portal.deleted.push(id);
    StatusCode::NO_CONTENT.into_response()
}
