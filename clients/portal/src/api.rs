use crate::auth::SessionMarkers;
use crate::models::CreateInstanceRequest;
use portal_domain::{Configuration, Instance, InstanceType, Session};
use reqwest::{Method, StatusCode, header};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Gateway to the portal API. Cheap to clone; clones share the marker jar.
#[derive(Debug, Clone)]
pub struct PortalApi {
    base_url: String,
    client: reqwest::Client,
    markers: Arc<Mutex<SessionMarkers>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("request failed status={status} code={code}")]
    RequestFailed { status: u16, code: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorPayload {
    error: String,
}

impl PortalApi {
    pub fn new(base_url: String) -> Self {
        Self::with_markers(base_url, SessionMarkers::default())
    }

    pub fn with_markers(base_url: String, markers: SessionMarkers) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            markers: Arc::new(Mutex::new(markers)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn markers(&self) -> SessionMarkers {
        self.jar().clone()
    }

    pub fn replace_markers(&self, markers: SessionMarkers) {
        *self.jar() = markers;
    }

    pub fn select_instance(&self, instance_id: Option<String>) {
        self.jar().selected_instance_id = instance_id;
    }

    pub fn forget_session(&self) {
        self.jar().session_id = None;
    }

    pub fn authorize_url(&self, provider: &str) -> String {
        format!("{}/auth/{provider}/authorize", self.base_url)
    }

    /// Issues one request. `Ok(None)` means the server answered 401: there is
    /// no session. An empty success body is `Ok(Some(Value::Null))`.
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, FetchError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(cookie) = self.jar().cookie_header() {
            builder = builder.header(header::COOKIE, cookie);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_transport)?;
        self.absorb_set_cookie(&response);

        let status = response.status();
        debug!(%method, endpoint, status = status.as_u16(), "portal api call");
        if status == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(map_api_error(response).await);
        }

        let bytes = response.bytes().await.map_err(map_transport)?;
        if bytes.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    pub async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>, FetchError> {
        match self.call(method, endpoint, body).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| FetchError::Decode(e.to_string())),
        }
    }

    pub async fn configuration(&self) -> Result<Configuration, FetchError> {
        self.fetch(Method::GET, "configuration", None)
            .await?
            .ok_or_else(unauthenticated)
    }

    pub async fn current_session(&self) -> Result<Option<Session>, FetchError> {
        self.fetch(Method::GET, "auth/me", None).await
    }

    pub async fn login_anonymous(&self) -> Result<Option<Session>, FetchError> {
        self.fetch(Method::POST, "auth/anonymous", None).await
    }

    pub async fn logout(&self) -> Result<(), FetchError> {
        self.call(Method::POST, "auth/logout", None).await.map(|_| ())
    }

    pub async fn list_instances(&self) -> Result<Option<Vec<Instance>>, FetchError> {
        self.fetch(Method::GET, "instances", None).await
    }

    pub async fn list_instance_types(&self) -> Result<Option<Vec<InstanceType>>, FetchError> {
        self.fetch(Method::GET, "instance-types", None).await
    }

    pub async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Option<Instance>, FetchError> {
        let body = serde_json::to_value(request).map_err(|e| FetchError::Decode(e.to_string()))?;
        self.fetch(Method::POST, "instances", Some(&body)).await
    }

    pub async fn delete_instance(&self, instance_id: &str) -> Result<Option<()>, FetchError> {
        self.call(Method::DELETE, &format!("instances/{instance_id}"), None)
            .await
            .map(|reply| reply.map(|_| ()))
    }

    fn absorb_set_cookie(&self, response: &reqwest::Response) {
        let mut jar = self.jar();
        for value in response.headers().get_all(header::SET_COOKIE) {
            if let Ok(raw) = value.to_str()
                && jar.apply_set_cookie(raw)
            {
                debug!("session marker updated by server");
            }
        }
    }

    fn jar(&self) -> MutexGuard<'_, SessionMarkers> {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn unauthenticated() -> FetchError {
    FetchError::RequestFailed {
        status: StatusCode::UNAUTHORIZED.as_u16(),
        code: "unauthenticated".to_string(),
    }
}

async fn map_api_error(response: reqwest::Response) -> FetchError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let code = serde_json::from_str::<ErrorPayload>(&body)
        .map(|v| v.error)
        .unwrap_or_else(|_| "unknown_error".to_string());
    FetchError::RequestFailed { status, code }
}

fn map_transport(err: reqwest::Error) -> FetchError {
    FetchError::Unreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockServer, TOKEN};

    #[tokio::test]
    async fn unauthenticated_session_is_none_not_error() {
        let server = MockServer::start().await;
        let api = PortalApi::new(server.base_url.clone());
        let session = api.current_session().await.expect("401 is not an error");
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn session_cookie_is_sent_and_session_decoded() {
        let server = MockServer::start().await;
        server.with(|m| m.sign_in_external("user-7"));
        let api = PortalApi::with_markers(
            server.base_url.clone(),
            SessionMarkers {
                session_id: Some(TOKEN.to_string()),
                selected_instance_id: None,
            },
        );
        let session = api
            .current_session()
            .await
            .expect("call")
            .expect("session");
        assert_eq!(session.user.id, "user-7");
    }

    #[tokio::test]
    async fn server_error_is_request_failure_with_code() {
        let server = MockServer::start().await;
        server.with(|m| m.session_fails = true);
        let api = PortalApi::new(server.base_url.clone());
        let err = api.current_session().await.expect_err("500 must fail");
        assert_eq!(
            err,
            FetchError::RequestFailed {
                status: 500,
                code: "session_lookup_failed".to_string()
            }
        );
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn unreachable_server_is_distinguished() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let api = PortalApi::new(format!("http://{addr}/api"));
        let err = api.current_session().await.expect_err("nothing listens");
        assert!(matches!(err, FetchError::Unreachable(_)));
    }

    #[tokio::test]
    async fn login_captures_session_marker_from_set_cookie() {
        let server = MockServer::start().await;
        let api = PortalApi::new(server.base_url.clone());
        let session = api
            .login_anonymous()
            .await
            .expect("login")
            .expect("session");
        assert_eq!(session.user.id, "anon-1");
        assert_eq!(api.markers().session_id.as_deref(), Some(TOKEN));

        let clone = api.clone();
        assert!(clone.current_session().await.expect("me").is_some());
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start().await;
        let api = PortalApi::new(server.base_url.clone());
        let reply = api
            .call(Method::POST, "auth/logout", None)
            .await
            .expect("logout");
        assert_eq!(reply, Some(Value::Null));
    }

    #[test]
    fn authorize_url_is_relative_to_api_base() {
        let api = PortalApi::new("http://portal.local/_hakoniwa/api/".to_string());
        assert_eq!(
            api.authorize_url("oidc"),
            "http://portal.local/_hakoniwa/api/auth/oidc/authorize"
        );
    }
}
