use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod lifecycle;
pub mod policy;

pub const DEFAULT_IDENTITY_PROVIDER_NAME: &str = "OpenID Connect";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Terminating,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminating => "terminating",
        }
    }

    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Pending | Self::Terminating)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserKind {
    #[serde(rename = "openid_connect")]
    ExternalIdentity,
    #[serde(rename = "anonymous")]
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: UserKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSummary {
    pub status: InstanceStatus,
    #[serde(rename = "pod_ip", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Server-asserted identity plus at most one owned instance. A response
/// without a user never becomes a `Session`; callers hold `Option<Session>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceSummary>,
}

impl Session {
    pub fn instance_status(&self) -> Option<InstanceStatus> {
        self.instance.as_ref().map(|instance| instance.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_id: String,
    pub status: InstanceStatus,
    #[serde(rename = "pod_ip", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceType {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub persistable: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthMethod {
    #[serde(rename = "oidc")]
    ExternalIdentity,
    #[serde(rename = "anonymous")]
    Anonymous,
}

impl AuthMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "oidc" => Some(Self::ExternalIdentity),
            "anonymous" => Some(Self::Anonymous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub logo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_auth_methods")]
    pub auth_methods: BTreeSet<AuthMethod>,
    #[serde(rename = "oidc_name", default = "default_identity_provider_name")]
    pub identity_provider_name: String,
    #[serde(rename = "auth_auto_login", default)]
    pub auto_login_enabled: bool,
    #[serde(rename = "enable_persistence", default)]
    pub persistence_enabled: bool,
}

fn default_identity_provider_name() -> String {
    DEFAULT_IDENTITY_PROVIDER_NAME.to_string()
}

// Unknown method names are dropped.
fn deserialize_auth_methods<'de, D>(deserializer: D) -> Result<BTreeSet<AuthMethod>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().filter_map(|m| AuthMethod::parse(m)).collect())
}
