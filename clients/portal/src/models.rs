use portal_domain::{Instance, InstanceType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(rename = "type")]
    pub type_id: String,
    pub persistent: bool,
}

/// An instance as listed on the dashboard. `type_info` is absent when the
/// catalog has no entry for the instance's type (or failed to load).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceEntry {
    pub instance: Instance,
    pub type_info: Option<InstanceType>,
}

impl InstanceEntry {
    pub fn type_label(&self) -> &str {
        self.type_info
            .as_ref()
            .map(|ty| ty.name.as_str())
            .unwrap_or(self.instance.type_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_uses_wire_field_names() {
        let body = serde_json::to_value(CreateInstanceRequest {
            type_id: "ubuntu".to_string(),
            persistent: false,
        })
        .expect("encode");
        assert_eq!(body, serde_json::json!({"type": "ubuntu", "persistent": false}));
    }
}
