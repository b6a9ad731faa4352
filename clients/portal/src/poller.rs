use crate::api::{FetchError, PortalApi};
use crate::models::InstanceEntry;
use portal_domain::{Instance, InstanceType};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Updated,
    Unauthenticated,
}

/// Instance list plus the per-session type catalog. The list is replaced
/// wholesale on every well-formed response; a failed poll leaves it intact.
#[derive(Debug, Default)]
pub struct InstancePoller {
    instances: Vec<Instance>,
    loaded: bool,
    catalog: Option<Vec<InstanceType>>,
    catalog_owner: Option<String>,
}

impl InstancePoller {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn catalog(&self) -> &[InstanceType] {
        self.catalog.as_deref().unwrap_or_default()
    }

    pub fn instance_type(&self, type_id: &str) -> Option<&InstanceType> {
        self.catalog().iter().find(|ty| ty.id == type_id)
    }

    pub fn needs_catalog(&self, user_id: &str) -> bool {
        self.catalog.is_none() || self.catalog_owner.as_deref() != Some(user_id)
    }

    pub fn entries(&self) -> Vec<InstanceEntry> {
        merge_catalog(&self.instances, self.catalog())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub async fn ensure_catalog(
        &mut self,
        api: &PortalApi,
        user_id: &str,
    ) -> Result<PollOutcome, FetchError> {
        if !self.needs_catalog(user_id) {
            return Ok(PollOutcome::Updated);
        }
        match api.list_instance_types().await? {
            Some(types) => {
                debug!(count = types.len(), user_id, "instance type catalog loaded");
                self.catalog = Some(types);
                self.catalog_owner = Some(user_id.to_string());
                Ok(PollOutcome::Updated)
            }
            None => Ok(PollOutcome::Unauthenticated),
        }
    }

    /// Fetches the instance list and, once per user, the type catalog. A
    /// catalog failure is logged and retried on the next poll.
    pub async fn poll(&mut self, api: &PortalApi, user_id: &str) -> Result<PollOutcome, FetchError> {
        match self.ensure_catalog(api, user_id).await {
            Ok(PollOutcome::Updated) => {}
            Ok(PollOutcome::Unauthenticated) => return Ok(PollOutcome::Unauthenticated),
            Err(err) => warn!(%err, "instance type catalog unavailable"),
        }

        match api.list_instances().await? {
            Some(instances) => {
                self.instances = instances;
                self.loaded = true;
                Ok(PollOutcome::Updated)
            }
            None => Ok(PollOutcome::Unauthenticated),
        }
    }
}

pub fn merge_catalog(instances: &[Instance], catalog: &[InstanceType]) -> Vec<InstanceEntry> {
    let by_id = catalog
        .iter()
        .map(|ty| (ty.id.as_str(), ty))
        .collect::<HashMap<_, _>>();
    instances
        .iter()
        .map(|instance| InstanceEntry {
            instance: instance.clone(),
            type_info: by_id.get(instance.type_id.as_str()).map(|ty| (*ty).clone()),
        })
        .collect()
}
