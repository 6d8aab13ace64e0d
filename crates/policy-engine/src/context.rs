use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything the engine knows about one action on one resource.
///
/// Only `resource` is ever modified by the engine, and only by mutating
/// rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyContext {
    pub action: String,
    pub environment: String,
    pub resource_type: String,
    #[serde(default)]
    pub resource: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub principal_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PolicyContext {
    pub fn new(
        resource_type: impl Into<String>,
        action: impl Into<String>,
        environment: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            action: action.into(),
            environment: environment.into(),
            resource_type: resource_type.into(),
            resource,
            tenant_id: None,
            principal_id: None,
            principal_roles: Vec::new(),
            metadata: BTreeMap::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Build a context from a typed domain object, converting it to the
    /// value model once.
    pub fn for_resource<T: Serialize>(
        resource_type: impl Into<String>,
        action: impl Into<String>,
        environment: impl Into<String>,
        resource: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(resource)?;
        Ok(Self::new(resource_type, action, environment, value))
    }

    /// Read the (possibly mutated) resource back into a typed object.
    pub fn resource_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.resource)
    }

    pub fn with_principal<I, S>(mut self, id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.principal_id = Some(id.into());
        self.principal_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Key under which metrics for this context are recorded.
    pub fn metrics_key(&self) -> String {
        format!("{}:{}", self.resource_type, self.action)
    }
}
