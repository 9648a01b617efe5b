use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision value used before any revision has been observed.
pub const INVALID_REVISION: i64 = -1;

// ============================================================================
// Resource Types
// ============================================================================

/// Kind of managed resource a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "/v1/service_brokers")]
    ServiceBroker,
    #[serde(rename = "/v1/service_offerings")]
    ServiceOffering,
    #[serde(rename = "/v1/service_plans")]
    ServicePlan,
    #[serde(rename = "/v1/service_instances")]
    ServiceInstance,
    #[serde(rename = "/v1/service_bindings")]
    ServiceBinding,
    #[serde(rename = "/v1/visibilities")]
    Visibility,
    #[serde(rename = "/v1/platforms")]
    Platform,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::ServiceBroker => "/v1/service_brokers",
            ResourceType::ServiceOffering => "/v1/service_offerings",
            ResourceType::ServicePlan => "/v1/service_plans",
            ResourceType::ServiceInstance => "/v1/service_instances",
            ResourceType::ServiceBinding => "/v1/service_bindings",
            ResourceType::Visibility => "/v1/visibilities",
            ResourceType::Platform => "/v1/platforms",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ServiceManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "/v1/service_brokers" => Ok(ResourceType::ServiceBroker),
            "/v1/service_offerings" => Ok(ResourceType::ServiceOffering),
            "/v1/service_plans" => Ok(ResourceType::ServicePlan),
            "/v1/service_instances" => Ok(ResourceType::ServiceInstance),
            "/v1/service_bindings" => Ok(ResourceType::ServiceBinding),
            "/v1/visibilities" => Ok(ResourceType::Visibility),
            "/v1/platforms" => Ok(ResourceType::Platform),
            other => Err(ServiceManagerError::invalid_value("resource", other)),
        }
    }
}

/// Operation that produced a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Created,
    Updated,
    Deleted,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Created => "CREATED",
            OperationType::Updated => "UPDATED",
            OperationType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ServiceManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(OperationType::Created),
            "UPDATED" => Ok(OperationType::Updated),
            "DELETED" => Ok(OperationType::Deleted),
            other => Err(ServiceManagerError::invalid_value("type", other)),
        }
    }
}

// ============================================================================
// Label Changes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOperation {
    Add,
    AddValues,
    Remove,
    RemoveValues,
}

/// A single label modification carried by an update notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub op: LabelOperation,
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

// ============================================================================
// Core Notification Types
// ============================================================================

/// A committed change to a managed resource.
///
/// Instances are shared between consumer queues behind an `Arc` and are never
/// mutated once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub resource: ResourceType,
    #[serde(rename = "type")]
    pub operation: OperationType,
    /// `None` means the notification is broadcast to every platform
    pub platform_id: Option<String>,
    pub revision: i64,
    pub new_state: Option<serde_json::Value>,
    pub old_state: Option<serde_json::Value>,
    #[serde(default)]
    pub label_changes: Vec<LabelChange>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        resource: ResourceType,
        operation: OperationType,
        platform_id: Option<String>,
        revision: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource,
            operation,
            platform_id: platform_id.filter(|id| !id.is_empty()),
            revision,
            new_state: None,
            old_state: None,
            label_changes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.platform_id.is_none()
    }
}

/// Consumer identity of a notification stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: String,
    #[serde(rename = "type")]
    pub platform_type: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, Vec<String>>,
}

impl Platform {
    pub fn new(id: impl Into<String>, platform_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            platform_type: platform_type.into(),
            name: name.into(),
            description: None,
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.entry(key.into()).or_default().push(value.into());
        self
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceManagerError {
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceManagerError {
    pub fn invalid_value(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceManagerError>;
