//! The `ActionExecutor` trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ActionError;

/// Everything an executor needs to perform one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub instance_id: Uuid,
    pub owner_id: String,
    pub action_key: String,
    pub action_type: String,
    pub action_index: usize,
    pub object_type: String,
    pub object_id: String,
    /// Raw action params from the definition, after template replacement.
    pub params: Value,
    /// Resolved recipient user IDs (for `NOTIFY`-style actions).
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Values available to `{{name}}` templates.
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
}

/// A host-provided implementation of one action type.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform the side effect and return its JSON result.
    async fn execute(&self, request: &ActionRequest) -> Result<Value, ActionError>;
}
