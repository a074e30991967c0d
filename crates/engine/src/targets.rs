//! Target resolution for approvals, reviews and notifications.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use db::ObjectStore;

use crate::changeset::normalize_strings;
use crate::models::{TargetConfig, TargetType};
use crate::object::Object;
use crate::EngineError;

/// Resolves a dynamic target (e.g. `CONTROL_OWNER`) to user IDs.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, store: &dyn ObjectStore, owner_id: &str, object: &Object) -> Result<Vec<String>, EngineError>;
}

/// Reads user IDs from a string or string-list field of the object.
#[derive(Debug, Clone)]
pub struct FieldTargetResolver {
    pub field: String,
}

impl FieldTargetResolver {
    pub fn new(field: &str) -> Self {
        Self { field: field.to_string() }
    }
}

#[async_trait]
impl TargetResolver for FieldTargetResolver {
    async fn resolve(&self, store: &dyn ObjectStore, _owner_id: &str, object: &Object) -> Result<Vec<String>, EngineError> {
        let from_node = object
            .string_slice_field(&self.field)
            .or_else(|| object.string_field(&self.field).map(|v| vec![v]));
        if let Some(ids) = from_node {
            return Ok(ids);
        }

        // Objects built from refs carry no node; load it.
        let loaded = store.load_object(object.object_type.as_str(), &object.id).await?;
        Ok(match loaded.get(&self.field) {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// Name-keyed resolver map, safe for concurrent registration.
#[derive(Default)]
pub struct TargetResolverRegistry {
    resolvers: RwLock<HashMap<String, Arc<dyn TargetResolver>>>,
}

impl TargetResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resolver` under `key`, replacing any previous one.
    pub fn register(&self, key: &str, resolver: Arc<dyn TargetResolver>) {
        self.resolvers.write().insert(key.to_string(), resolver);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TargetResolver>> {
        self.resolvers.read().get(key).cloned()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.resolvers.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// User IDs a target expands to, trimmed and de-duplicated.
///
/// An unregistered resolver key resolves to nobody (with a warning) so one
/// misconfigured target does not fail its siblings.
pub async fn resolve_targets(
    registry: &TargetResolverRegistry,
    store: &dyn ObjectStore,
    owner_id: &str,
    target: &TargetConfig,
    object: &Object,
) -> Result<Vec<String>, EngineError> {
    let ids = match target.target_type {
        TargetType::User => vec![target.id.clone()],
        TargetType::Group => store.group_member_ids(owner_id, &target.id).await?,
        TargetType::Role => store.role_member_ids(owner_id, &target.id).await?,
        TargetType::Resolver => match registry.get(&target.resolver_key) {
            Some(resolver) => resolver.resolve(store, owner_id, object).await?,
            None => {
                warn!(resolver_key = %target.resolver_key, "no target resolver registered");
                Vec::new()
            }
        },
    };
    Ok(normalize_strings(ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryObjectStore;
    use serde_json::json;

    fn store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new();
        store.insert_object("Control", "c1", "org", json!({"owner_ids": ["u7", "u8", "u7"], "auditor_id": "u9"}));
        store.add_group_members("org", "g1", &["u1", " u2", "u1", ""]);
        store.add_role_members("org", "ADMIN", &["u3"]);
        store
    }

    #[tokio::test]
    async fn static_targets_expand() {
        let store = store();
        let reg = TargetResolverRegistry::new();
        let obj = Object::new("Control", "c1");

        let users = resolve_targets(&reg, &store, "org", &TargetConfig::user("u5"), &obj).await.unwrap();
        assert_eq!(users, vec!["u5"]);

        let group = resolve_targets(&reg, &store, "org", &TargetConfig::group("g1"), &obj).await.unwrap();
        assert_eq!(group, vec!["u1", "u2"]);

        let role = resolve_targets(&reg, &store, "org", &TargetConfig::role("ADMIN"), &obj).await.unwrap();
        assert_eq!(role, vec!["u3"]);

        let other_org = resolve_targets(&reg, &store, "org-2", &TargetConfig::group("g1"), &obj).await.unwrap();
        assert!(other_org.is_empty());
    }

    #[tokio::test]
    async fn resolver_targets_use_registry() {
        let store = store();
        let reg = TargetResolverRegistry::new();
        reg.register("CONTROL_OWNER", Arc::new(FieldTargetResolver::new("owner_ids")));
        reg.register("CONTROL_AUDITOR", Arc::new(FieldTargetResolver::new("auditor_id")));
        let obj = Object::new("Control", "c1");

        assert_eq!(reg.keys(), vec!["CONTROL_AUDITOR", "CONTROL_OWNER"]);

        let owners = resolve_targets(&reg, &store, "org", &TargetConfig::resolver("CONTROL_OWNER"), &obj)
            .await
            .unwrap();
        assert_eq!(owners, vec!["u7", "u8"]);

        let auditors = resolve_targets(&reg, &store, "org", &TargetConfig::resolver("CONTROL_AUDITOR"), &obj)
            .await
            .unwrap();
        assert_eq!(auditors, vec!["u9"]);

        let missing = resolve_targets(&reg, &store, "org", &TargetConfig::resolver("NOPE"), &obj)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
