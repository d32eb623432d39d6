// Target resolution
// Maps user/group/role/resolver descriptors to concrete user ids

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::context::CallerContext;
use crate::models::{TargetConfig, TargetType, WorkflowObject};
use crate::{Result, WorkflowError};

/// Group and role membership lookups
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    async fn group_members(&self, org_id: &str, group_id: &str) -> Result<Vec<String>>;

    async fn role_members(&self, org_id: &str, role: &str) -> Result<Vec<String>>;
}

/// Directory kept in memory, for tests and the reference server
#[derive(Default)]
pub struct InMemoryDirectory {
    groups: RwLock<HashMap<(String, String), Vec<String>>>,
    roles: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group_member(&self, org_id: &str, group_id: &str, user_id: &str) -> Result<()> {
        let mut groups = self
            .groups
            .write()
            .map_err(|_| WorkflowError::Internal("directory lock poisoned".to_string()))?;
        groups
            .entry((org_id.to_string(), group_id.to_string()))
            .or_default()
            .push(user_id.to_string());
        Ok(())
    }

    pub fn add_role_member(&self, org_id: &str, role: &str, user_id: &str) -> Result<()> {
        let mut roles = self
            .roles
            .write()
            .map_err(|_| WorkflowError::Internal("directory lock poisoned".to_string()))?;
        roles
            .entry((org_id.to_string(), role.to_string()))
            .or_default()
            .push(user_id.to_string());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Directory for InMemoryDirectory {
    async fn group_members(&self, org_id: &str, group_id: &str) -> Result<Vec<String>> {
        let groups = self
            .groups
            .read()
            .map_err(|_| WorkflowError::Internal("directory lock poisoned".to_string()))?;
        Ok(groups
            .get(&(org_id.to_string(), group_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn role_members(&self, org_id: &str, role: &str) -> Result<Vec<String>> {
        let roles = self
            .roles
            .read()
            .map_err(|_| WorkflowError::Internal("directory lock poisoned".to_string()))?;
        Ok(roles
            .get(&(org_id.to_string(), role.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// What a named resolver function receives
pub struct ResolverRequest<'a> {
    pub caller: &'a CallerContext,
    pub object: &'a WorkflowObject,
}

/// A named resolver function
pub type ResolverFn = Arc<dyn Fn(&ResolverRequest<'_>) -> Result<Vec<String>> + Send + Sync>;

/// One resolved user and the descriptor that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub user_id: String,
    pub target_type: TargetType,
    pub group_id: Option<String>,
    pub resolver_key: Option<String>,
}

/// Resolves target descriptors against the directory and resolver registry
pub struct TargetResolver {
    directory: Arc<dyn Directory>,
    resolvers: HashMap<String, ResolverFn>,
}

fn string_field(object: &WorkflowObject, field: &str) -> Vec<String> {
    match object.field(field) {
        Some(Value::String(id)) if !id.is_empty() => vec![id.clone()],
        _ => Vec::new(),
    }
}

impl TargetResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            resolvers: HashMap::new(),
        }
    }

    /// Resolver with `object_creator` and `object_owner` registered
    pub fn with_builtin_resolvers(directory: Arc<dyn Directory>) -> Self {
        let mut resolver = Self::new(directory);
        resolver.register_resolver(
            "object_creator",
            Arc::new(|req: &ResolverRequest<'_>| -> Result<Vec<String>> {
                Ok(string_field(req.object, "created_by"))
            }),
        );
        resolver.register_resolver(
            "object_owner",
            Arc::new(|req: &ResolverRequest<'_>| -> Result<Vec<String>> {
                Ok(string_field(req.object, "owner_id"))
            }),
        );
        resolver
    }

    pub fn register_resolver(&mut self, key: impl Into<String>, resolver: ResolverFn) {
        self.resolvers.insert(key.into(), resolver);
    }

    pub fn resolver_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.resolvers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve every descriptor, de-duplicating users in first-seen order
    pub async fn resolve(
        &self,
        caller: &CallerContext,
        targets: &[TargetConfig],
        object: &WorkflowObject,
    ) -> Result<Vec<ResolvedTarget>> {
        let org_id = caller.org_id()?;
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for target in targets {
            target.validate()?;
            let id = target.id.clone().unwrap_or_default();
            let (users, group_id, resolver_key) = match target.target_type {
                TargetType::User => (vec![id], None, None),
                TargetType::Group => (self.directory.group_members(org_id, &id).await?, Some(id), None),
                TargetType::Role => (self.directory.role_members(org_id, &id).await?, None, None),
                TargetType::Resolver => {
                    let key = target.resolver_key.clone().unwrap_or_default();
                    let resolver = self
                        .resolvers
                        .get(&key)
                        .ok_or_else(|| WorkflowError::NotFound(format!("target resolver {}", key)))?;
                    let users = resolver(&ResolverRequest { caller, object })?;
                    (users, None, Some(key))
                }
            };

            for user in users {
                let user = user.trim().to_string();
                if user.is_empty() || !seen.insert(user.clone()) {
                    continue;
                }
                resolved.push(ResolvedTarget {
                    user_id: user,
                    target_type: target.target_type,
                    group_id: group_id.clone(),
                    resolver_key: resolver_key.clone(),
                });
            }
        }

        Ok(resolved)
    }

    /// Resolve to plain user ids
    pub async fn resolve_user_ids(
        &self,
        caller: &CallerContext,
        targets: &[TargetConfig],
        object: &WorkflowObject,
    ) -> Result<Vec<String>> {
        Ok(self
            .resolve(caller, targets, object)
            .await?
            .into_iter()
            .map(|t| t.user_id)
            .collect())
    }
}
