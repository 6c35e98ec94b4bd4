//! Role catalog collaborator
//!
//! Role definitions and their briefing material live outside the
//! orchestrator. [`RoleCatalog`] is the seam a deployment plugs its own
//! provider into; [`StaticRoleCatalog`] is the in-memory implementation
//! used by default and in tests.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolved definition of an agent role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleProfile {
    /// Role identifier, e.g. `"engineer"`
    pub role: String,
    /// Capabilities every agent of this role carries
    pub capabilities: Vec<String>,
    /// System prompt material handed to the agent runner at spawn
    pub system_prompt: String,
}

impl RoleProfile {
    pub fn new(
        role: impl Into<String>,
        capabilities: Vec<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            capabilities,
            system_prompt: system_prompt.into(),
        }
    }
}

/// Provider of role definitions consulted during agent spawn
#[async_trait]
pub trait RoleCatalog: Send + Sync {
    /// Resolve a role name to its profile.
    ///
    /// Unknown roles fail with a not-found error; spawn rejects them
    /// synchronously.
    async fn resolve(&self, role: &str) -> Result<RoleProfile>;

    /// Role names this catalog can resolve
    async fn roles(&self) -> Vec<String>;
}

/// Fixed in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticRoleCatalog {
    profiles: HashMap<String, RoleProfile>,
}

impl StaticRoleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the builtin roles
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.insert(RoleProfile::new(
            "coordinator",
            vec!["planning".to_string(), "review".to_string()],
            "You coordinate a team of agents. Break work down, assign it, and \
             track progress to completion.",
        ));
        catalog.insert(RoleProfile::new(
            "engineer",
            vec!["code".to_string(), "test".to_string()],
            "You implement assigned tasks in an isolated workspace. Keep changes \
             focused and report progress as you go.",
        ));
        catalog.insert(RoleProfile::new(
            "reviewer",
            vec!["review".to_string()],
            "You review completed work for correctness and consistency. Report \
             findings instead of making changes yourself.",
        ));
        catalog.insert(RoleProfile::new(
            "tester",
            vec!["test".to_string()],
            "You exercise completed work and report defects with reproduction \
             steps.",
        ));
        catalog
    }

    /// Add or replace a role profile
    pub fn insert(&mut self, profile: RoleProfile) {
        self.profiles.insert(profile.role.clone(), profile);
    }
}

#[async_trait]
impl RoleCatalog for StaticRoleCatalog {
    async fn resolve(&self, role: &str) -> Result<RoleProfile> {
        self.profiles
            .get(role)
            .cloned()
            .ok_or_else(|| Error::not_found("Role", role))
    }

    async fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.profiles.keys().cloned().collect();
        roles.sort();
        roles
    }
}
