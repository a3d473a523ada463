//! VCS connection configuration resolution
//!
//! An in-process registry of the active integration per project. The
//! registry is populated at startup (and on re-authentication, which
//! replaces the whole value) by the platform's integration layer;
//! resolution is a pure lookup plus one-time normalization.

use crate::traits::VcsConfigStore;
use crate::{CoreError, Result};
use codecrow_protocol::{ProjectId, VcsConnectionConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Registry of active VCS integrations, keyed by project
#[derive(Default)]
pub struct VcsConfigRegistry {
    configs: RwLock<HashMap<ProjectId, VcsConnectionConfig>>,
}

impl VcsConfigRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the integration for a project
    pub fn register(&self, project: ProjectId, config: VcsConnectionConfig) {
        debug!(%project, provider = config.provider_name(), "registered VCS integration");
        self.configs.write().insert(project, config);
    }
}

impl VcsConfigStore for VcsConfigRegistry {
    /// Resolve the active configuration for a project
    ///
    /// GitLab configurations come back with `base_url` already replaced
    /// by [`VcsConnectionConfig::effective_base_url`], so downstream
    /// code never has to distinguish self-hosted from gitlab.com.
    fn resolve(&self, project: ProjectId) -> Result<VcsConnectionConfig> {
        let configs = self.configs.read();
        let config = configs
            .get(&project)
            .ok_or(CoreError::ConfigNotFound(project))?;

        Ok(match config {
            VcsConnectionConfig::GitLab {
                access_token,
                group_id,
                allowed_repos,
                ..
            } => VcsConnectionConfig::GitLab {
                access_token: access_token.clone(),
                group_id: group_id.clone(),
                allowed_repos: allowed_repos.clone(),
                base_url: config.effective_base_url(),
            },
            other => other.clone(),
        })
    }

    fn remove(&self, project: ProjectId) {
        self.configs.write().remove(&project);
    }
}
