//! Pass-scoped coordinator cache.

use std::collections::HashMap;

use fleet_reconcile::RegisteredRunner;

use crate::collaborators::{Coordinator, CoordinatorError, InstallationAuth, RunnerScope};

/// Installation tokens and runner listings for one reconciliation pass.
///
/// Built empty at the start of every pass and dropped at its end, so no
/// listing outlives the pass that fetched it.
#[derive(Debug, Default)]
pub struct PassCache {
    auth: HashMap<RunnerScope, InstallationAuth>,
    runners: HashMap<RunnerScope, Vec<RegisteredRunner>>,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn auth(
        &mut self,
        coordinator: &dyn Coordinator,
        scope: &RunnerScope,
    ) -> Result<InstallationAuth, CoordinatorError> {
        if let Some(auth) = self.auth.get(scope) {
            return Ok(auth.clone());
        }

        let auth = coordinator.installation_auth(scope, None).await?;
        self.auth.insert(scope.clone(), auth.clone());
        Ok(auth)
    }

    /// Registered runners of `scope`, listed once per pass.
    pub async fn runners(
        &mut self,
        coordinator: &dyn Coordinator,
        scope: &RunnerScope,
    ) -> Result<Vec<RegisteredRunner>, CoordinatorError> {
        if let Some(runners) = self.runners.get(scope) {
            return Ok(runners.clone());
        }

        let auth = self.auth(coordinator, scope).await?;
        let runners = coordinator.list_runners(&auth, scope).await?;
        self.runners.insert(scope.clone(), runners.clone());
        Ok(runners)
    }

    pub fn scopes_listed(&self) -> usize {
        self.runners.len()
    }
}
