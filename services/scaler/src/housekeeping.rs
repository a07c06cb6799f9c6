//! Stale bootstrap parameter cleanup.
//!
//! Machines consume their bootstrap parameter while booting. Anything left
//! under the token path past the retention window belongs to a machine that
//! never came up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::collaborators::ParameterStore;
use crate::config::HousekeepingConfig;
use crate::error::ScalerResult;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes bootstrap parameters older than the retention window.
pub struct ParameterHousekeeper {
    config: HousekeepingConfig,
    store: Arc<dyn ParameterStore>,
}

impl ParameterHousekeeper {
    pub fn new(config: HousekeepingConfig, store: Arc<dyn ParameterStore>) -> Self {
        Self { config, store }
    }

    pub async fn sweep(&self) -> ScalerResult<SweepStats> {
        self.sweep_at(Utc::now()).await
    }

    #[instrument(skip(self), fields(prefix = %self.config.token_path))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ScalerResult<SweepStats> {
        let cutoff = now - self.config.retention;
        let mut stats = SweepStats::default();
        let mut stale = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .store
                .list_by_prefix(&self.config.token_path, next_token.as_deref())
                .await?;
            stats.scanned += page.parameters.len();
            stale.extend(
                page.parameters
                    .into_iter()
                    .filter(|p| p.last_modified < cutoff)
                    .map(|p| p.path),
            );

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        for path in stale {
            match self.store.delete(&path).await {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete stale parameter");
                    stats.failed += 1;
                }
            }
        }

        info!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            failed = stats.failed,
            "Parameter sweep complete"
        );
        Ok(stats)
    }
}
