//! Seams to the outside world: who runs an activity and who breaks ties.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use being_memory::{ActivityResult, State};

use crate::registry::ActivityDescriptor;
use crate::shared_data::SharedData;

/// Runs one selected activity.  A returned `Err` is recorded as a failed
/// result; it never aborts the scheduler.
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
    async fn execute(
        &self,
        descriptor: &ActivityDescriptor,
        scope: &SharedData,
    ) -> Result<ActivityResult>;
}

/// Picks one name out of a set of equally scored candidates.  Called with a
/// bounded timeout; answers outside the offered set are ignored.
#[async_trait]
pub trait RankingService: Send + Sync {
    async fn rank(&self, tied: &[ActivityDescriptor], state: &State) -> Result<String>;
}

/// Ranking service for deployments without one; every tie uses the
/// deterministic fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRanking;

#[async_trait]
impl RankingService for UnavailableRanking {
    async fn rank(&self, _tied: &[ActivityDescriptor], _state: &State) -> Result<String> {
        bail!("no ranking service configured")
    }
}

/// Executor that performs nothing and records a successful no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl ActivityExecutor for DryRunExecutor {
    async fn execute(
        &self,
        descriptor: &ActivityDescriptor,
        _scope: &SharedData,
    ) -> Result<ActivityResult> {
        Ok(ActivityResult::success_result(json!({
            "dry_run": true,
            "activity": descriptor.name,
        })))
    }
}
