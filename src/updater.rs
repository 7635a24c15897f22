//! Self-update version checking (spec §4.8 item 7, SPEC_FULL §4.6 "Version/
//! update-check payload"). The updater's mechanism — downloading and
//! applying a new build — is an external collaborator (spec §1); the core
//! only schedules the check and serves `gateway_version`/`gateway_update`.

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Applied { version: String },
    Failed(String),
}

#[async_trait]
pub trait UpdateChecker: Send + Sync {
    fn current_version(&self) -> String;
    async fn check_latest_version(&self) -> anyhow::Result<String>;
    async fn apply_update(&self) -> anyhow::Result<UpdateOutcome>;
}

/// A no-op checker for embeddings that don't wire up a real updater: always
/// reports itself as current.
pub struct NoopUpdateChecker {
    version: String,
}

impl NoopUpdateChecker {
    pub fn new(version: impl Into<String>) -> Self {
        NoopUpdateChecker {
            version: version.into(),
        }
    }
}

#[async_trait]
impl UpdateChecker for NoopUpdateChecker {
    fn current_version(&self) -> String {
        self.version.clone()
    }

    async fn check_latest_version(&self) -> anyhow::Result<String> {
        Ok(self.version.clone())
    }

    async fn apply_update(&self) -> anyhow::Result<UpdateOutcome> {
        Ok(UpdateOutcome::UpToDate)
    }
}
