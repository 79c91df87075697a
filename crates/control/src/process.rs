use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::AppDescriptor;

/// Contract with the external process manager that spawns and kills the
/// controlled applications. Whether that is a remote shell or a cluster
/// scheduler is opaque here; the tree only consumes spawn, kill and liveness.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn boot(&self, descriptors: &[Arc<AppDescriptor>], timeout: Duration) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
    async fn is_alive(&self, app: &str) -> bool;
    async fn ping(&self, app: &str) -> bool;
}

/// Default collaborator for a controller that was not given a process
/// manager: booting fails, nothing is ever alive.
pub struct MissingProcessManager;

#[async_trait]
impl ProcessManager for MissingProcessManager {
    async fn boot(&self, descriptors: &[Arc<AppDescriptor>], _timeout: Duration) -> Result<()> {
        Err(anyhow!(
            "no process manager is attached; cannot boot {} applications",
            descriptors.len()
        ))
    }

    async fn terminate(&self) -> Result<()> {
        Err(anyhow!("no process manager is attached"))
    }

    async fn is_alive(&self, _app: &str) -> bool {
        false
    }

    async fn ping(&self, _app: &str) -> bool {
        false
    }
}
