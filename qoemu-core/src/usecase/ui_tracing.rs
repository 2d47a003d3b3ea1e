use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::interaction::{Interaction, InteractionRunner};
use super::UseCaseResult;
use crate::device::MobileDevice;

/// Replays an arbitrary interaction list and traces the final UI tree.
#[derive(Debug, Clone, Default)]
pub struct UiTracing {
    prepare: Vec<Interaction>,
    execute: Vec<Interaction>,
}

impl UiTracing {
    pub fn new(prepare: Vec<Interaction>, execute: Vec<Interaction>) -> Self {
        Self { prepare, execute }
    }

    pub(super) async fn prepare(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
    ) -> UseCaseResult<()> {
        runner.run(device, &self.prepare).await
    }

    pub(super) async fn execute(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
        duration: Duration,
    ) -> UseCaseResult<()> {
        let deadline = Instant::now() + duration;
        runner.run(device, &self.execute).await?;
        sleep_until(deadline).await;
        let nodes = device.dump_ui().await?;
        for node in &nodes {
            debug!(
                id = %node.resource_id,
                text = %node.text,
                desc = %node.content_desc,
                class = %node.class,
                "ui node"
            );
        }
        Ok(())
    }
}
