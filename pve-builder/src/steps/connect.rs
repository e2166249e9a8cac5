use crate::client;
use crate::multistep::{StateBag, Step, StepAction};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

/// Builds the authenticated Proxmox client and shares it with later steps.
pub struct StepConnect;

#[async_trait]
impl Step for StepConnect {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn run(&self, state: &mut StateBag) -> StepAction {
        let result = client::connect(state.config())
            .await
            .context("Failed to connect to Proxmox");

        match result {
            Ok(client) => {
                state.put_uploader(Arc::new(client));
                StepAction::Continue
            }
            Err(e) => state.halt(e),
        }
    }
}
