use crate::config::Config;
use crate::multistep::{run_steps, StateBag, Step, Ui};
use crate::steps::{StepConnect, StepDownloadIso, StepUploadIso};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

/// What a finished build leaves behind for later stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Storage-relative ISO reference, e.g. `local:iso/ubuntu.iso`
    pub iso_file: String,
    pub node: String,
}

pub struct Builder {
    config: Arc<Config>,
}

impl Builder {
    /// Validate `config` and prepare a builder for it.
    pub fn new(config: Config) -> Result<Self> {
        config.prepare()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn steps(&self) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(StepConnect),
            Box::new(StepDownloadIso),
            Box::new(StepUploadIso),
        ]
    }

    pub async fn run(&self, ui: Arc<dyn Ui>) -> Result<Artifact> {
        let mut state = StateBag::new(self.config.clone(), ui);

        tracing::info!(
            "Starting build on node {} ({} steps)",
            self.config.node,
            self.steps().len()
        );
        run_steps(&self.steps(), &mut state).await?;

        let iso_file = state
            .iso_file()
            .ok_or_else(|| anyhow!("Build finished without an ISO reference"))?
            .to_string();

        Ok(Artifact {
            iso_file,
            node: self.config.node.clone(),
        })
    }
}
