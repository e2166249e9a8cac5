//! Sequential step runner with a shared state bag.

use crate::client::Uploader;
use crate::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// User-facing output channel.
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);
    fn error(&self, message: &str);
}

/// Writes to the terminal and mirrors every line into the log.
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        tracing::info!("{}", message);
        println!("==> {}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
        eprintln!("==> {}", message);
    }
}

/// Data passed between steps of one build.
pub struct StateBag {
    config: Arc<Config>,
    ui: Arc<dyn Ui>,
    uploader: Option<Arc<dyn Uploader>>,
    download_path: Option<PathBuf>,
    iso_file: Option<String>,
    error: Option<anyhow::Error>,
}

impl StateBag {
    pub fn new(config: Arc<Config>, ui: Arc<dyn Ui>) -> Self {
        Self {
            config,
            ui,
            uploader: None,
            download_path: None,
            iso_file: None,
            error: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ui(&self) -> Arc<dyn Ui> {
        self.ui.clone()
    }

    pub fn put_uploader(&mut self, uploader: Arc<dyn Uploader>) {
        self.uploader = Some(uploader);
    }

    pub fn uploader(&self) -> Option<Arc<dyn Uploader>> {
        self.uploader.clone()
    }

    /// Local path of the ISO resolved by the download step.
    pub fn put_download_path(&mut self, path: PathBuf) {
        self.download_path = Some(path);
    }

    pub fn download_path(&self) -> Option<&Path> {
        self.download_path.as_deref()
    }

    /// Storage-relative ISO reference (`<pool>:iso/<name>`) for later steps.
    pub fn put_iso_file(&mut self, iso_file: String) {
        self.iso_file = Some(iso_file);
    }

    pub fn iso_file(&self) -> Option<&str> {
        self.iso_file.as_deref()
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    /// Record `err`, report it to the user and halt the build.
    pub fn halt(&mut self, err: anyhow::Error) -> StepAction {
        self.ui.error(&format!("{:#}", err));
        self.error = Some(err);
        StepAction::Halt
    }
}

/// One unit of work in a build.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &mut StateBag) -> StepAction;

    /// Release whatever `run` acquired. Called for every step that ran, in
    /// reverse order, whether the build halted or not.
    async fn cleanup(&self, _state: &mut StateBag) {}
}

/// Run `steps` in order until one halts, then clean up the steps that ran.
pub async fn run_steps(steps: &[Box<dyn Step>], state: &mut StateBag) -> Result<()> {
    let mut ran = 0;
    let mut halted = false;

    for step in steps {
        ran += 1;
        tracing::debug!("Running step {}", step.name());
        if step.run(state).await == StepAction::Halt {
            tracing::warn!("Step {} halted the build", step.name());
            halted = true;
            break;
        }
    }

    for step in steps[..ran].iter().rev() {
        tracing::debug!("Cleaning up step {}", step.name());
        step.cleanup(state).await;
    }

    if halted {
        return Err(state
            .take_error()
            .unwrap_or_else(|| anyhow!("Build halted without an error")));
    }
    Ok(())
}
