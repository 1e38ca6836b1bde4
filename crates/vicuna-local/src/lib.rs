//! Client for a locally spawned Vicuna inference executable.
//!
//! This crate makes sure a llama.cpp style `main` binary and the model
//! weights are on disk, runs the binary in interactive instruct mode and
//! exchanges prompts and responses over its stdin/stdout.
//!
//! ## Usage
//!
//! ```ignore
//! use vicuna_local::{SessionOverrides, Vicuna};
//!
//! let vicuna = Vicuna::configure(
//!     SessionOverrides::new()
//!         .model("ggml-vicuna-7b-4bit-rev1")
//!         .on_token(|token| print!("{}", token)),
//! )?;
//!
//! vicuna.provision(false).await?;
//! vicuna.start().await?;
//! let answer = vicuna.send("Hello, I am Shubham").await?;
//! vicuna.stop().await;
//! ```

mod collector;
mod config;
mod error;
mod model;
pub mod paths;
mod provision;
mod session;

use std::sync::Arc;

pub use collector::{PromptMarker, ResponseCollector, ResponseTerminator, Progress, END_MARKER};
pub use config::{
    DecoderOptions, DecoderValue, SessionConfig, SessionOverrides, TokenCallback,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_STARTUP_TIMEOUT,
};
pub use error::{Result, VicunaError};
pub use model::ModelId;
pub use provision::{
    provision_missing, Asset, DownloadProgress, HttpProvisioner, Platform, ProgressCallback,
    Provision, SourceTable,
};
pub use session::{build_args, ProcessSession, SessionState, FIXED_ARGS};

/// A configured session together with the service that provisions its files.
pub struct Vicuna {
    session: ProcessSession,
    provisioner: Arc<dyn Provision>,
}

impl Vicuna {
    /// Resolve `overrides` into a configuration. Fails on unsupported models.
    pub fn configure(overrides: SessionOverrides) -> Result<Self> {
        Ok(Self::with_config(SessionConfig::resolve(overrides)?))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            session: ProcessSession::new(config),
            provisioner: Arc::new(HttpProvisioner::new()),
        }
    }

    /// Replace the default HTTP provisioner.
    pub fn with_provisioner(mut self, provisioner: impl Provision + 'static) -> Self {
        self.provisioner = Arc::new(provisioner);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        self.session.config()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Download missing files, or all of them when `force` is set.
    pub async fn provision(&self, force: bool) -> Result<Vec<Asset>> {
        provision_missing(self.provisioner.as_ref(), self.session.config(), force).await
    }

    pub async fn start(&self) -> Result<()> {
        self.session.start().await
    }

    pub async fn send(&self, prompt: &str) -> Result<String> {
        self.session.send(prompt).await
    }

    pub async fn stop(&self) {
        self.session.stop().await
    }
}
