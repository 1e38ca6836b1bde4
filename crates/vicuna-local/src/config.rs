//! Session configuration.
//!
//! A [`SessionConfig`] is always produced by [`SessionConfig::resolve`], which
//! layers user supplied [`SessionOverrides`] over the defaults and validates the
//! model identifier. Overrides can be built in code, read from `VICUNA_*`
//! environment variables or loaded from a JSON file, and merged together.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::warn;

use crate::collector::{PromptMarker, ResponseTerminator};
use crate::error::{Result, VicunaError};
use crate::model::ModelId;
use crate::paths;

/// Quiet period after which a response is considered complete.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(4000);

/// Upper bound on how long loading the model may take.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Callback receiving every output chunk, then the end marker.
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Extra generation flags forwarded to the executable, in insertion order.
pub type DecoderOptions = IndexMap<String, DecoderValue>;

/// Scalar value of a decoder option.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DecoderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl DecoderValue {
    /// Infer a value from command-line text.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Ok(b) = text.parse::<bool>() {
            DecoderValue::Bool(b)
        } else if let Ok(i) = text.parse::<i64>() {
            DecoderValue::Int(i)
        } else if let Ok(f) = text.parse::<f64>() {
            DecoderValue::Float(f)
        } else {
            DecoderValue::Text(text.to_string())
        }
    }
}

impl fmt::Display for DecoderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderValue::Bool(b) => write!(f, "{}", b),
            DecoderValue::Int(i) => write!(f, "{}", i),
            DecoderValue::Float(x) => write!(f, "{}", x),
            DecoderValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for DecoderValue {
    fn from(value: bool) -> Self {
        DecoderValue::Bool(value)
    }
}

impl From<i32> for DecoderValue {
    fn from(value: i32) -> Self {
        DecoderValue::Int(value.into())
    }
}

impl From<i64> for DecoderValue {
    fn from(value: i64) -> Self {
        DecoderValue::Int(value)
    }
}

impl From<f64> for DecoderValue {
    fn from(value: f64) -> Self {
        DecoderValue::Float(value)
    }
}

impl From<&str> for DecoderValue {
    fn from(value: &str) -> Self {
        DecoderValue::Text(value.to_string())
    }
}

impl From<String> for DecoderValue {
    fn from(value: String) -> Self {
        DecoderValue::Text(value)
    }
}

/// User supplied settings. Every unset field falls back to its default.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    pub model: Option<String>,
    pub executable_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub decoder_options: DecoderOptions,
    pub allow_unsupported_model: Option<bool>,
    pub force_download: Option<bool>,
    pub idle_timeout_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,
    #[serde(skip)]
    pub on_token: Option<TokenCallback>,
    #[serde(skip)]
    pub terminator: Option<Arc<dyn ResponseTerminator>>,
}

impl SessionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `VICUNA_*` environment variables.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v == "1" || v.to_lowercase() == "true")
        };

        Self {
            model: std::env::var("VICUNA_MODEL").ok(),
            executable_path: std::env::var("VICUNA_EXECUTABLE").ok().map(PathBuf::from),
            model_path: std::env::var("VICUNA_MODEL_PATH").ok().map(PathBuf::from),
            data_dir: std::env::var("VICUNA_HOME").ok().map(PathBuf::from),
            allow_unsupported_model: flag("VICUNA_ALLOW_UNSUPPORTED"),
            idle_timeout_ms: env_number("VICUNA_IDLE_TIMEOUT_MS"),
            startup_timeout_ms: env_number("VICUNA_STARTUP_TIMEOUT_MS"),
            ..Self::default()
        }
    }

    /// Load overrides from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VicunaError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Layer `other` over `self`. Fields set in `other` win; decoder options
    /// are combined with `other` replacing values of shared keys.
    pub fn merge(mut self, other: SessionOverrides) -> Self {
        self.model = other.model.or(self.model);
        self.executable_path = other.executable_path.or(self.executable_path);
        self.model_path = other.model_path.or(self.model_path);
        self.data_dir = other.data_dir.or(self.data_dir);
        self.allow_unsupported_model = other.allow_unsupported_model.or(self.allow_unsupported_model);
        self.force_download = other.force_download.or(self.force_download);
        self.idle_timeout_ms = other.idle_timeout_ms.or(self.idle_timeout_ms);
        self.startup_timeout_ms = other.startup_timeout_ms.or(self.startup_timeout_ms);
        self.on_token = other.on_token.or(self.on_token);
        self.terminator = other.terminator.or(self.terminator);
        self.decoder_options.extend(other.decoder_options);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn decoder_option(mut self, key: impl Into<String>, value: impl Into<DecoderValue>) -> Self {
        self.decoder_options.insert(key.into(), value.into());
        self
    }

    pub fn allow_unsupported_model(mut self, allow: bool) -> Self {
        self.allow_unsupported_model = Some(allow);
        self
    }

    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = Some(force);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn on_token(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_token = Some(Arc::new(callback));
        self
    }

    pub fn terminator(mut self, terminator: impl ResponseTerminator + 'static) -> Self {
        self.terminator = Some(Arc::new(terminator));
        self
    }
}

impl fmt::Debug for SessionOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOverrides")
            .field("model", &self.model)
            .field("executable_path", &self.executable_path)
            .field("model_path", &self.model_path)
            .field("data_dir", &self.data_dir)
            .field("decoder_options", &self.decoder_options)
            .field("allow_unsupported_model", &self.allow_unsupported_model)
            .field("force_download", &self.force_download)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("startup_timeout_ms", &self.startup_timeout_ms)
            .field("on_token", &self.on_token.is_some())
            .finish_non_exhaustive()
    }
}

fn env_number(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", name, value);
            None
        }
    }
}

/// Fully resolved, immutable session parameters.
#[derive(Clone)]
pub struct SessionConfig {
    model: ModelId,
    executable_path: PathBuf,
    model_path: PathBuf,
    data_dir: PathBuf,
    decoder_options: DecoderOptions,
    force_download: bool,
    idle_timeout: Duration,
    startup_timeout: Duration,
    on_token: TokenCallback,
    terminator: Arc<dyn ResponseTerminator>,
}

impl SessionConfig {
    /// Merge `overrides` onto the defaults and validate the result.
    pub fn resolve(overrides: SessionOverrides) -> Result<Self> {
        let allow_unsupported = overrides.allow_unsupported_model.unwrap_or(false);
        let model = match overrides.model.as_deref() {
            Some(id) => ModelId::parse(id, allow_unsupported)?,
            None => ModelId::default(),
        };

        let data_dir = match overrides.data_dir {
            Some(dir) => dir,
            None => paths::default_data_dir().ok_or_else(|| {
                VicunaError::Config(
                    "could not determine home directory; set data_dir explicitly".to_string(),
                )
            })?,
        };

        let executable_path = overrides
            .executable_path
            .unwrap_or_else(|| paths::executable_path(&data_dir));
        let model_path = overrides
            .model_path
            .unwrap_or_else(|| paths::model_path(&data_dir, model.as_str()));

        Ok(Self {
            model,
            executable_path,
            model_path,
            data_dir,
            decoder_options: overrides.decoder_options,
            force_download: overrides.force_download.unwrap_or(false),
            idle_timeout: overrides
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            startup_timeout: overrides
                .startup_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT),
            on_token: overrides
                .on_token
                .unwrap_or_else(|| Arc::new(|_: &str| {}) as TokenCallback),
            terminator: overrides
                .terminator
                .unwrap_or_else(|| Arc::new(PromptMarker) as Arc<dyn ResponseTerminator>),
        })
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn decoder_options(&self) -> &DecoderOptions {
        &self.decoder_options
    }

    pub fn force_download(&self) -> bool {
        self.force_download
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn on_token(&self) -> &TokenCallback {
        &self.on_token
    }

    pub fn terminator(&self) -> &Arc<dyn ResponseTerminator> {
        &self.terminator
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("model", &self.model)
            .field("executable_path", &self.executable_path)
            .field("model_path", &self.model_path)
            .field("data_dir", &self.data_dir)
            .field("decoder_options", &self.decoder_options)
            .field("force_download", &self.force_download)
            .field("idle_timeout", &self.idle_timeout)
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}
