//! CLI commands.

use clap::Args;
use std::path::PathBuf;
use vicuna_local::{DecoderValue, SessionOverrides};

pub mod ask;
pub mod chat;
pub mod info;
pub mod pull;

/// Session settings shared by every command.
///
/// Flags win over the JSON config file, which wins over `VICUNA_*` variables.
#[derive(Args, Debug, Default)]
pub(crate) struct SessionArgs {
    /// JSON file with session settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model identifier (default: ggml-vicuna-7b-4bit-rev1)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Path to the model weights
    #[arg(long, global = true)]
    model_path: Option<PathBuf>,

    /// Path to the inference executable
    #[arg(long, global = true)]
    executable: Option<PathBuf>,

    /// Directory holding the executable and weights (default: ~/.vicuna-ts)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Run a model that is not in the supported list
    #[arg(long, global = true)]
    allow_unsupported: bool,

    /// Milliseconds of silence that end a response
    #[arg(long, global = true)]
    idle_timeout_ms: Option<u64>,

    /// Extra decoder flag passed to the executable, e.g. `-o top_p=0.9`
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", global = true)]
    options: Vec<String>,
}

impl SessionArgs {
    /// Combine environment, config file and flags into one set of overrides.
    pub(crate) fn overrides(&self) -> miette::Result<SessionOverrides> {
        let mut layered = SessionOverrides::from_env();

        if let Some(path) = &self.config {
            let file = SessionOverrides::from_json_file(path)
                .map_err(|e| miette::miette!("Failed to load {}: {}", path.display(), e))?;
            layered = layered.merge(file);
        }

        let mut flags = SessionOverrides {
            model: self.model.clone(),
            model_path: self.model_path.clone(),
            executable_path: self.executable.clone(),
            data_dir: self.data_dir.clone(),
            idle_timeout_ms: self.idle_timeout_ms,
            allow_unsupported_model: self.allow_unsupported.then_some(true),
            ..SessionOverrides::default()
        };

        for option in &self.options {
            let (key, value) = parse_option(option)?;
            flags = flags.decoder_option(key, value);
        }

        Ok(layered.merge(flags))
    }
}

fn parse_option(option: &str) -> miette::Result<(String, DecoderValue)> {
    let (key, value) = option
        .split_once('=')
        .ok_or_else(|| miette::miette!("Expected KEY=VALUE, got: {}", option))?;

    let key = key.trim().trim_start_matches("--");
    if key.is_empty() {
        return Err(miette::miette!("Empty option name in: {}", option));
    }

    Ok((key.to_string(), DecoderValue::parse(value)))
}
