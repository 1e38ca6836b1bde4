//! Info command - show the resolved configuration.

use vicuna_local::{build_args, Asset, Platform, SessionConfig, SessionOverrides, SourceTable};

pub(crate) fn run(overrides: SessionOverrides) -> miette::Result<()> {
    let config = SessionConfig::resolve(overrides).map_err(|e| miette::miette!("{}", e))?;

    println!("Vicuna Local Configuration");
    println!("==========================");
    println!();
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("Data directory:   {}", config.data_dir().display());
    println!();
    println!("Model:            {}", config.model());
    println!("  Supported:      {}", config.model().is_supported());
    println!("  Weights:        {}", config.model_path().display());
    println!("  Installed:      {}", config.model_path().exists());
    println!();

    let platform = Platform::current();
    let downloadable = SourceTable::default()
        .resolve(&Asset::Executable, &platform)
        .is_ok();
    println!("Executable:       {}", config.executable_path().display());
    println!("  Installed:      {}", config.executable_path().exists());
    println!("  Downloadable:   {} ({})", downloadable, platform);
    println!();

    println!("Idle timeout:     {:?}", config.idle_timeout());
    println!("Startup timeout:  {:?}", config.startup_timeout());
    if config.decoder_options().is_empty() {
        println!("Decoder options:  (none)");
    } else {
        println!("Decoder options:");
        for (key, value) in config.decoder_options() {
            println!("  --{} {}", key, value);
        }
    }
    println!();

    let args: Vec<String> = build_args(&config)
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    println!("Command line:");
    println!("  {} {}", config.executable_path().display(), args.join(" "));

    Ok(())
}
