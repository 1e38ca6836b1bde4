//! Pull command - download the executable and model weights.

use vicuna_local::{SessionOverrides, Vicuna};

pub(crate) async fn run(overrides: SessionOverrides, force: bool) -> miette::Result<()> {
    let vicuna = Vicuna::configure(overrides).map_err(|e| miette::miette!("{}", e))?;
    let config = vicuna.config();

    println!("Model:      {}", config.model());
    println!("Weights:    {}", config.model_path().display());
    println!("Executable: {}", config.executable_path().display());
    println!();

    if !force && config.model_path().exists() && config.executable_path().exists() {
        println!("Everything is already installed.");
        return Ok(());
    }

    println!("This may take a while depending on your connection...");
    println!();

    let fetched = vicuna
        .provision(force)
        .await
        .map_err(|e| miette::miette!("Failed to download: {}", e))?;

    println!();
    for asset in fetched {
        println!("Downloaded {}", asset);
    }

    Ok(())
}
