//! Ask command - send prompts to a fresh session and print the responses.

use vicuna_local::{SessionOverrides, Vicuna};

pub(crate) async fn run(overrides: SessionOverrides, prompts: &[String]) -> miette::Result<()> {
    let vicuna = Vicuna::configure(overrides).map_err(|e| miette::miette!("{}", e))?;

    println!("Loading {}...", vicuna.config().model());
    vicuna
        .start()
        .await
        .map_err(|e| miette::miette!("Failed to start session: {}", e))?;

    let mut outcome = Ok(());
    for prompt in prompts {
        match vicuna.send(prompt).await {
            Ok(response) => {
                println!("Prompt: {}", prompt);
                println!("Response: {}", response.trim());
                println!();
            }
            Err(e) => {
                outcome = Err(miette::miette!("Prompt failed: {}", e));
                break;
            }
        }
    }

    vicuna.stop().await;
    outcome
}
