//! Chat command - interactive conversation over stdin.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use vicuna_local::{SessionOverrides, Vicuna, VicunaError, END_MARKER};

pub(crate) async fn run(overrides: SessionOverrides) -> miette::Result<()> {
    let overrides = overrides.on_token(|token| {
        let mut out = std::io::stdout().lock();
        if token == END_MARKER {
            let _ = writeln!(out);
        } else {
            let _ = write!(out, "{}", token);
        }
        let _ = out.flush();
    });

    let vicuna = Vicuna::configure(overrides).map_err(|e| miette::miette!("{}", e))?;

    println!("Loading {}...", vicuna.config().model());
    vicuna
        .start()
        .await
        .map_err(|e| miette::miette!("Failed to start session: {}", e))?;
    println!("Ready. Type /exit or press Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(miette::miette!("Failed to read input: {}", e)),
        };

        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "/exit" {
            break Ok(());
        }

        match vicuna.send(prompt).await {
            Ok(_) => {}
            Err(VicunaError::NotReady) | Err(VicunaError::ProcessExited) => {
                break Err(miette::miette!("The model process exited"));
            }
            Err(e) => eprintln!("error: {}", e),
        }
    };

    vicuna.stop().await;
    outcome
}
