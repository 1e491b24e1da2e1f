//! `ngext run`: the long-running sync loop

use super::CommandContext;
use anyhow::Result;
use ngext_core::AppShell;
use std::future::Future;

/// Run until Ctrl-C, then tear every tunnel down
pub async fn run(ctx: CommandContext) -> Result<()> {
    run_until(ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Run the daemon until `shutdown` resolves
pub async fn run_until<F>(ctx: CommandContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let CommandContext {
        config,
        host,
        service,
        paths,
    } = ctx;

    let mut shell = AppShell::open(config, host, service, paths)?;
    shell.start().await;
    if shell.is_setup() {
        println!(
            "ngext is running with {} container(s). Press Ctrl-C to stop.",
            shell.registry().containers().len()
        );
    } else {
        println!("ngrok is not set up yet. Run 'ngext setup' in another terminal; waiting.");
    }

    let remaining = shell.run_until(shutdown).await;
    if remaining.is_empty() {
        println!("All tunnels stopped.");
    } else {
        for key in remaining {
            eprintln!("Warning: tunnel for {} may still be running", key);
        }
    }
    Ok(())
}
