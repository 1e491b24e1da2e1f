//! `ngext setup`

use super::CommandContext;
use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Password};
use ngext_core::AuthState;
use std::io::IsTerminal;

/// Store a validated ngrok auth token, prompting for it when not given.
pub async fn setup(ctx: &CommandContext, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => {
            if !std::io::stdin().is_terminal() {
                bail!("No token given and stdin is not a terminal. Run 'ngext setup <TOKEN>'.");
            }
            Password::with_theme(&ColorfulTheme::default())
                .with_prompt("ngrok auth token")
                .interact()?
        }
    };

    let mut auth = AuthState::new(ctx.host.clone(), ctx.service.clone());
    // Loads the current status so an unchanged token is not validated again
    if let Err(e) = auth.check_auth().await {
        tracing::debug!("Could not check the current token: {}", e);
    }
    auth.complete_setup(&token).await?;
    println!("ngrok is set up.");
    Ok(())
}

/// Forget the stored token
pub async fn reset(ctx: &CommandContext, yes: bool) -> Result<()> {
    if !yes && std::io::stdin().is_terminal() {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Remove the stored ngrok auth token?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let mut auth = AuthState::new(ctx.host.clone(), ctx.service.clone());
    auth.reset().await?;
    println!("Stored ngrok auth token removed.");
    Ok(())
}
