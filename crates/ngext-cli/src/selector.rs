//! Interactive endpoint selector for CLI commands

use crate::commands::EndpointTarget;
use anyhow::{bail, Result};
use dialoguer::{theme::ColorfulTheme, Select};
use ngext_core::{EndpointStatus, PortRow};
use std::io::IsTerminal;

/// Which container ports a command can act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionContext {
    /// Ports without a tunnel (for enable)
    Disabled,
    /// Ports with tunneling turned on (for disable)
    Enabled,
    /// Ports with a public URL (for open)
    Active,
    /// Any tunnelable port (for set)
    Any,
}

impl SelectionContext {
    /// Filter rows based on selection context
    pub fn filter<'a>(&self, rows: &'a [PortRow]) -> Vec<&'a PortRow> {
        rows.iter()
            .filter(|r| r.tunnelable && self.matches(r))
            .collect()
    }

    fn matches(&self, row: &PortRow) -> bool {
        match self {
            SelectionContext::Disabled => !row.enabled,
            SelectionContext::Enabled => row.enabled || row.orphan,
            SelectionContext::Active => row.status == EndpointStatus::Active,
            SelectionContext::Any => true,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            SelectionContext::Disabled => "untunneled",
            SelectionContext::Enabled => "enabled",
            SelectionContext::Active => "active",
            SelectionContext::Any => "tunnelable",
        }
    }
}

fn label(row: &PortRow) -> String {
    match &row.url {
        Some(url) => format!("{} :{}  {}", row.container_name, row.port, url),
        None => format!("{} :{}  ({})", row.container_name, row.port, row.status),
    }
}

/// Interactively select a container port, narrowed to `container` if given.
///
/// Returns an error if cancelled, not on a TTY, or nothing matches.
pub fn select_endpoint(
    rows: &[PortRow],
    container: Option<&str>,
    context: SelectionContext,
    prompt: &str,
) -> Result<EndpointTarget> {
    let candidates: Vec<&PortRow> = context
        .filter(rows)
        .into_iter()
        .filter(|r| {
            container.map_or(true, |c| {
                r.container_name == c || r.key.container_id.0.starts_with(c)
            })
        })
        .collect();

    if candidates.is_empty() {
        bail!(
            "No {} container ports found. Use 'ngext ls' to see all ports.",
            context.description()
        );
    }

    let chosen = if let [only] = candidates.as_slice() {
        *only
    } else {
        if !std::io::stdin().is_terminal() {
            bail!("Cannot show interactive selector: not a TTY. Specify container and port as arguments.");
        }
        let items: Vec<String> = candidates.iter().map(|r| label(r)).collect();
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .items(&items)
            .default(0)
            .interact_opt()?;
        match selection {
            Some(index) => candidates[index],
            None => bail!("Selection cancelled"),
        }
    };

    Ok(EndpointTarget {
        key: chosen.key.clone(),
        container_name: chosen.container_name.clone(),
    })
}
