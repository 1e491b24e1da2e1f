//! Endpoint commands: `ls`, `status`, `enable`, `set`, `disable`, `open`
//!
//! These edit the endpoint store and read the daemon's status snapshot; the
//! running daemon picks the edits up on its next reload.

use super::{CommandContext, EndpointTarget};
use anyhow::{anyhow, Result};
use ngext_core::{
    validate, AuthState, ContainerRegistry, CoreError, EndpointConfig, EndpointOptions,
    EndpointStatus, EndpointStore, PortRow, Reconciler, ReconcilerSettings,
};

/// Option changes given on the command line; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionEdits {
    pub pooling: Option<bool>,
    pub description: Option<String>,
    pub metadata: Option<String>,
}

impl OptionEdits {
    pub fn apply(&self, mut options: EndpointOptions) -> EndpointOptions {
        if let Some(pooling) = self.pooling {
            options.pooling_enabled = pooling;
        }
        if let Some(description) = &self.description {
            options.description = description.clone();
        }
        if let Some(metadata) = &self.metadata {
            options.metadata = metadata.clone();
        }
        options.normalized()
    }
}

/// Port rows from the running daemon, or from a fresh container listing with
/// every tunnel shown as disabled when no daemon is running.
pub async fn port_rows(ctx: &CommandContext) -> Result<Vec<PortRow>> {
    if let Some(snapshot) = ctx.live_snapshot()? {
        if snapshot.auth.is_setup {
            return Ok(snapshot.rows);
        }
    }

    let mut registry = ContainerRegistry::new();
    registry.refresh(ctx.host.as_ref()).await?;
    let reconciler = Reconciler::new(
        ctx.service.clone(),
        ReconcilerSettings::from_config(&ctx.config),
    );
    Ok(registry.rows(&ctx.load_store()?, &reconciler))
}

/// List container ports and their tunnels
pub async fn list(ctx: &CommandContext, json: bool) -> Result<()> {
    let rows = port_rows(ctx).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No containers with exposed ports found.");
        return Ok(());
    }

    const NAME_WIDTH: usize = 24;
    const PORT_WIDTH: usize = 10;
    const STATUS_WIDTH: usize = 10;

    println!(
        "  {:<NAME_WIDTH$} {:<PORT_WIDTH$} {:<STATUS_WIDTH$} URL",
        "CONTAINER", "PORT", "STATUS"
    );
    println!("{}", "-".repeat(75));

    for row in rows {
        let symbol = match (row.tunnelable, row.status) {
            (false, _) => " ",
            (true, EndpointStatus::Active) => "●",
            (true, EndpointStatus::Pending) => "◐",
            (true, EndpointStatus::Error) => "✗",
            (true, EndpointStatus::Stopped) => "◌",
            (true, EndpointStatus::Disabled) => "○",
        };
        let port = format!("{}/{}", row.port, row.protocol);
        let status = if row.tunnelable {
            row.status.to_string()
        } else {
            "-".to_string()
        };
        let detail = match (&row.url, &row.error) {
            (_, Some(error)) => format!("{}: {}", error.kind, error.message),
            (Some(url), None) => url.clone(),
            (None, None) if row.orphan => "(container removed)".to_string(),
            (None, None) => String::new(),
        };
        println!(
            "{} {:<NAME_WIDTH$} {:<PORT_WIDTH$} {:<STATUS_WIDTH$} {}",
            symbol, row.container_name, port, status, detail
        );
    }

    Ok(())
}

/// Show auth, daemon and error state
pub async fn status(ctx: &CommandContext, json: bool) -> Result<()> {
    let snapshot = ctx.live_snapshot()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let mut auth = AuthState::new(ctx.host.clone(), ctx.service.clone());
    match auth.check_auth().await {
        Ok(status) if status.is_setup => println!("ngrok:  set up"),
        Ok(status) if status.has_token => println!(
            "ngrok:  token rejected ({}). Run 'ngext setup'.",
            auth.last_error().unwrap_or("unknown reason")
        ),
        Ok(_) => println!("ngrok:  not set up. Run 'ngext setup'."),
        Err(e) => println!("ngrok:  unknown ({})", e),
    }

    let Some(snapshot) = snapshot else {
        println!("daemon: not running. Start it with 'ngext run'.");
        return Ok(());
    };
    println!("daemon: running (pid {})", snapshot.pid);

    let tunneled: Vec<&PortRow> = snapshot.rows.iter().filter(|r| r.tunnelable).collect();
    let count = |status: EndpointStatus| tunneled.iter().filter(|r| r.status == status).count();
    println!(
        "tunnels: {} active, {} pending, {} error",
        count(EndpointStatus::Active),
        count(EndpointStatus::Pending) + count(EndpointStatus::Stopped),
        count(EndpointStatus::Error)
    );

    if !snapshot.banner.is_empty() {
        println!("\nErrors:");
        for entry in &snapshot.banner {
            println!(
                "  [{}] {}: {}",
                entry.at.format("%H:%M:%S"),
                entry.key,
                entry.message
            );
        }
    }
    Ok(())
}

/// Turn tunneling on for a container port
pub async fn enable(ctx: &CommandContext, target: &EndpointTarget, edits: &OptionEdits) -> Result<()> {
    ctx.require_setup().await?;
    let options = write_endpoint(ctx, target, edits, Some(true))?;
    println!(
        "Enabled tunnel for {} port {}{}",
        target.container_name,
        target.key.port,
        if options.pooling_enabled { " (pooling)" } else { "" }
    );
    report_daemon(ctx)
}

/// Change the options of a container port
pub async fn set(ctx: &CommandContext, target: &EndpointTarget, edits: &OptionEdits) -> Result<()> {
    ctx.require_setup().await?;
    write_endpoint(ctx, target, edits, None)?;
    println!(
        "Updated options for {} port {}",
        target.container_name, target.key.port
    );
    report_daemon(ctx)
}

/// Turn tunneling off; stored options are kept
pub async fn disable(ctx: &CommandContext, target: &EndpointTarget) -> Result<()> {
    let changed = EndpointStore::update_at(&ctx.paths.store, |store| {
        match store.get_mut(&target.key) {
            Some(config) if config.enabled => {
                config.enabled = false;
                config.updated_at = chrono::Utc::now();
                true
            }
            _ => false,
        }
    })?;

    if changed {
        println!(
            "Disabled tunnel for {} port {}",
            target.container_name, target.key.port
        );
        report_daemon(ctx)
    } else {
        println!(
            "Tunnel for {} port {} is not enabled",
            target.container_name, target.key.port
        );
        Ok(())
    }
}

/// Open the public URL of an active tunnel; returns the URL
pub async fn open(ctx: &CommandContext, target: &EndpointTarget) -> Result<String> {
    let snapshot = ctx
        .live_snapshot()?
        .ok_or_else(|| anyhow!("The ngext daemon is not running. Start it with 'ngext run'."))?;
    let url = snapshot
        .row(&target.key)
        .and_then(|row| row.url.clone())
        .ok_or_else(|| CoreError::NotActive(format!("{}:{}", target.container_name, target.key.port)))?;

    ctx.host.open_external(&url).await?;
    println!("Opened {}", url);
    Ok(url)
}

/// Merge `edits` into the stored endpoint and save it under the store lock
fn write_endpoint(
    ctx: &CommandContext,
    target: &EndpointTarget,
    edits: &OptionEdits,
    enabled: Option<bool>,
) -> Result<EndpointOptions> {
    let result = EndpointStore::update_at(&ctx.paths.store, |store| {
        let current = store.get(&target.key);
        let options = edits.apply(current.map(|c| c.options.clone()).unwrap_or_default());
        validate(&options)?;

        let enabled = enabled.unwrap_or_else(|| current.is_some_and(|c| c.enabled));
        store.upsert(EndpointConfig::new(
            &target.key,
            target.container_name.as_str(),
            enabled,
            options.clone(),
        ));
        Ok::<_, CoreError>(options)
    })?;
    Ok(result?)
}

fn report_daemon(ctx: &CommandContext) -> Result<()> {
    if ctx.live_snapshot()?.is_none() {
        println!("The ngext daemon is not running; start it with 'ngext run' to apply this.");
    }
    Ok(())
}
