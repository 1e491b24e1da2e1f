//! ngext - expose Docker containers through ngrok tunnels

use clap::{Parser, Subcommand};
use ngext_cli::commands::{self, CommandContext, EndpointTarget, OptionEdits};
use ngext_cli::selector::{select_endpoint, SelectionContext};
use ngext_config::GlobalConfig;
use ngext_core::ShellPaths;
use ngext_provider::{create_host, create_tunnel_service};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ngext")]
#[command(author, version, about = "Expose Docker containers through ngrok tunnels", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Default)]
struct OptionArgs {
    /// Load balance across every endpoint sharing this URL (`--pooling false` to turn off)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pooling: Option<bool>,
    /// Free-text description shown by ngrok
    #[arg(long)]
    description: Option<String>,
    /// Opaque metadata string attached to the tunnel
    #[arg(long)]
    metadata: Option<String>,
}

impl From<OptionArgs> for OptionEdits {
    fn from(args: OptionArgs) -> Self {
        OptionEdits {
            pooling: args.pooling,
            description: args.description,
            metadata: args.metadata,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Store and validate the ngrok auth token
    Setup {
        /// Auth token (prompted for if not given)
        token: Option<String>,
        /// Remove the stored token instead
        #[arg(long)]
        reset: bool,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show auth, daemon and tunnel error state
    Status {
        /// Print the daemon snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List container ports and their tunnels
    #[command(alias = "list")]
    Ls {
        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start tunneling a container port
    Enable {
        /// Container name or ID (interactive selection if not specified)
        container: Option<String>,
        /// Container port
        port: Option<u16>,
        #[command(flatten)]
        options: OptionArgs,
    },

    /// Change tunnel options of a container port
    Set {
        /// Container name or ID (interactive selection if not specified)
        container: Option<String>,
        /// Container port
        port: Option<u16>,
        #[command(flatten)]
        options: OptionArgs,
    },

    /// Stop tunneling a container port
    Disable {
        /// Container name or ID (interactive selection if not specified)
        container: Option<String>,
        /// Container port
        port: Option<u16>,
    },

    /// Open the public URL of a container port in the browser
    Open {
        /// Container name or ID (interactive selection if not specified)
        container: Option<String>,
        /// Container port
        port: Option<u16>,
    },

    /// Keep tunnels in sync with the endpoint configuration until Ctrl-C
    Run,

    /// Show or edit global configuration
    Config {
        /// Open config in editor
        #[arg(short, long)]
        edit: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Config command works without Docker or ngrok
    if let Commands::Config { edit } = cli.command {
        return commands::config(edit).await;
    }

    let config = GlobalConfig::load()?;
    let data_dir = GlobalConfig::data_dir()?;
    let host = create_host(&config, &data_dir).await?;
    let service = create_tunnel_service(&config)?;
    let paths = ShellPaths::from_data_dir()?;
    let ctx = CommandContext::new(config, host, service, paths);

    match cli.command {
        Commands::Setup { token, reset, yes } => {
            if reset {
                commands::reset(&ctx, yes).await?;
            } else {
                commands::setup(&ctx, token).await?;
            }
        }
        Commands::Status { json } => commands::status(&ctx, json).await?,
        Commands::Ls { json } => commands::list(&ctx, json).await?,
        Commands::Enable {
            container,
            port,
            options,
        } => {
            let target = target(
                &ctx,
                container,
                port,
                SelectionContext::Disabled,
                "Select container port to tunnel:",
            )
            .await?;
            commands::enable(&ctx, &target, &options.into()).await?;
        }
        Commands::Set {
            container,
            port,
            options,
        } => {
            let target = target(
                &ctx,
                container,
                port,
                SelectionContext::Any,
                "Select container port to configure:",
            )
            .await?;
            commands::set(&ctx, &target, &options.into()).await?;
        }
        Commands::Disable { container, port } => {
            let target = target(
                &ctx,
                container,
                port,
                SelectionContext::Enabled,
                "Select tunnel to disable:",
            )
            .await?;
            commands::disable(&ctx, &target).await?;
        }
        Commands::Open { container, port } => {
            let target = target(
                &ctx,
                container,
                port,
                SelectionContext::Active,
                "Select tunnel to open:",
            )
            .await?;
            commands::open(&ctx, &target).await?;
        }
        Commands::Run => commands::run(ctx).await?,
        Commands::Config { .. } => unreachable!(), // Handled above
    }

    Ok(())
}

/// Resolve the command line container/port, falling back to a selector
async fn target(
    ctx: &CommandContext,
    container: Option<String>,
    port: Option<u16>,
    context: SelectionContext,
    prompt: &str,
) -> anyhow::Result<EndpointTarget> {
    match (container, port) {
        (Some(container), Some(port)) => {
            let allow_stored = matches!(context, SelectionContext::Enabled | SelectionContext::Any);
            commands::resolve_target(ctx, &container, port, allow_stored).await
        }
        (container, _) => {
            let rows = commands::port_rows(ctx).await?;
            select_endpoint(&rows, container.as_deref(), context, prompt)
        }
    }
}
