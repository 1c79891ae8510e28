//! Meridian CLI - kernel-session routing server.

mod colors;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "meridian")]
#[command(about = "Route kernel and notebook events to WebSocket clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Host address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Token clients must pass to open a WebSocket
        #[arg(long)]
        token: Option<String>,

        /// Kernel spec that runs dependency commands
        #[arg(long, default_value = "python3")]
        kernel_spec: String,

        /// Working directory for the dependency kernel
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Tool clients may invoke on the dependency channel (repeatable)
        #[arg(long = "allow-command")]
        allow_commands: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            token,
            kernel_spec,
            workdir,
            allow_commands,
        } => {
            let options = serve::ServeOptions {
                host,
                port,
                token,
                kernel_spec,
                workdir,
                allow_commands,
            };
            serve::execute(options).await?;
        }
    }

    Ok(())
}
