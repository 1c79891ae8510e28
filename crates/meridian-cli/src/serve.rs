//! Serve command implementation for Meridian CLI.
//!
//! Starts the routing server backed by shell kernels.

use std::path::PathBuf;
use std::sync::Arc;

use meridian_core::{EventBus, ShellKernels};
use meridian_server::{DependencyConfig, ServerConfig};

use crate::colors;

/// Command-line settings for `meridian serve`.
#[derive(Debug)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub kernel_spec: String,
    pub workdir: Option<PathBuf>,
    pub allow_commands: Vec<String>,
}

impl ServeOptions {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        if let Some(dir) = &self.workdir {
            if !dir.is_dir() {
                anyhow::bail!("Working directory not found: {}", dir.display());
            }
        }

        let mut dependency = DependencyConfig {
            kernel_spec: self.kernel_spec,
            working_dir: self.workdir,
            ..DependencyConfig::default()
        };
        if !self.allow_commands.is_empty() {
            dependency.allowed_commands = self.allow_commands;
        }

        Ok(ServerConfig {
            host: self.host,
            port: self.port,
            token: self.token,
            dependency,
        })
    }
}

/// Start the routing server and block until Ctrl+C.
pub async fn execute(options: ServeOptions) -> anyhow::Result<()> {
    let config = options.into_config()?;

    println!("\n{}Meridian Server{} - Kernel Session Router", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Server:{} http://{}:{}",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!(
        "{}  ◆ Dependencies:{} {} ({})",
        colors::CYAN,
        colors::RESET,
        config.dependency.kernel_spec,
        config.dependency.allowed_commands.join(", ")
    );
    if config.token.is_none() {
        println!(
            "{}  ◆ Access:{} open (no token set)",
            colors::YELLOW,
            colors::RESET
        );
    }
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    let bus = EventBus::new();
    let kernels = Arc::new(ShellKernels::new(bus.clone()));
    meridian_server::serve(config, bus, kernels).await?;

    Ok(())
}
