//! CLI for the micropod micro-VM container runtime.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod image;
mod run;
mod vm;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use micropod::Config;

#[derive(Parser)]
#[command(name = "micropod", version, about = "Micro-VM container runtime powered by Firecracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull, provision, and boot an image as a micro-VM.
    Run(run::RunArgs),

    /// List running VMs.
    #[command(visible_alias = "ls")]
    List,

    /// Stop one or more running VMs.
    Stop(vm::StopArgs),

    /// Print (optionally follow) a VM's console log.
    Logs(vm::LogsArgs),

    /// Pull an OCI image from a registry.
    Pull {
        /// Image reference (e.g., library/alpine:latest).
        image: String,
    },

    /// List locally stored images.
    Images {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove one or more locally stored images.
    Rmi {
        /// Image references to remove.
        #[arg(required = true, num_args = 1..)]
        images: Vec<String>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list/images commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = Config::resolve();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = Cli::parse().dispatch(config).await {
        eprintln!("micropod: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self, config: Config) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run(config).await,
            Command::List => vm::list(config).await,
            Command::Stop(args) => vm::stop(config, args).await,
            Command::Logs(args) => vm::logs(config, args).await,
            Command::Pull { image } => image::pull(&config, &image).await,
            Command::Images { format } => image::images(&config, format),
            Command::Rmi { images } => image::rmi(&config, &images),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "micropod", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}
