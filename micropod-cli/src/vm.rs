//! VM lifecycle commands: list, stop, logs.

use anyhow::Result;
use micropod::{Config, Controller};

/// Arguments for `micropod stop`.
#[derive(clap::Args)]
pub struct StopArgs {
    /// VM IDs to stop.
    #[arg(required = true, num_args = 1..)]
    pub targets: Vec<String>,
}

/// Arguments for `micropod logs`.
#[derive(clap::Args)]
pub struct LogsArgs {
    /// VM ID.
    pub target: String,

    /// Keep printing new output as it's written.
    #[arg(short = 'f', long)]
    pub follow: bool,
}

pub async fn list(config: Config) -> Result<()> {
    let controller = Controller::open(config)?;
    let vms = controller.list_vms().await?;

    println!("{:<14} {:<20} {:<10} IMAGE", "ID", "STATE", "PID");
    for vm in &vms {
        println!("{:<14} {:<20?} {:<10} {}", vm.id, vm.state, vm.firecracker_pid, vm.image_ref);
    }
    Ok(())
}

pub async fn stop(config: Config, args: StopArgs) -> Result<()> {
    let controller = Controller::open(config)?;
    let mut errors = Vec::new();

    for target in &args.targets {
        match controller.stop_vm(target).await {
            Ok(()) => println!("{target}"),
            Err(e) => errors.push(format!("{target}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{}", errors.join("\n"))
    }
}

pub async fn logs(config: Config, args: LogsArgs) -> Result<()> {
    let controller = Controller::open(config)?;
    let mut stdout = tokio::io::stdout();
    controller.logs(&args.target, args.follow, &mut stdout).await?;
    Ok(())
}
