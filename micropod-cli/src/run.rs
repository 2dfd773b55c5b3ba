//! `micropod run`.

use anyhow::Result;
use micropod::{Config, Controller, Strategy};

/// Arguments for `micropod run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Image reference (e.g., library/alpine:latest).
    pub image: String,

    /// Publish a port: `<host>:<guest>`. May be repeated.
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,

    /// Rootfs strategy.
    #[arg(long, default_value = "flat-dir")]
    pub strategy: StrategyArg,
}

/// `clap`-facing mirror of [`micropod::Strategy`].
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum StrategyArg {
    /// Unpack the image into a directory, shared with the guest over virtio-fs.
    #[default]
    FlatDir,
    /// Boot a device-mapper CoW snapshot over a shared read-only base image.
    Cow,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::FlatDir => Strategy::FlatDir,
            StrategyArg::Cow => Strategy::Cow,
        }
    }
}

impl RunArgs {
    pub async fn run(self, config: Config) -> Result<()> {
        let controller = Controller::open(config)?;
        let id = controller.run_vm(&self.image, &self.publish, self.strategy.into()).await?;
        println!("{id}");
        Ok(())
    }
}
