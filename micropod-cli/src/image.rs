//! Image store commands: pull, images, rmi.

use anyhow::Result;
use micropod::Config;
use micropod_oci::Oci;

use crate::OutputFormat;

pub async fn pull(config: &Config, reference: &str) -> Result<()> {
    let oci = Oci::open_at(&config.images_dir())?;
    let view = oci.pull(reference).await?;
    println!("{}", view.reference);
    Ok(())
}

pub fn images(config: &Config, format: OutputFormat) -> Result<()> {
    let oci = Oci::open_at(&config.images_dir())?;
    let list = oci.list()?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if list.is_empty() {
        println!("No images.");
        return Ok(());
    }
    println!("{:<50} DIGEST", "REFERENCE");
    for img in &list {
        let short = &img.manifest_digest[..img.manifest_digest.len().min(19)];
        println!("{:<50} {short}", img.reference);
    }
    Ok(())
}

pub fn rmi(config: &Config, refs: &[String]) -> Result<()> {
    let oci = Oci::open_at(&config.images_dir())?;
    for r in refs {
        oci.delete(r)?;
        println!("{r}");
    }
    Ok(())
}
