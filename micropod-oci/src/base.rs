//! `CreateBaseImage(ref)`: builds a standalone ext4 image file from an
//! image's unpacked layers, for the ext4+device-mapper CoW rootfs strategy.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::{Error, Result};

/// Minimum size of a generated base image, regardless of content size.
const MIN_SIZE_BYTES: u64 = 64 * 1024 * 1024;
/// Headroom added on top of the measured unpacked size.
const HEADROOM_NUMERATOR: u64 = 12;
const HEADROOM_DENOMINATOR: u64 = 10;

/// Formats the unpacked tree at `src` as a standalone ext4 file at `dest`.
///
/// `dest`'s parent directory must already exist. Sizing and population are
/// CPU/IO-bound and run in this async task via blocking `tokio::fs`/`std::fs`
/// calls interleaved with awaited subprocess calls.
pub async fn build_ext4_image(src: &Path, dest: &Path) -> Result<()> {
    let content_size = directory_size(src)?;
    let image_size = (content_size * HEADROOM_NUMERATOR / HEADROOM_DENOMINATOR).max(MIN_SIZE_BYTES);

    create_sparse_file(dest, image_size)?;

    run(
        "mkfs.ext4",
        &["-q", "-F", dest.to_str().ok_or_else(|| path_error(dest))?],
    )
    .await?;

    populate(src, dest).await
}

fn path_error(path: &Path) -> Error {
    Error::Internal(format!("non-UTF-8 path: {}", path.display()))
}

/// Recursively sums file sizes under `dir` (directories themselves are free).
fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

fn create_sparse_file(path: &Path, size: u64) -> Result<()> {
    let file = std::fs::File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

/// Mounts `dest` at a temp directory and copies `src` into it via `cp -a`,
/// preserving ownership and mode as the original layers specified them.
async fn populate(src: &Path, dest: &Path) -> Result<()> {
    let mount_point = tempfile::TempDir::new()?;
    let mount_path = mount_point.path();

    run(
        "mount",
        &[
            "-o",
            "loop",
            dest.to_str().ok_or_else(|| path_error(dest))?,
            mount_path.to_str().ok_or_else(|| path_error(mount_path))?,
        ],
    )
    .await?;

    let copy_result = run(
        "cp",
        &[
            "-a",
            "--",
            &format!("{}/.", src.display()),
            mount_path.to_str().ok_or_else(|| path_error(mount_path))?,
        ],
    )
    .await;

    let unmount_result = run("umount", &[mount_path.to_str().ok_or_else(|| path_error(mount_path))?]).await;

    copy_result?;
    unmount_result
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), [0u8; 10]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b"), [0u8; 20]).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 30);
    }
}
