//! Whiteout-aware extraction of OCI layer tarballs into a destination tree.
//!
//! Applies layers *in order*: each layer's whiteout entries delete or
//! opaque-clear what earlier layers wrote, entirely in terms of what has
//! already landed on `dest` — there is no in-memory merged tree.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::{Error, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Applies `layers`, in order, to `dest`. `dest` must already exist.
pub fn unpack_layers(layers: &[PathBuf], dest: &Path, privileged: bool) -> Result<()> {
    for layer_path in layers {
        apply_layer(layer_path, dest, privileged)?;
    }
    Ok(())
}

fn apply_layer(layer_path: &Path, dest: &Path, privileged: bool) -> Result<()> {
    let file = File::open(layer_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path_in_tar = entry.path()?.into_owned();

        let Some(name) = path_in_tar.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name == OPAQUE_MARKER {
            let parent_in_tar = path_in_tar.parent().unwrap_or_else(|| Path::new(""));
            if let Some(target_dir) = resolve_safe(dest, parent_in_tar) {
                clear_directory(&target_dir)?;
            }
            continue;
        }

        if let Some(real_name) = name.strip_prefix(WHITEOUT_PREFIX) {
            let parent_in_tar = path_in_tar.parent().unwrap_or_else(|| Path::new(""));
            if let Some(target_dir) = resolve_safe(dest, parent_in_tar) {
                let victim = target_dir.join(real_name);
                remove_any(&victim)?;
            }
            continue;
        }

        let Some(target) = resolve_safe(dest, &path_in_tar) else {
            continue;
        };
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, mode)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                io::copy(&mut entry, &mut out)?;
                set_mode(&target, mode)?;
            }
            EntryType::Symlink => {
                let Some(link_target) = entry.link_name()?.map(|p| p.into_owned()) else {
                    continue;
                };
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&target);
                symlink(&link_target, &target)?;
            }
            EntryType::Link => {
                let Some(link_name) = entry.link_name()?.map(|p| p.into_owned()) else {
                    continue;
                };
                let Some(hardlink_src) = resolve_safe(dest, &link_name) else {
                    continue;
                };
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&target);
                fs::hard_link(&hardlink_src, &target)?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo if privileged => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                create_special_file(&target, &entry)?;
            }
            _ => {
                // Unsupported type and not privileged: skip
            }
        }
    }

    Ok(())
}

/// Cleans `rel` of `..`/`.`/root components and checks the result stays
/// under `dest`. Returns `None` for anything that would escape — such
/// entries are skipped rather than aborting the whole unpack.
fn resolve_safe(dest: &Path, rel: &Path) -> Option<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Some(dest.to_path_buf());
    }
    let joined = dest.join(&cleaned);
    joined.starts_with(dest).then_some(joined)
}

/// Removes whatever already exists at `path` (file, symlink, or directory
/// tree); missing is not an error.
fn remove_any(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Empties a directory's direct children without removing the directory
/// itself — the opaque-whiteout semantic.
fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(Error::Internal("symlinks require a Unix host".to_owned()))
}

#[cfg(unix)]
fn create_special_file<R: io::Read>(target: &Path, entry: &tar::Entry<'_, R>) -> Result<()> {
    use nix::sys::stat::{Mode, SFlag, mknod};

    let header = entry.header();
    let entry_type = header.entry_type();
    let mode = header.mode().unwrap_or(0o600);
    let major = header.device_major()?.unwrap_or(0);
    let minor = header.device_minor()?.unwrap_or(0);

    let kind = match entry_type {
        EntryType::Char => SFlag::S_IFCHR,
        EntryType::Block => SFlag::S_IFBLK,
        EntryType::Fifo => SFlag::S_IFIFO,
        _ => return Ok(()),
    };

    let _ = fs::remove_file(target);
    let perm = Mode::from_bits_truncate(mode);
    let dev = nix::sys::stat::makedev(u64::from(major), u64::from(minor));
    mknod(target, kind, perm, dev)
        .map_err(|e| Error::Internal(format!("mknod {}: {e}", target.display())))
}

#[cfg(not(unix))]
fn create_special_file<R: io::Read>(_target: &Path, _entry: &tar::Entry<'_, R>) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tar::{Builder, Header};

    fn write_layer(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut builder = Builder::new(enc);
        for (name, data, mode) in entries {
            let mut header = Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn unpacks_regular_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer.tar.gz");
        write_layer(&layer, &[("bin/sh", b"#!/bin/sh\n", 0o755)]);

        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        unpack_layers(&[layer], &dest, false).unwrap();

        assert!(dest.join("bin/sh").is_file());
    }

    #[test]
    fn whiteout_deletes_earlier_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();

        let layer1 = tmp.path().join("l1.tar.gz");
        write_layer(&layer1, &[("etc/foo", b"one", 0o644)]);
        let layer2 = tmp.path().join("l2.tar.gz");
        write_layer(&layer2, &[("etc/.wh.foo", b"", 0o644)]);

        unpack_layers(&[layer1, layer2], &dest, false).unwrap();
        assert!(!dest.join("etc/foo").exists());
    }

    #[test]
    fn opaque_whiteout_clears_but_keeps_new_entries_in_same_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();

        let layer1 = tmp.path().join("l1.tar.gz");
        write_layer(
            &layer1,
            &[("data/old.txt", b"stale", 0o644), ("data/keep.txt", b"also-stale", 0o644)],
        );
        let layer2 = tmp.path().join("l2.tar.gz");
        write_layer(
            &layer2,
            &[("data/.wh..wh..opq", b"", 0o644), ("data/new.txt", b"fresh", 0o644)],
        );

        unpack_layers(&[layer1, layer2], &dest, false).unwrap();
        assert!(!dest.join("data/old.txt").exists());
        assert!(!dest.join("data/keep.txt").exists());
        assert!(dest.join("data/new.txt").is_file());
    }

    #[test]
    fn path_traversal_entries_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();

        let layer = tmp.path().join("l.tar.gz");
        write_layer(&layer, &[("../escape.txt", b"evil", 0o644)]);
        unpack_layers(&[layer], &dest, false).unwrap();

        assert!(!tmp.path().join("escape.txt").exists());
    }
}
