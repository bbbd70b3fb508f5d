/// Stage a host directory into an image builder.
///
/// Directories, regular files and symlinks are copied with their permission
/// bits, owner and modification time. Other file types (devices, sockets,
/// fifos) and names that are not valid UTF-8 are skipped with a warning.
use anyhow::{Context, Result};
use log::{debug, warn};
use squashkit::{Backend, ImageBuilder};
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

#[derive(Debug, Default)]
pub struct PackStats {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    pub skipped: usize,
    pub bytes: u64,
}

pub fn stage_directory<B: Backend>(builder: &mut ImageBuilder<B>, dir: &Path) -> Result<PackStats> {
    let mut stats = PackStats::default();
    let metadata = fs::metadata(dir).with_context(|| format!("Failed to stat {dir:?}"))?;
    if !metadata.is_dir() {
        anyhow::bail!("{dir:?} is not a directory");
    }
    apply_attributes(builder, "/", &metadata)?;
    add_directory_recursive(builder, dir, "", &mut stats)?;
    Ok(stats)
}

fn add_directory_recursive<B: Backend>(
    builder: &mut ImageBuilder<B>,
    current: &Path,
    image_dir: &str,
    stats: &mut PackStats,
) -> Result<()> {
    let read_dir =
        fs::read_dir(current).with_context(|| format!("Failed to read directory {current:?}"))?;

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("skipping {path:?}: name is not valid UTF-8");
            stats.skipped += 1;
            continue;
        };
        let image_path = format!("{image_dir}/{name}");

        let metadata = fs::symlink_metadata(&path)?;
        let ft = metadata.file_type();

        if ft.is_symlink() {
            let target = fs::read_link(&path)?;
            let Some(target) = target.to_str() else {
                warn!("skipping {path:?}: link target is not valid UTF-8");
                stats.skipped += 1;
                continue;
            };
            builder
                .symlink(target, &image_path)
                .with_context(|| format!("Failed to stage symlink {image_path}"))?;
            apply_attributes(builder, &image_path, &metadata)?;
            stats.symlinks += 1;
        } else if ft.is_dir() {
            builder
                .mkdir(&image_path)
                .with_context(|| format!("Failed to stage directory {image_path}"))?;
            apply_attributes(builder, &image_path, &metadata)?;
            stats.dirs += 1;
            add_directory_recursive(builder, &path, &image_path, stats)?;
        } else if ft.is_file() {
            let data = fs::read(&path).with_context(|| format!("Failed to read {path:?}"))?;
            builder
                .write_file(&image_path, &data)
                .with_context(|| format!("Failed to stage file {image_path}"))?;
            apply_attributes(builder, &image_path, &metadata)?;
            stats.files += 1;
            stats.bytes += data.len() as u64;
        } else {
            debug!("skipping special file {path:?}");
            stats.skipped += 1;
        }
    }
    Ok(())
}

fn apply_attributes<B: Backend>(
    builder: &mut ImageBuilder<B>,
    image_path: &str,
    metadata: &fs::Metadata,
) -> Result<()> {
    if let Ok(modified) = metadata.modified() {
        if let Ok(since) = modified.duration_since(UNIX_EPOCH) {
            builder.set_mtime(image_path, since.as_secs() as u32)?;
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        builder.set_permissions(image_path, (metadata.permissions().mode() & 0o7777) as u16)?;
        builder.set_owner(image_path, metadata.uid(), metadata.gid())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use squashkit::{FinalizeOptions, Image};

    #[test]
    fn test_stage_host_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("top.txt"), b"top\n").unwrap();
        fs::write(dir.path().join("sub/inner.bin"), vec![7u8; 10_000]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("sub/inner.bin", dir.path().join("link")).unwrap();

        let mut builder = ImageBuilder::create(Vec::new(), 4096).unwrap();
        let stats = stage_directory(&mut builder, dir.path()).unwrap();
        assert_eq!(stats.dirs, 2);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 10_004);
        builder.finalize(&FinalizeOptions::default()).unwrap();

        let image = Image::open(builder.into_backend()).unwrap();
        assert_eq!(image.read_file("/top.txt").unwrap(), b"top\n");
        assert_eq!(image.read_file("/sub/inner.bin").unwrap(), vec![7u8; 10_000]);
        assert!(image.read_dir("/sub/deeper").unwrap().is_empty());
        #[cfg(unix)]
        {
            assert_eq!(stats.symlinks, 1);
            assert_eq!(image.readlink("/link").unwrap(), "sub/inner.bin");
        }
    }

    #[test]
    fn test_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        let mut builder = ImageBuilder::create(Vec::new(), 4096).unwrap();
        assert!(stage_directory(&mut builder, &file).is_err());
    }
}
