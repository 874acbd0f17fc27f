//! Packing files and directories into a single archive.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;

use crate::config::ArchiveSettings;
use crate::error::{AttachError, Result};

use super::{ArchiveFilter, ArchiveFormat};

/// One file or directory to store, with its name inside the archive.
struct Member {
    path: PathBuf,
    name: String,
    is_dir: bool,
}

/// Write `inputs` into a new archive at `output`.
///
/// Each input is stored under its own file name, directories with their
/// whole tree. A partially written archive is removed on error or cancel.
pub fn compress_blocking(
    inputs: &[PathBuf],
    output: &Path,
    settings: ArchiveSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut members = Vec::new();
    for input in inputs {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AttachError::InvalidArgument(format!("cannot archive '{}'", input.display())))?;
        collect_members(input, &name, &mut members)?;
    }
    debug!(entries = members.len(), output = %output.display(), "Collected archive members");

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .map_err(|e| AttachError::io(output, e))?;

    let written = match settings.format {
        ArchiveFormat::Zip => write_zip(file, &members, cancel),
        ArchiveFormat::Tar => match settings.filter {
            ArchiveFilter::None => write_tar(file, &members, cancel).map(drop),
            ArchiveFilter::Gzip => {
                let encoder = GzEncoder::new(file, Compression::default());
                write_tar(encoder, &members, cancel)
                    .and_then(|enc| enc.finish().map_err(|e| AttachError::io(output, e)))
                    .map(drop)
            }
        },
    };

    if let Err(e) = written {
        if let Err(rm) = fs::remove_file(output) {
            warn!(path = %output.display(), error = %rm, "Failed to remove partial archive");
        }
        return Err(e);
    }
    Ok(())
}

fn collect_members(path: &Path, name: &str, out: &mut Vec<Member>) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| AttachError::io(path, e))?;
    if meta.is_dir() {
        out.push(Member {
            path: path.to_path_buf(),
            name: name.to_string(),
            is_dir: true,
        });
        let mut children: Vec<_> = fs::read_dir(path)
            .map_err(|e| AttachError::io(path, e))?
            .collect::<io::Result<_>>()
            .map_err(|e| AttachError::io(path, e))?;
        children.sort_by_key(|entry| entry.file_name());
        for child in children {
            let child_name = format!("{name}/{}", child.file_name().to_string_lossy());
            collect_members(&child.path(), &child_name, out)?;
        }
    } else if meta.is_file() {
        out.push(Member {
            path: path.to_path_buf(),
            name: name.to_string(),
            is_dir: false,
        });
    } else {
        debug!(path = %path.display(), "Skipping special file");
    }
    Ok(())
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AttachError::Cancelled)
    } else {
        Ok(())
    }
}

fn write_zip(file: File, members: &[Member], cancel: &CancellationToken) -> Result<()> {
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for member in members {
        check(cancel)?;
        if member.is_dir {
            zip.add_directory(format!("{}/", member.name), options)?;
        } else {
            zip.start_file(member.name.clone(), options)?;
            let mut f = File::open(&member.path).map_err(|e| AttachError::io(&member.path, e))?;
            io::copy(&mut f, &mut zip).map_err(|e| AttachError::io(&member.path, e))?;
        }
    }

    zip.finish()?;
    Ok(())
}

fn write_tar<W: Write>(writer: W, members: &[Member], cancel: &CancellationToken) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for member in members {
        check(cancel)?;
        if member.is_dir {
            builder
                .append_dir(&member.name, &member.path)
                .map_err(|e| AttachError::io(&member.path, e))?;
        } else {
            let mut f = File::open(&member.path).map_err(|e| AttachError::io(&member.path, e))?;
            builder
                .append_file(&member.name, &mut f)
                .map_err(|e| AttachError::io(&member.path, e))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| AttachError::Archive(format!("finishing tar stream: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("docs");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/one.txt"), b"1").unwrap();
        fs::write(root.join("two.txt"), b"22").unwrap();
        (dir, root)
    }

    #[test]
    fn test_collect_members_sorted_with_prefix() {
        let (_dir, root) = sample_tree();
        let mut members = Vec::new();
        collect_members(&root, "docs", &mut members).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["docs", "docs/sub", "docs/sub/one.txt", "docs/two.txt"]);
    }

    #[test]
    fn test_zip_contains_tree() {
        let (dir, root) = sample_tree();
        let out = dir.path().join("docs.zip");
        compress_blocking(&[root], &out, ArchiveSettings::default(), &CancellationToken::new()).unwrap();

        let archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, ["docs/", "docs/sub/", "docs/sub/one.txt", "docs/two.txt"]);
    }

    #[test]
    fn test_tar_gz_is_gzip() {
        let (dir, root) = sample_tree();
        let out = dir.path().join("docs.tar.gz");
        let settings = ArchiveSettings {
            format: ArchiveFormat::Tar,
            filter: ArchiveFilter::Gzip,
        };
        compress_blocking(&[root], &out, settings, &CancellationToken::new()).unwrap();
        let bytes = fs::read(&out).unwrap();
        assert_eq!(&bytes[..2], &[0x1F, 0x8B]);
    }

    #[test]
    fn test_cancelled_compress_leaves_nothing() {
        let (dir, root) = sample_tree();
        let out = dir.path().join("docs.zip");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = compress_blocking(&[root], &out, ArchiveSettings::default(), &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!out.exists());
    }

    #[test]
    fn test_existing_output_is_refused() {
        let (dir, root) = sample_tree();
        let out = dir.path().join("docs.zip");
        fs::write(&out, b"keep").unwrap();
        let err = compress_blocking(&[root], &out, ArchiveSettings::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(fs::read(&out).unwrap(), b"keep");
    }
}
