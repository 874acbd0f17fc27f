//! Unpacking an archive into a directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{AttachError, Result};

use super::{detect_file, Detected};

/// Unpack `archive` under `output_dir`.
///
/// `decide` is asked once for each top-level entry and may rename it; the
/// rest of the entry's tree follows the renamed root. Entries that would
/// escape `output_dir` are rejected. Returns the top-level paths created,
/// in archive order.
pub fn extract_blocking(
    archive: &Path,
    output_dir: &Path,
    decide: &(dyn Fn(&Path) -> PathBuf + Send + Sync),
    progress: &(dyn Fn(u64, u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    let mut roots = Roots::new(output_dir, decide);

    match detect_file(archive)? {
        Some(Detected::Zip) => extract_zip(archive, &mut roots, progress, cancel)?,
        Some(Detected::Tar) => {
            let file = File::open(archive).map_err(|e| AttachError::io(archive, e))?;
            extract_tar(archive, file, &mut roots, progress, cancel)?;
        }
        Some(Detected::TarGz) => {
            let file = File::open(archive).map_err(|e| AttachError::io(archive, e))?;
            extract_tar(archive, GzDecoder::new(file), &mut roots, progress, cancel)?;
        }
        None => {
            return Err(AttachError::Archive(format!(
                "'{}' is not a supported archive",
                archive.display()
            )))
        }
    }

    debug!(roots = roots.order.len(), "Extraction finished");
    Ok(roots.order)
}

/// Remembers where each top-level entry was placed.
struct Roots<'a> {
    output_dir: &'a Path,
    decide: &'a (dyn Fn(&Path) -> PathBuf + Send + Sync),
    placed: HashMap<PathBuf, PathBuf>,
    order: Vec<PathBuf>,
}

impl<'a> Roots<'a> {
    fn new(output_dir: &'a Path, decide: &'a (dyn Fn(&Path) -> PathBuf + Send + Sync)) -> Self {
        Self {
            output_dir,
            decide,
            placed: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Final on-disk path of a sanitized relative entry path.
    fn target_for(&mut self, relative: &Path) -> PathBuf {
        let mut components = relative.components();
        let top = match components.next() {
            Some(c) => PathBuf::from(c.as_os_str()),
            None => return self.output_dir.to_path_buf(),
        };
        let rest = components.as_path().to_path_buf();

        let root = match self.placed.get(&top) {
            Some(root) => root.clone(),
            None => {
                let root = (self.decide)(&self.output_dir.join(&top));
                trace!(entry = %top.display(), dest = %root.display(), "Placed top-level entry");
                self.placed.insert(top, root.clone());
                self.order.push(root.clone());
                root
            }
        };

        if rest.as_os_str().is_empty() {
            root
        } else {
            root.join(rest)
        }
    }
}

/// Relative form of an entry path, or `None` if it is absolute or climbs
/// out with `..`.
fn sanitize(entry: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AttachError::Cancelled)
    } else {
        Ok(())
    }
}

fn write_entry(reader: &mut impl Read, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| AttachError::io(parent, e))?;
    }
    let mut out = File::create(target).map_err(|e| AttachError::io(target, e))?;
    io::copy(reader, &mut out).map_err(|e| AttachError::io(target, e))
}

fn extract_zip(
    archive_path: &Path,
    roots: &mut Roots<'_>,
    progress: &(dyn Fn(u64, u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| AttachError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut total = 0u64;
    for i in 0..archive.len() {
        total += archive.by_index_raw(i)?.size();
    }

    let mut done = 0u64;
    for i in 0..archive.len() {
        check(cancel)?;
        let mut entry = archive.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .and_then(|p| sanitize(&p))
            .ok_or_else(|| AttachError::Archive(format!("unsafe entry path '{}'", entry.name())))?;
        let target = roots.target_for(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| AttachError::io(&target, e))?;
        } else {
            done += write_entry(&mut entry, &target)?;
            progress(done, total);
        }
    }
    Ok(())
}

/// Counts bytes pulled from the archive file for progress reporting.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn extract_tar<R: Read>(
    archive_path: &Path,
    reader: R,
    roots: &mut Roots<'_>,
    progress: &(dyn Fn(u64, u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<()> {
    // Compressed size is all we know up front, so progress tracks the
    // archive bytes consumed.
    let total = fs::metadata(archive_path)
        .map_err(|e| AttachError::io(archive_path, e))?
        .len();
    let consumed = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: reader,
        count: Arc::clone(&consumed),
    };

    let mut archive = tar::Archive::new(counting);
    let entries = archive
        .entries()
        .map_err(|e| AttachError::Archive(format!("reading tar archive: {e}")))?;

    for entry in entries {
        check(cancel)?;
        let mut entry = entry.map_err(|e| AttachError::Archive(format!("corrupted tar entry: {e}")))?;
        let raw = entry
            .path()
            .map_err(|e| AttachError::Archive(format!("invalid tar entry path: {e}")))?
            .into_owned();
        let relative = sanitize(&raw)
            .ok_or_else(|| AttachError::Archive(format!("unsafe entry path '{}'", raw.display())))?;

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            let target = roots.target_for(&relative);
            fs::create_dir_all(&target).map_err(|e| AttachError::io(&target, e))?;
        } else if kind.is_file() {
            let target = roots.target_for(&relative);
            write_entry(&mut entry, &target)?;
        } else {
            debug!(entry = %raw.display(), "Skipping non-regular tar entry");
            continue;
        }
        progress(consumed.load(Ordering::Relaxed).min(total), total);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::compress_blocking;
    use crate::archive::{ArchiveFilter, ArchiveFormat};
    use crate::config::ArchiveSettings;
    use crate::naming;
    use std::sync::Mutex;

    fn identity(p: &Path) -> PathBuf {
        p.to_path_buf()
    }

    fn packed(settings: ArchiveSettings) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("report");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("data.csv"), b"a,b\n1,2\n").unwrap();
        let out = dir.path().join(format!("report.{}", super::super::extension(settings)));
        compress_blocking(&[root], &out, settings, &CancellationToken::new()).unwrap();
        (dir, out)
    }

    #[test]
    fn test_sanitize_rejects_escapes() {
        assert_eq!(sanitize(Path::new("a/./b")), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize(Path::new("../etc/passwd")), None);
        assert_eq!(sanitize(Path::new("/etc/passwd")), None);
        assert_eq!(sanitize(Path::new(".")), None);
    }

    #[test]
    fn test_extract_tar_gz_with_progress() {
        let settings = ArchiveSettings {
            format: ArchiveFormat::Tar,
            filter: ArchiveFilter::Gzip,
        };
        let (_dir, archive) = packed(settings);
        let out = tempfile::tempdir().unwrap();
        let seen = Mutex::new(Vec::new());

        let created = extract_blocking(
            &archive,
            out.path(),
            &identity,
            &|done, total| seen.lock().unwrap().push((done, total)),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(created, vec![out.path().join("report")]);
        assert_eq!(fs::read(out.path().join("report/data.csv")).unwrap(), b"a,b\n1,2\n");
        let seen = seen.into_inner().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|(done, total)| done <= total));
    }

    #[test]
    fn test_existing_root_is_renamed() {
        let (_dir, archive) = packed(ArchiveSettings::default());
        let out = tempfile::tempdir().unwrap();
        fs::create_dir(out.path().join("report")).unwrap();
        let parent = out.path().to_path_buf();

        let decide = move |proposed: &Path| {
            let name = proposed
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            naming::first_free(&parent, &name)
        };
        let created =
            extract_blocking(&archive, out.path(), &decide, &|_, _| {}, &CancellationToken::new()).unwrap();

        assert_eq!(created, vec![out.path().join("report (1)")]);
        assert!(out.path().join("report (1)/data.csv").is_file());
    }

    #[test]
    fn test_cancelled_extract() {
        let (_dir, archive) = packed(ArchiveSettings::default());
        let out = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extract_blocking(&archive, out.path(), &identity, &|_, _| {}, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, b"just text").unwrap();
        let err = extract_blocking(&path, dir.path(), &identity, &|_, _| {}, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, AttachError::Archive(_)));
    }
}
