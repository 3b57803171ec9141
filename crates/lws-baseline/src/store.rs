//! Baseline store: locate, write, verify-and-copy, delete, relocate.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lws_config::{log_baseline_debug, log_baseline_info, log_baseline_warn, BaselineConfig};
use lws_pathtree::local_path;
use parking_lot::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::folder::{self, BaselineFolder, BaselineFolderState, COMPRESSED_EXT, PARTITION_COUNT, RAW_EXT};
use crate::{hash_to_hex, BaselineError, ContentHash, ContentHasher, Result, UNKNOWN_LENGTH};

/// What was written by [`BaselineStore::store_from_reader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBaseline {
    pub location: PathBuf,
    pub length: u64,
    pub hash: ContentHash,
    pub compressed: bool,
}

/// What [`BaselineStore::maintain`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Folders created for partitions that had none
    pub created: Vec<PathBuf>,
    /// Stale folders emptied and deleted
    pub removed: Vec<PathBuf>,
    /// Baselines moved out of stale folders or the fallback
    pub moved: usize,
}

/// Baselines of one workspace.
///
/// The folder list is guarded by a reader-writer lock: copies and deletes
/// hold a read token for their whole duration, replacing the folder set
/// takes the write side and waits for them.
#[derive(Debug)]
pub struct BaselineStore {
    fallback: PathBuf,
    folders: RwLock<Vec<BaselineFolder>>,
    mount_points: Vec<PathBuf>,
    compress: bool,
    buffer_size: usize,
}

impl BaselineStore {
    /// Open a store whose fallback folder is `fallback` (normally
    /// `<metadata>/baselines`). The fallback is created if missing.
    pub fn new(fallback: impl Into<PathBuf>, config: &BaselineConfig) -> Result<Self> {
        let fallback = fallback.into();
        folder::ensure_layout(&fallback)?;
        Ok(Self {
            fallback,
            folders: RwLock::new(Vec::new()),
            mount_points: config.mount_points.clone(),
            compress: config.compress,
            buffer_size: config.decompress_buffer.max(512),
        })
    }

    pub fn fallback_path(&self) -> &Path {
        &self.fallback
    }

    /// Snapshot of the current folder set.
    pub fn folders(&self) -> Vec<BaselineFolder> {
        self.folders.read().clone()
    }

    /// Replace the folder set, re-checking every folder against disk.
    pub fn update_from(&self, mut folders: Vec<BaselineFolder>) {
        for f in &mut folders {
            f.refresh_state();
        }
        *self.folders.write() = folders;
    }

    /// Partition a local path belongs to.
    pub fn partition_for(&self, local: &Path) -> PathBuf {
        partition_in(&self.folders.read(), &self.mount_points, local)
    }

    /// True when `path` directly contains one of the baseline folders.
    pub fn is_immediate_parent_of_baseline_folder(&self, path: &Path) -> bool {
        self.folders.read().iter().any(|f| {
            f.path
                .parent()
                .map(|p| local_path::equals(p, path))
                .unwrap_or(false)
        })
    }

    /// True when `path` is a baseline folder or lies inside one.
    pub fn is_in_baseline_folder(&self, path: &Path) -> bool {
        local_path::is_child(&self.fallback, path)
            || self
                .folders
                .read()
                .iter()
                .any(|f| local_path::is_child(&f.path, path))
    }

    /// Where a new baseline for `guid` should be written. `local_hint` picks
    /// the partition; without one the fallback folder is used.
    pub fn new_baseline_location(
        &self,
        guid: &Uuid,
        local_hint: Option<&Path>,
        compressed: bool,
    ) -> PathBuf {
        let folders = self.folders.read();
        let root = self.root_for(&folders, local_hint);
        with_ext(folder::path_from_guid(&root, guid), compressed)
    }

    /// Find an existing baseline. Valid folders are searched first, then
    /// stale ones, the fallback last. Within a folder a compressed file
    /// wins over a raw one.
    pub fn locate(&self, guid: &Uuid) -> Option<(PathBuf, bool)> {
        locate_in(&self.folders.read(), &self.fallback, guid)
    }

    /// Write a baseline from `reader`, returning its length and hash.
    /// When `expected_hash` is given and differs, nothing is kept and the
    /// call fails with `Corrupt`.
    #[instrument(skip(self, reader), level = "debug")]
    pub fn store_from_reader(
        &self,
        guid: &Uuid,
        reader: &mut dyn Read,
        expected_hash: Option<&ContentHash>,
        local_hint: Option<&Path>,
    ) -> Result<StoredBaseline> {
        let folders = self.folders.read();
        let root = self.root_for(&folders, local_hint);
        let location = with_ext(folder::path_from_guid(&root, guid), self.compress);
        if let Some(parent) = location.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(&location);
        let written = self.write_temp(reader, &temp_path);
        let (length, hash) = match written {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        if let Some(expected) = expected_hash {
            if *expected != hash {
                let _ = fs::remove_file(&temp_path);
                return Err(BaselineError::Corrupt {
                    target: location,
                    reason: format!(
                        "hash mismatch: expected {}, got {}",
                        hash_to_hex(expected),
                        hash_to_hex(&hash)
                    ),
                });
            }
        }

        // A baseline of the other flavour may be left from an earlier write
        let _ = fs::remove_file(with_ext(location.with_extension(""), !self.compress));
        if let Err(e) = fs::rename(&temp_path, &location) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        Ok(StoredBaseline {
            location,
            length,
            hash,
            compressed: self.compress,
        })
    }

    /// Write a baseline from a local file. The partition defaults to the
    /// source's own.
    pub fn store_from_local(
        &self,
        guid: &Uuid,
        source: &Path,
        expected_hash: Option<&ContentHash>,
        local_hint: Option<&Path>,
    ) -> Result<StoredBaseline> {
        let mut file = File::open(source)?;
        self.store_from_reader(guid, &mut file, expected_hash, local_hint.or(Some(source)))
    }

    fn write_temp(&self, reader: &mut dyn Read, temp_path: &Path) -> Result<(u64, ContentHash)> {
        let file = File::create(temp_path)?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; self.buffer_size];

        let length = if self.compress {
            let mut encoder = GzEncoder::new(file, Compression::default());
            let length = pump(reader, &mut encoder, &mut hasher, &mut buf)?;
            encoder.finish()?.sync_all()?;
            length
        } else {
            let mut file = file;
            let length = pump(reader, &mut file, &mut hasher, &mut buf)?;
            file.sync_all()?;
            length
        };
        Ok((length, hasher.finalize()))
    }

    /// Materialize a baseline at `target`.
    ///
    /// The target is deleted first. Compressed baselines are streamed into a
    /// `<uuid>.tmp` next to the baseline, checked against `expected_length`
    /// (unless it is [`UNKNOWN_LENGTH`]) and `expected_hash`, then renamed
    /// into place. A baseline that fails verification is deleted.
    #[instrument(skip(self, expected_hash), level = "debug")]
    pub fn copy_to_target(
        &self,
        guid: &Uuid,
        target: &Path,
        expected_length: i64,
        expected_hash: Option<&ContentHash>,
        symlink: bool,
    ) -> Result<()> {
        let folders = self.folders.read();

        match fs::symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(target)?,
            Ok(_) => fs::remove_file(target)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let (location, compressed) =
            locate_in(&folders, &self.fallback, guid).ok_or_else(|| BaselineError::Missing {
                target: target.to_path_buf(),
            })?;

        let temp_path = match (compressed, location.parent()) {
            (true, Some(parent)) => Some(parent.join(format!("{}.tmp", Uuid::new_v4()))),
            _ => None,
        };

        let result = self.copy_inner(
            &location,
            compressed,
            temp_path.as_deref(),
            target,
            expected_length,
            expected_hash,
            symlink,
        );

        if let Err(e) = &result {
            if let Some(temp) = &temp_path {
                let _ = fs::remove_file(temp);
            }
            if matches!(e, BaselineError::Corrupt { .. }) {
                log_baseline_warn!(
                    "Deleting corrupt baseline",
                    guid = tracing::field::display(guid),
                    location = tracing::field::display(location.display())
                );
                let _ = fs::remove_file(&location);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_inner(
        &self,
        location: &Path,
        compressed: bool,
        temp_path: Option<&Path>,
        target: &Path,
        expected_length: i64,
        expected_hash: Option<&ContentHash>,
        symlink: bool,
    ) -> Result<()> {
        let corrupt = |reason: String| BaselineError::Corrupt {
            target: target.to_path_buf(),
            reason,
        };

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; self.buffer_size];
        let mut length = 0u64;

        let staged = match temp_path {
            Some(temp) if compressed => {
                let mut decoder = GzDecoder::new(File::open(location)?);
                let mut out = File::create(temp)?;
                loop {
                    let n = match decoder.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(corrupt(format!("decompression failed: {}", e))),
                    };
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n])?;
                    length += n as u64;
                }
                out.sync_all()?;
                temp.to_path_buf()
            }
            _ => {
                let mut input = File::open(location)?;
                length = pump(&mut input, &mut io::sink(), &mut hasher, &mut buf)?;
                location.to_path_buf()
            }
        };

        if expected_length != UNKNOWN_LENGTH && length != expected_length as u64 {
            return Err(corrupt(format!(
                "length mismatch: expected {}, got {}",
                expected_length, length
            )));
        }
        if let Some(expected) = expected_hash {
            let actual = hasher.finalize();
            if *expected != actual {
                return Err(corrupt(format!(
                    "hash mismatch: expected {}, got {}",
                    hash_to_hex(expected),
                    hash_to_hex(&actual)
                )));
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if symlink {
            let link_target = fs::read_to_string(&staged)?;
            if compressed {
                fs::remove_file(&staged)?;
            }
            make_symlink(link_target.trim_end_matches('\0'), target)?;
        } else if compressed {
            if fs::rename(&staged, target).is_err() {
                // Different volume: copy then drop the temp
                fs::copy(&staged, target)?;
                fs::remove_file(&staged)?;
            }
        } else {
            fs::copy(&staged, target)?;
        }
        log_baseline_debug!(
            "Materialized baseline",
            target = tracing::field::display(target.display()),
            length = length
        );
        Ok(())
    }

    /// Delete every copy of a baseline. Deleting a missing baseline is a no-op.
    pub fn delete(&self, guid: &Uuid) -> Result<()> {
        let folders = self.folders.read();
        let roots = folders
            .iter()
            .map(|f| f.path.clone())
            .chain(std::iter::once(self.fallback.clone()));
        for root in roots {
            let base = folder::path_from_guid(&root, guid);
            for compressed in [true, false] {
                match fs::remove_file(with_ext(base.clone(), compressed)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Move a baseline into the folder serving the partition of
    /// `current_local`. Returns whether anything moved.
    pub fn relocate(&self, guid: &Uuid, current_local: &Path) -> Result<bool> {
        let folders = self.folders.read();
        let Some((location, compressed)) = locate_in(&folders, &self.fallback, guid) else {
            return Ok(false);
        };
        let wanted_root = self.root_for(&folders, Some(current_local));
        if location.starts_with(&wanted_root) {
            return Ok(false);
        }
        let destination = with_ext(folder::path_from_guid(&wanted_root, guid), compressed);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        move_file(&location, &destination)?;
        log_baseline_debug!(
            "Relocated baseline",
            guid = tracing::field::display(guid),
            to = tracing::field::display(destination.display())
        );
        Ok(true)
    }

    /// Bring the folder set in line with the workspace roots.
    ///
    /// Each partition holding a root gets a valid folder parented by one of
    /// its roots. Folders on partitions without a root, or parented by
    /// something that is no longer a root, turn stale: their baselines move
    /// to a valid folder (same partition first, else any, else the
    /// fallback) and the folder is deleted. Finally the fallback is emptied
    /// into a valid folder when one exists.
    pub fn maintain(&self, workspace_roots: &[PathBuf]) -> Result<MaintenanceReport> {
        let mut folders = self.folders.write();
        let mut report = MaintenanceReport::default();

        let mut partitions: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
        for root in workspace_roots {
            let partition = mount_partition(&self.mount_points, root);
            match partitions
                .iter_mut()
                .find(|(p, _)| local_path::equals(p, &partition))
            {
                Some((_, roots)) => roots.push(root.clone()),
                None => partitions.push((partition, vec![root.clone()])),
            }
        }

        for f in folders.iter_mut() {
            f.refresh_state();
            let parented_by_root = partitions
                .iter()
                .find(|(p, _)| local_path::equals(p, &f.partition))
                .zip(f.path.parent())
                .is_some_and(|((_, roots), parent)| {
                    roots.iter().any(|r| local_path::equals(r, parent))
                });
            if !parented_by_root {
                f.state = BaselineFolderState::Stale;
            }
        }

        for (partition, roots) in &partitions {
            if folders
                .iter()
                .any(|f| f.is_valid() && local_path::equals(&f.partition, partition))
            {
                continue;
            }
            for root in roots.iter().filter(|r| r.is_dir()) {
                match BaselineFolder::create(partition.clone(), root) {
                    Ok(created) => {
                        log_baseline_info!(
                            "Created baseline folder",
                            path = tracing::field::display(created.path.display())
                        );
                        report.created.push(created.path.clone());
                        folders.push(created);
                        break;
                    }
                    Err(e) => log_baseline_warn!(
                        "Cannot create baseline folder",
                        root = tracing::field::display(root.display()),
                        error = tracing::field::display(&e)
                    ),
                }
            }
        }

        let (stale, valid): (Vec<_>, Vec<_>) = folders.drain(..).partition(|f| !f.is_valid());
        *folders = valid;
        for f in stale {
            if !f.path.is_dir() {
                report.removed.push(f.path);
                continue;
            }
            let destination = folders
                .iter()
                .find(|v| local_path::equals(&v.partition, &f.partition))
                .or_else(|| folders.first())
                .map(|v| v.path.clone())
                .unwrap_or_else(|| self.fallback.clone());
            match move_baselines(&f.path, &destination) {
                Ok(moved) => {
                    report.moved += moved;
                    if let Err(e) = fs::remove_dir_all(&f.path) {
                        log_baseline_warn!(
                            "Cannot delete stale baseline folder",
                            path = tracing::field::display(f.path.display()),
                            error = tracing::field::display(&e)
                        );
                    }
                    report.removed.push(f.path);
                }
                Err(e) => {
                    // Still holds baselines, so it stays searchable
                    log_baseline_warn!(
                        "Cannot empty stale baseline folder",
                        path = tracing::field::display(f.path.display()),
                        error = tracing::field::display(&e)
                    );
                    folders.push(f);
                }
            }
        }

        if let Some(target) = folders.iter().find(|f| f.is_valid()).map(|f| f.path.clone()) {
            match move_baselines(&self.fallback, &target) {
                Ok(moved) => report.moved += moved,
                Err(e) => log_baseline_warn!(
                    "Cannot empty fallback baseline folder",
                    error = tracing::field::display(&e)
                ),
            }
        }

        log_baseline_debug!(
            "Baseline folder maintenance done",
            created = report.created.len(),
            removed = report.removed.len(),
            moved = report.moved
        );
        Ok(report)
    }

    fn root_for(&self, folders: &[BaselineFolder], local_hint: Option<&Path>) -> PathBuf {
        local_hint
            .and_then(|hint| {
                let partition = partition_in(folders, &self.mount_points, hint);
                folders
                    .iter()
                    .find(|f| f.is_valid() && local_path::equals(&f.partition, &partition))
                    .map(|f| f.path.clone())
            })
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Move every baseline file of the folder `from` into the folder `to`.
fn move_baselines(from: &Path, to: &Path) -> io::Result<usize> {
    let mut moved = 0;
    for bucket in 0..PARTITION_COUNT {
        let dir = from.join(bucket.to_string());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            let is_baseline = path
                .extension()
                .is_some_and(|ext| ext == COMPRESSED_EXT || ext == RAW_EXT);
            let Some(name) = path.file_name().filter(|_| is_baseline) else {
                continue;
            };
            let bucket_dir = to.join(bucket.to_string());
            fs::create_dir_all(&bucket_dir)?;
            move_file(&path, &bucket_dir.join(name))?;
            moved += 1;
        }
    }
    Ok(moved)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_err() {
        // Different volume
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

fn pump(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    hasher: &mut ContentHasher,
    buf: &mut [u8],
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match reader.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn with_ext(base: PathBuf, compressed: bool) -> PathBuf {
    base.with_extension(if compressed { COMPRESSED_EXT } else { RAW_EXT })
}

fn temp_path_for(location: &Path) -> PathBuf {
    let name = location
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    location.with_file_name(format!(
        "{}.{}.{:?}.tmp",
        name,
        std::process::id(),
        std::thread::current().id()
    ))
}

/// Longest known partition (a folder's or a mount point) containing
/// `local`, else its volume root.
fn partition_in(folders: &[BaselineFolder], mounts: &[PathBuf], local: &Path) -> PathBuf {
    folders
        .iter()
        .map(|f| &f.partition)
        .chain(mounts.iter())
        .filter(|p| local_path::is_child(p, local))
        .max_by_key(|p| p.components().count())
        .cloned()
        .unwrap_or_else(|| local_path::partition_of(local))
}

fn mount_partition(mounts: &[PathBuf], local: &Path) -> PathBuf {
    partition_in(&[], mounts, local)
}

fn locate_in(folders: &[BaselineFolder], fallback: &Path, guid: &Uuid) -> Option<(PathBuf, bool)> {
    let roots = folders
        .iter()
        .filter(|f| f.is_valid())
        .chain(folders.iter().filter(|f| !f.is_valid()))
        .map(|f| f.path.as_path())
        .chain(std::iter::once(fallback));
    for root in roots {
        let base = folder::path_from_guid(root, guid);
        for compressed in [true, false] {
            let candidate = with_ext(base.clone(), compressed);
            if candidate.is_file() {
                return Some((candidate, compressed));
            }
        }
    }
    None
}

#[cfg(unix)]
fn make_symlink(link_target: &str, at: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link_target, at)
}

#[cfg(not(unix))]
fn make_symlink(link_target: &str, at: &Path) -> io::Result<()> {
    fs::write(at, link_target)
}
