//! Sandboxed filesystem rooted at a server's data directory.
//!
//! This module handles:
//! - Safe-path resolution that rejects anything escaping the server root
//! - Streaming writes with per-chunk disk-quota enforcement
//! - The disk-usage ledger and its lazy full rescan
//! - The gitignore-style write denylist
//!
//! Every path accepted from the outside passes through [`Filesystem::safe_path`]
//! before any I/O happens. The resolver expands each symlink it encounters, so
//! a link pointing outside the root fails with a `path_resolution` error even
//! when the lexical path looks harmless.

mod archive;
mod disk;

use std::{
    io::{Read, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{RoostError, RoostResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use archive::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Granularity of streamed writes and their quota checks.
pub const WRITE_CHUNK_SIZE: usize = 4096;

/// Upper bound on chained symlink expansion before resolution fails.
const MAX_SYMLINK_DEPTH: usize = 32;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A chroot-like view over one server's data directory.
pub struct Filesystem {
    /// Canonical absolute path of the server root.
    root: PathBuf,

    /// Disk quota in bytes. Zero or negative disables enforcement.
    disk_limit: AtomicI64,

    /// Approximate bytes used, maintained by every writer and deleter.
    disk_used: AtomicI64,

    /// Time of the last full usage rescan.
    disk_checked_at: StdMutex<Option<std::time::Instant>>,

    /// How long a rescan result stays fresh.
    check_interval: Duration,

    /// Serializes full rescans so concurrent callers coalesce on one walk.
    usage_lock: tokio::sync::Mutex<()>,

    /// Compiled write denylist.
    denylist: StdRwLock<Gitignore>,

    /// Lossy-decodes archive entry names that are not valid UTF-8 instead of
    /// failing the entry.
    legacy_filename_fallback: AtomicBool,
}

/// Metadata for one directory entry, shaped for the file listing API.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    /// Entry name without its parent path.
    pub name: String,

    /// Creation time, falling back to the modification time where the
    /// underlying filesystem does not record one.
    pub created: DateTime<Utc>,

    /// Last modification time.
    pub modified: DateTime<Utc>,

    /// Octal permission string, e.g. `0755`.
    pub mode: String,

    /// Size in bytes. Zero for directories.
    pub size: u64,

    /// True when the entry is a directory.
    pub directory: bool,

    /// True when the entry is a regular file.
    pub file: bool,

    /// True when the entry is a symlink.
    pub symlink: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Creates a filesystem view rooted at `root`, creating the directory if
    /// it does not exist yet.
    pub fn new(
        root: impl Into<PathBuf>,
        disk_limit: i64,
        denylist: &[String],
        check_interval: Duration,
    ) -> RoostResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = std::fs::canonicalize(&root)?;

        let matcher = Self::compile_denylist(&root, denylist)?;

        Ok(Self {
            root,
            disk_limit: AtomicI64::new(disk_limit),
            disk_used: AtomicI64::new(0),
            disk_checked_at: StdMutex::new(None),
            check_interval,
            usage_lock: tokio::sync::Mutex::new(()),
            denylist: StdRwLock::new(matcher),
            legacy_filename_fallback: AtomicBool::new(false),
        })
    }

    /// Whether archive entry names with invalid UTF-8 are decoded best-effort.
    pub fn legacy_filename_fallback(&self) -> bool {
        self.legacy_filename_fallback.load(Ordering::Relaxed)
    }

    /// Enables or disables the legacy filename fallback decoder.
    pub fn set_legacy_filename_fallback(&self, enabled: bool) {
        self.legacy_filename_fallback.store(enabled, Ordering::Relaxed);
    }

    /// Absolute path of the server root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Swaps in a new denylist, used when the panel syncs new patterns.
    pub fn update_denylist(&self, patterns: &[String]) -> RoostResult<()> {
        let matcher = Self::compile_denylist(&self.root, patterns)?;
        *self.denylist.write().expect("denylist lock poisoned") = matcher;
        Ok(())
    }

    /// Resolves a user-supplied path to a cleaned absolute path that is
    /// guaranteed to live under the server root.
    ///
    /// The input is joined onto the root, lexically cleaned, then walked one
    /// component at a time with full symlink expansion before descending. A
    /// resolved prefix outside the root fails immediately. Trailing components
    /// that do not exist yet are allowed so that creation flows can use the
    /// returned path.
    pub fn safe_path(&self, path: impl AsRef<Path>) -> RoostResult<PathBuf> {
        let requested = path.as_ref();
        let relative = requested.strip_prefix("/").unwrap_or(requested);

        let joined = lexically_clean(&self.root.join(relative));
        if !joined.starts_with(&self.root) {
            return Err(RoostError::PathResolution(requested.to_path_buf()));
        }

        // The prefix is the root itself, which new() canonicalized.
        let suffix = joined
            .strip_prefix(&self.root)
            .expect("checked prefix")
            .to_path_buf();

        let mut resolved = self.root.clone();
        for component in suffix.components() {
            resolved.push(component);
            resolved = self.expand_symlinks(resolved, requested)?;

            if !resolved.starts_with(&self.root) {
                return Err(RoostError::PathResolution(requested.to_path_buf()));
            }
        }

        Ok(resolved)
    }

    /// Applies [`Filesystem::safe_path`] to a set of paths concurrently.
    ///
    /// The first failure aborts the remaining resolutions and is returned as
    /// is. Results keep the order of the inputs.
    pub async fn parallel_safe_path(
        self: &Arc<Self>,
        paths: Vec<String>,
    ) -> RoostResult<Vec<PathBuf>> {
        let mut set = JoinSet::new();
        let count = paths.len();

        for (index, path) in paths.into_iter().enumerate() {
            let fs = Arc::clone(self);
            set.spawn_blocking(move || (index, fs.safe_path(&path)));
        }

        let mut resolved = vec![PathBuf::new(); count];
        while let Some(joined) = set.join_next().await {
            let (index, result) = joined?;
            match result {
                Ok(path) => resolved[index] = path,
                Err(err) => {
                    set.abort_all();
                    return Err(err);
                }
            }
        }

        Ok(resolved)
    }

    /// Returns true when the given path matches the write denylist.
    ///
    /// The path may be raw or already resolved; only its position relative to
    /// the root matters.
    pub fn is_ignored(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let relative = match path.strip_prefix(&self.root) {
            Ok(relative) => relative,
            Err(_) => path.strip_prefix("/").unwrap_or(path),
        };

        let absolute = self.root.join(relative);
        self.denylist
            .read()
            .expect("denylist lock poisoned")
            .matched_path_or_any_parents(&absolute, absolute.is_dir())
            .is_ignore()
    }

    /// Streams `reader` into the file at `path`, enforcing the disk quota per
    /// 4 KiB chunk.
    ///
    /// On quota exhaustion or cancellation mid-write the partial file is
    /// removed before the error is returned. On success the usage ledger is
    /// adjusted by the exact difference between the bytes written and the
    /// previous size of the file.
    pub fn write_file_sync(
        &self,
        path: &str,
        reader: &mut dyn Read,
        token: Option<&CancellationToken>,
    ) -> RoostResult<u64> {
        let cleaned = self.safe_path(path)?;
        if self.is_ignored(&cleaned) {
            return Err(RoostError::DenylistFile(cleaned));
        }

        let existing = match std::fs::symlink_metadata(&cleaned) {
            Ok(meta) if meta.is_dir() => return Err(RoostError::IsDirectory(cleaned)),
            Ok(meta) => meta.len() as i64,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        if let Some(parent) = cleaned.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::File::create(&cleaned)?;
        let mut written: i64 = 0;
        let mut buffer = [0u8; WRITE_CHUNK_SIZE];

        loop {
            if token.map_or(false, |t| t.is_cancelled()) {
                drop(file);
                let _ = std::fs::remove_file(&cleaned);
                return Err(RoostError::Cancelled);
            }

            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }

            if let Err(err) = self.has_space_for(written + read as i64 - existing) {
                drop(file);
                let _ = std::fs::remove_file(&cleaned);
                return Err(err);
            }

            file.write_all(&buffer[..read])?;
            written += read as i64;
        }

        file.flush()?;
        self.add_disk(written - existing);

        Ok(written as u64)
    }

    /// Async wrapper over [`Filesystem::write_file_sync`] for streamed HTTP
    /// uploads.
    pub async fn write_file<R>(self: &Arc<Self>, path: &str, reader: R) -> RoostResult<u64>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let fs = Arc::clone(self);
        let path = path.to_string();

        tokio::task::spawn_blocking(move || {
            let mut bridge = tokio_util::io::SyncIoBridge::new(reader);
            fs.write_file_sync(&path, &mut bridge, None)
        })
        .await?
    }

    /// Removes a file or directory tree, subtracting the freed bytes from the
    /// usage ledger after the removal succeeds.
    pub async fn delete(self: &Arc<Self>, path: &str) -> RoostResult<()> {
        let cleaned = self.safe_path(path)?;
        if cleaned == self.root {
            return Err(RoostError::InvalidArgument(
                "cannot delete the server root".to_string(),
            ));
        }

        let fs = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let meta = match std::fs::symlink_metadata(&cleaned) {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            let freed = if meta.is_dir() {
                disk::walk_size(&cleaned)?
            } else {
                meta.len() as i64
            };

            if meta.is_dir() {
                std::fs::remove_dir_all(&cleaned)?;
            } else {
                std::fs::remove_file(&cleaned)?;
            }

            fs.add_disk(-freed);
            Ok(())
        })
        .await?
    }

    /// Renames a file or directory within the root.
    pub fn rename(&self, from: &str, to: &str) -> RoostResult<()> {
        let cleaned_from = self.safe_path(from)?;
        let cleaned_to = self.safe_path(to)?;

        if self.is_ignored(&cleaned_to) {
            return Err(RoostError::DenylistFile(cleaned_to));
        }

        if let Some(parent) = cleaned_to.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::rename(cleaned_from, cleaned_to)?;
        Ok(())
    }

    /// Creates a directory (and any missing parents) within the root.
    pub fn create_directory(&self, path: &str) -> RoostResult<()> {
        let cleaned = self.safe_path(path)?;
        std::fs::create_dir_all(cleaned)?;
        Ok(())
    }

    /// Sets the permission bits on a path within the root.
    pub fn chmod(&self, path: &str, mode: u32) -> RoostResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let cleaned = self.safe_path(path)?;
        std::fs::set_permissions(cleaned, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Sets the modification time on a path within the root.
    pub fn chtimes(&self, path: &str, modified: SystemTime) -> RoostResult<()> {
        let cleaned = self.safe_path(path)?;
        filetime::set_file_mtime(cleaned, filetime::FileTime::from_system_time(modified))?;
        Ok(())
    }

    /// Stats a single path within the root.
    pub fn stat(&self, path: &str) -> RoostResult<FileEntry> {
        let cleaned = self.safe_path(path)?;
        let meta = std::fs::symlink_metadata(&cleaned)?;
        let name = cleaned
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        Ok(FileEntry::from_metadata(name, &meta))
    }

    /// Lists a directory within the root, directories first, names sorted
    /// case-insensitively.
    pub async fn list_directory(self: &Arc<Self>, path: &str) -> RoostResult<Vec<FileEntry>> {
        let cleaned = self.safe_path(path)?;

        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&cleaned)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                entries.push(FileEntry::from_metadata(
                    entry.file_name().to_string_lossy().into_owned(),
                    &meta,
                ));
            }

            entries.sort_by(|a, b| {
                b.directory
                    .cmp(&a.directory)
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            });

            Ok(entries)
        })
        .await?
    }

    //----------------------------------------------------------------------------------------------
    // Helpers
    //----------------------------------------------------------------------------------------------

    fn compile_denylist(root: &Path, patterns: &[String]) -> RoostResult<Gitignore> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|err| RoostError::InvalidArgument(format!("bad denylist pattern: {}", err)))?;
        }

        builder
            .build()
            .map_err(|err| RoostError::InvalidArgument(format!("bad denylist: {}", err)))
    }

    /// Expands a chain of symlinks at `current` until a non-link (or missing)
    /// path remains, verifying containment after each hop.
    fn expand_symlinks(&self, mut current: PathBuf, requested: &Path) -> RoostResult<PathBuf> {
        let mut depth = 0;

        loop {
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    depth += 1;
                    if depth > MAX_SYMLINK_DEPTH {
                        return Err(RoostError::PathResolution(requested.to_path_buf()));
                    }

                    let target = std::fs::read_link(&current)?;
                    let base = current
                        .parent()
                        .unwrap_or(self.root.as_path())
                        .to_path_buf();

                    current = if target.is_absolute() {
                        lexically_clean(&target)
                    } else {
                        lexically_clean(&base.join(target))
                    };
                }
                // Missing trailing components are allowed for creation flows.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(current),
                Err(err) => return Err(err.into()),
                Ok(_) => return Ok(current),
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Removes `.` components and resolves `..` lexically without touching the
/// filesystem. Popping past the filesystem root stays at the root.
fn lexically_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => cleaned.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::Normal(part) => cleaned.push(part),
            Component::Prefix(_) => {}
        }
    }

    cleaned
}

impl FileEntry {
    fn from_metadata(name: String, meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let modified: DateTime<Utc> = meta
            .modified()
            .map(Into::into)
            .unwrap_or_else(|_| Utc::now());
        let created: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified);

        Self {
            name,
            created,
            modified,
            mode: format!("{:04o}", meta.permissions().mode() & 0o7777),
            size: if meta.is_dir() { 0 } else { meta.len() },
            directory: meta.is_dir(),
            file: meta.is_file(),
            symlink: meta.file_type().is_symlink(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn filesystem(limit: i64) -> (tempfile::TempDir, Arc<Filesystem>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new(
            dir.path().join("data"),
            limit,
            &[],
            Duration::from_secs(120),
        )
        .unwrap();
        (dir, Arc::new(fs))
    }

    #[test]
    fn test_safe_path_stays_inside_root() {
        let (_dir, fs) = filesystem(0);

        let resolved = fs.safe_path("logs/latest.log").unwrap();
        assert!(resolved.starts_with(fs.root()));
        assert!(resolved.ends_with("logs/latest.log"));
    }

    #[test]
    fn test_safe_path_rejects_parent_traversal() {
        let (_dir, fs) = filesystem(0);

        let err = fs.safe_path("../../../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);

        let err = fs.safe_path("saves/../../escape.txt").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);
    }

    #[test]
    fn test_safe_path_allows_traversal_that_stays_inside() {
        let (_dir, fs) = filesystem(0);

        let resolved = fs.safe_path("saves/../logs/latest.log").unwrap();
        assert_eq!(resolved, fs.root().join("logs/latest.log"));
    }

    #[test]
    fn test_safe_path_rejects_symlink_escape() {
        let (dir, fs) = filesystem(0);

        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fs.root().join("sneaky")).unwrap();

        let err = fs.safe_path("sneaky/target.txt").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);
    }

    #[test]
    fn test_safe_path_allows_symlink_inside_root() {
        let (_dir, fs) = filesystem(0);

        std::fs::create_dir_all(fs.root().join("world")).unwrap();
        std::os::unix::fs::symlink(fs.root().join("world"), fs.root().join("current")).unwrap();

        let resolved = fs.safe_path("current/level.dat").unwrap();
        assert_eq!(resolved, fs.root().join("world/level.dat"));
    }

    #[test]
    fn test_safe_path_allows_missing_trailing_components() {
        let (_dir, fs) = filesystem(0);

        let resolved = fs.safe_path("plugins/not/yet/created.yml").unwrap();
        assert!(resolved.starts_with(fs.root()));
    }

    #[tokio::test]
    async fn test_parallel_safe_path_fails_fast() {
        let (dir, fs) = filesystem(0);

        let outside = dir.path().join("elsewhere");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fs.root().join("link")).unwrap();

        let err = fs
            .parallel_safe_path(vec![
                "a.txt".to_string(),
                "link/b.txt".to_string(),
                "c.txt".to_string(),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);
    }

    #[tokio::test]
    async fn test_parallel_safe_path_preserves_order() {
        let (_dir, fs) = filesystem(0);

        let resolved = fs
            .parallel_safe_path(vec!["b.txt".to_string(), "a.txt".to_string()])
            .await
            .unwrap();

        assert!(resolved[0].ends_with("b.txt"));
        assert!(resolved[1].ends_with("a.txt"));
    }

    #[test]
    fn test_write_file_tracks_usage_exactly() {
        let (_dir, fs) = filesystem(0);

        let payload = vec![7u8; 10_000];
        let written = fs
            .write_file_sync("save/world.dat", &mut Cursor::new(&payload), None)
            .unwrap();

        assert_eq!(written, 10_000);
        assert_eq!(fs.cached_usage(), 10_000);

        // Overwriting with a smaller payload shrinks the ledger.
        let payload = vec![7u8; 1_000];
        fs.write_file_sync("save/world.dat", &mut Cursor::new(&payload), None)
            .unwrap();
        assert_eq!(fs.cached_usage(), 1_000);
    }

    #[test]
    fn test_write_file_quota_exhaustion_removes_partial() {
        let (_dir, fs) = filesystem(1024);

        let payload = vec![0u8; 2048];
        let err = fs
            .write_file_sync("big.bin", &mut Cursor::new(&payload), None)
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::DiskSpace);
        assert!(!fs.root().join("big.bin").exists());
        assert_eq!(fs.cached_usage(), 0);
    }

    #[test]
    fn test_write_file_rejects_directory_target() {
        let (_dir, fs) = filesystem(0);
        std::fs::create_dir_all(fs.root().join("plugins")).unwrap();

        let err = fs
            .write_file_sync("plugins", &mut Cursor::new(b"data".to_vec()), None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IsDirectory);
    }

    #[test]
    fn test_denylist_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new(
            dir.path().join("data"),
            0,
            &["*.jar".to_string(), "configs/".to_string()],
            Duration::from_secs(120),
        )
        .unwrap();

        let err = fs
            .write_file_sync("mods/core.jar", &mut Cursor::new(b"x".to_vec()), None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Denylist);

        assert!(fs.is_ignored("configs/secret.yml"));
        assert!(!fs.is_ignored("logs/latest.log"));
    }

    #[tokio::test]
    async fn test_delete_subtracts_freed_bytes() {
        let (_dir, fs) = filesystem(0);

        fs.write_file_sync("a.bin", &mut Cursor::new(vec![1u8; 512]), None)
            .unwrap();
        fs.write_file_sync("keep.bin", &mut Cursor::new(vec![1u8; 256]), None)
            .unwrap();
        assert_eq!(fs.cached_usage(), 768);

        fs.delete("a.bin").await.unwrap();
        assert_eq!(fs.cached_usage(), 256);
    }

    #[tokio::test]
    async fn test_forced_disk_usage_matches_tree() {
        let (_dir, fs) = filesystem(0);

        fs.write_file_sync("one.bin", &mut Cursor::new(vec![1u8; 300]), None)
            .unwrap();
        fs.write_file_sync("deep/two.bin", &mut Cursor::new(vec![1u8; 700]), None)
            .unwrap();

        let usage = fs.disk_usage(true).await.unwrap();
        assert_eq!(usage, 1000);
        assert_eq!(fs.cached_usage(), 1000);
    }

    #[tokio::test]
    async fn test_list_directory_orders_directories_first() {
        let (_dir, fs) = filesystem(0);

        std::fs::create_dir_all(fs.root().join("zebra")).unwrap();
        fs.write_file_sync("alpha.txt", &mut Cursor::new(b"a".to_vec()), None)
            .unwrap();

        let entries = fs.list_directory("/").await.unwrap();
        assert_eq!(entries[0].name, "zebra");
        assert!(entries[0].directory);
        assert_eq!(entries[1].name, "alpha.txt");
    }

    #[test]
    fn test_write_file_cancellation_removes_partial() {
        let (_dir, fs) = filesystem(0);

        let token = CancellationToken::new();
        token.cancel();

        let err = fs
            .write_file_sync(
                "partial.bin",
                &mut Cursor::new(vec![0u8; 8192]),
                Some(&token),
            )
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Internal);
        assert!(!fs.root().join("partial.bin").exists());
        assert_eq!(fs.cached_usage(), 0);
    }
}
