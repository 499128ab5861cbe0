//! Disk-quota ledger and the lazy full rescan.

use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use crate::{RoostError, RoostResult};

use super::Filesystem;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Configured disk quota in bytes. Zero or negative means unlimited.
    pub fn disk_limit(&self) -> i64 {
        self.disk_limit.load(Ordering::Acquire)
    }

    /// Replaces the quota, used when the panel syncs new build limits.
    pub fn set_disk_limit(&self, limit: i64) {
        self.disk_limit.store(limit, Ordering::Release);
    }

    /// Current ledger value without triggering a rescan.
    pub fn cached_usage(&self) -> i64 {
        self.disk_used.load(Ordering::Acquire)
    }

    /// Fails with a `disk_space` error when adding `delta` bytes would put the
    /// server over its quota. Lock-free; reads the ledger atomically.
    pub fn has_space_for(&self, delta: i64) -> RoostResult<()> {
        let limit = self.disk_limit();
        if limit <= 0 {
            return Ok(());
        }

        if self.cached_usage() + delta > limit {
            return Err(RoostError::DiskSpace);
        }

        Ok(())
    }

    /// Adjusts the ledger by `delta`, clamping at zero so transient
    /// double-subtracts cannot push it negative.
    pub(crate) fn add_disk(&self, delta: i64) -> i64 {
        let mut current = self.disk_used.load(Ordering::Acquire);
        loop {
            let next = (current + delta).max(0);
            match self.disk_used.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Returns the disk usage of the server root in bytes.
    ///
    /// The cached ledger value is returned unless `force` is set or the value
    /// is older than the configured check interval, in which case the tree is
    /// walked under the usage lock. Concurrent callers coalesce: whoever
    /// arrives while a walk is running waits for it and reuses the result.
    /// Dropping the future mid-walk leaves the ledger untouched.
    pub async fn disk_usage(self: &Arc<Self>, force: bool) -> RoostResult<i64> {
        if !force && !self.usage_is_stale() {
            return Ok(self.cached_usage());
        }

        let _guard = self.usage_lock.lock().await;

        // A walk that finished while this caller waited on the lock is fresh
        // enough to reuse.
        if !force && !self.usage_is_stale() {
            return Ok(self.cached_usage());
        }

        let root = self.root.clone();
        let size = tokio::task::spawn_blocking(move || walk_size(&root)).await??;

        self.disk_used.store(size, Ordering::Release);
        *self
            .disk_checked_at
            .lock()
            .expect("disk check lock poisoned") = Some(Instant::now());

        Ok(size)
    }

    fn usage_is_stale(&self) -> bool {
        match *self
            .disk_checked_at
            .lock()
            .expect("disk check lock poisoned")
        {
            Some(checked_at) => checked_at.elapsed() > self.check_interval,
            None => true,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Sums the size of every regular file under `path` without following
/// symlinks.
pub(super) fn walk_size(path: &Path) -> std::io::Result<i64> {
    let mut total: i64 = 0;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;

        if meta.file_type().is_symlink() {
            continue;
        }

        if meta.is_dir() {
            total += walk_size(&entry.path())?;
        } else {
            total += meta.len() as i64;
        }
    }

    Ok(total)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::Arc, time::Duration};

    use super::super::Filesystem;

    #[test]
    fn test_has_space_for_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let fs =
            Filesystem::new(dir.path().join("data"), 0, &[], Duration::from_secs(10)).unwrap();

        assert!(fs.has_space_for(i64::MAX / 2).is_ok());
    }

    #[test]
    fn test_has_space_for_enforces_limit() {
        let dir = tempfile::tempdir().unwrap();
        let fs =
            Filesystem::new(dir.path().join("data"), 100, &[], Duration::from_secs(10)).unwrap();

        assert!(fs.has_space_for(100).is_ok());
        assert!(fs.has_space_for(101).is_err());

        fs.add_disk(60);
        assert!(fs.has_space_for(40).is_ok());
        assert!(fs.has_space_for(41).is_err());
    }

    #[test]
    fn test_add_disk_clamps_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let fs =
            Filesystem::new(dir.path().join("data"), 0, &[], Duration::from_secs(10)).unwrap();

        fs.add_disk(50);
        assert_eq!(fs.add_disk(-80), 0);
    }

    #[tokio::test]
    async fn test_disk_usage_uses_cache_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(
            Filesystem::new(dir.path().join("data"), 0, &[], Duration::from_secs(600)).unwrap(),
        );

        fs.write_file_sync("a.bin", &mut Cursor::new(vec![0u8; 128]), None)
            .unwrap();
        assert_eq!(fs.disk_usage(true).await.unwrap(), 128);

        // Bypass the ledger so a cached read is distinguishable from a walk.
        std::fs::write(fs.root().join("b.bin"), vec![0u8; 64]).unwrap();
        assert_eq!(fs.disk_usage(false).await.unwrap(), 128);
        assert_eq!(fs.disk_usage(true).await.unwrap(), 192);
    }
}
