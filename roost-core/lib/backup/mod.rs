//! Streaming backup creation and restoration.
//!
//! Backups are content-addressed by uuid and stored as `tar.gz` archives in
//! the configured backup directory. Creating a backup streams the server
//! root minus the ignore globs through a counting, hashing writer; it never
//! consumes the server's own disk quota. Restores run through the archive
//! engine, so the quota is enforced on the way back in.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use flate2::write::GzEncoder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{config::Config, server::Server, RoostError, RoostResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One backup job for a server.
pub struct Backup {
    uuid: Uuid,
    ignore: Vec<String>,
}

/// Result of a completed backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupDetails {
    /// Identifier assigned by the panel.
    pub uuid: Uuid,

    /// Archive checksum, prefixed with the algorithm.
    pub checksum: String,

    /// Archive size in bytes.
    pub size: u64,
}

/// Counts and hashes everything written through it.
struct DigestWriter<W: Write> {
    inner: W,
    digest: Sha256,
    written: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Backup {
    /// Creates a backup job for the given panel-assigned uuid and ignore
    /// globs.
    pub fn new(uuid: Uuid, ignore: Vec<String>) -> Self {
        Self { uuid, ignore }
    }

    /// On-disk location of this backup's archive.
    pub fn path(&self, config: &Config) -> PathBuf {
        PathBuf::from(config.get_system().get_backup_directory())
            .join(format!("{}.tar.gz", self.uuid))
    }

    /// Streams the server root into the backup archive, skipping the ignore
    /// globs, and reports the checksum and byte count.
    pub async fn create(
        &self,
        server: &Arc<Server>,
        config: Arc<Config>,
    ) -> RoostResult<BackupDetails> {
        let destination = self.path(&config);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let root = server.filesystem().root().to_path_buf();
        let matcher = compile_ignore(&root, &self.ignore)?;
        let level = config
            .get_system()
            .get_backups()
            .get_compression_level()
            .to_flate2();
        let uuid = self.uuid;

        let details = tokio::task::spawn_blocking(move || {
            let result = (|| -> RoostResult<BackupDetails> {
                let writer = DigestWriter {
                    inner: File::create(&destination)?,
                    digest: Sha256::new(),
                    written: 0,
                };

                let mut builder = tar::Builder::new(GzEncoder::new(writer, level));
                builder.follow_symlinks(false);

                append_tree(&mut builder, &root, &root, &matcher)?;

                let mut writer = builder.into_inner()?.finish()?;
                writer.flush()?;

                let size = writer.written;
                Ok(BackupDetails {
                    uuid,
                    checksum: format!("sha256:{}", writer.hex_digest()),
                    size,
                })
            })();

            if result.is_err() {
                let _ = std::fs::remove_file(&destination);
            }
            result
        })
        .await??;

        tracing::info!(
            backup = %details.uuid,
            checksum = %details.checksum,
            size = details.size,
            "completed server backup"
        );

        Ok(details)
    }

    /// Extracts the backup archive back into the server root. The quota is
    /// enforced per chunk by the archive engine.
    pub async fn restore(
        &self,
        server: &Arc<Server>,
        config: Arc<Config>,
        token: CancellationToken,
    ) -> RoostResult<()> {
        let source = self.path(&config);
        if !source.exists() {
            return Err(RoostError::NotFound(format!("backup {}", self.uuid)));
        }

        let filesystem = Arc::clone(server.filesystem());
        tokio::task::spawn_blocking(move || {
            filesystem.extract_tar_gz_reader(File::open(&source)?, &token)
        })
        .await?
    }

    /// Removes the backup archive. Missing archives are not an error.
    pub async fn delete(&self, config: Arc<Config>) -> RoostResult<()> {
        match tokio::fs::remove_file(self.path(&config)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl<W: Write> DigestWriter<W> {
    fn hex_digest(self) -> String {
        self.digest
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn compile_ignore(root: &Path, patterns: &[String]) -> RoostResult<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|err| RoostError::InvalidArgument(format!("bad ignore pattern: {}", err)))?;
    }

    builder
        .build()
        .map_err(|err| RoostError::InvalidArgument(format!("bad ignore set: {}", err)))
}

/// Walks the tree under `dir`, appending entries relative to `root` and
/// pruning anything the ignore set matches. Symlinks are skipped.
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    matcher: &Gitignore,
) -> RoostResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;

        if matcher
            .matched_path_or_any_parents(&path, meta.is_dir())
            .is_ignore()
        {
            continue;
        }

        let relative = path.strip_prefix(root).expect("walk stays under root");

        if meta.is_dir() {
            builder.append_dir(relative, &path)?;
            append_tree(builder, root, &path, matcher)?;
        } else if meta.file_type().is_symlink() {
            continue;
        } else {
            builder.append_path_with_name(&path, relative)?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use uuid::Uuid;

    use super::*;
    use crate::server::test_support::{test_config, test_server};

    #[tokio::test]
    async fn test_backup_round_trip_with_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());
        let config = test_config(dir.path()).snapshot();

        let fs = server.filesystem();
        fs.write_file_sync("world/level.dat", &mut Cursor::new(vec![5u8; 1024]), None)
            .unwrap();
        fs.write_file_sync("cache/tmp.bin", &mut Cursor::new(vec![9u8; 512]), None)
            .unwrap();

        let backup = Backup::new(Uuid::new_v4(), vec!["cache/".to_string()]);
        let details = backup.create(&server, config.clone()).await.unwrap();

        assert!(details.checksum.starts_with("sha256:"));
        assert!(details.size > 0);
        assert!(backup.path(&config).exists());

        // Wipe and restore; the ignored directory must not come back.
        fs.delete("world").await.unwrap();
        fs.delete("cache").await.unwrap();

        backup
            .restore(&server, config.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(fs.root().join("world/level.dat")).unwrap(),
            vec![5u8; 1024]
        );
        assert!(!fs.root().join("cache").exists());

        backup.delete(config.clone()).await.unwrap();
        assert!(!backup.path(&config).exists());
    }

    #[tokio::test]
    async fn test_backup_does_not_touch_server_quota() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());
        let config = test_config(dir.path()).snapshot();

        let fs = server.filesystem();
        fs.write_file_sync("data.bin", &mut Cursor::new(vec![1u8; 2048]), None)
            .unwrap();
        let before = fs.cached_usage();

        Backup::new(Uuid::new_v4(), Vec::new())
            .create(&server, config)
            .await
            .unwrap();

        assert_eq!(fs.cached_usage(), before);
    }

    #[tokio::test]
    async fn test_restore_missing_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _environment) = test_server(dir.path());
        let config = test_config(dir.path()).snapshot();

        let err = Backup::new(Uuid::new_v4(), Vec::new())
            .restore(&server, config, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }
}
