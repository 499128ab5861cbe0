//! Archive creation and extraction under the filesystem sandbox.
//!
//! This module handles:
//! - Streaming `tar.gz` creation with a counting writer and post-hoc quota
//!   accounting
//! - Archive format identification by header magic
//! - Extraction that funnels every entry through the quota-checked writer,
//!   making zip-slip attempts fail at safe-path resolution
//!
//! Symlink entries inside archives are dropped entirely rather than followed
//! or materialized. Entries whose normalized name is empty or `.` are skipped.

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{SecondsFormat, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tokio_util::sync::CancellationToken;

use crate::{RoostError, RoostResult};

use super::{FileEntry, Filesystem};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An identified archive container or single-file compression stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// A zip container.
    Zip,

    /// A tar container, possibly wrapped in a compression codec.
    Tar(CompressionCodec),

    /// A lone compressed file such as `server.log.gz`.
    SingleFile(CompressionCodec),
}

/// Stream compression codecs recognized by header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    /// No compression wrapper.
    None,

    /// Gzip.
    Gzip,

    /// Bzip2.
    Bzip2,

    /// Xz / LZMA2.
    Xz,

    /// Zstandard.
    Zstd,
}

/// A writer that counts the bytes flowing through it.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods: Compression
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Compresses the given paths, relative to `dir`, into a timestamped
    /// `tar.gz` placed inside `dir`.
    ///
    /// The archive is written through a counting writer; if the finished size
    /// no longer fits the quota the archive is removed again and a
    /// `disk_space` error is returned, otherwise its size is added to the
    /// usage ledger.
    pub async fn compress_files(
        self: &Arc<Self>,
        dir: &str,
        paths: Vec<String>,
        token: CancellationToken,
    ) -> RoostResult<FileEntry> {
        let cleaned_dir = self.safe_path(dir)?;
        let base = cleaned_dir
            .strip_prefix(self.root())
            .unwrap_or_else(|_| Path::new(""))
            .to_path_buf();

        let joined = paths
            .into_iter()
            .map(|p| base.join(p).to_string_lossy().into_owned())
            .collect();
        let cleaned = self.parallel_safe_path(joined).await?;

        let name = format!(
            "archive-{}.tar.gz",
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .replace(':', "")
        );
        let destination = cleaned_dir.join(&name);

        let fs = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let written = fs.build_archive(&cleaned_dir, &destination, &cleaned, &token)?;

            if let Err(err) = fs.has_space_for(written as i64) {
                let _ = std::fs::remove_file(&destination);
                return Err(err);
            }

            let meta = match std::fs::metadata(&destination) {
                Ok(meta) => meta,
                Err(err) => {
                    let _ = std::fs::remove_file(&destination);
                    return Err(err.into());
                }
            };

            fs.add_disk(written as i64);
            Ok(FileEntry::from_metadata(name, &meta))
        })
        .await?
    }

    fn build_archive(
        &self,
        base: &Path,
        destination: &Path,
        sources: &[PathBuf],
        token: &CancellationToken,
    ) -> RoostResult<u64> {
        let result = (|| -> RoostResult<u64> {
            let file = File::create(destination)?;
            let encoder = GzEncoder::new(
                CountingWriter {
                    inner: file,
                    written: 0,
                },
                Compression::default(),
            );

            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);

            for source in sources {
                if token.is_cancelled() {
                    return Err(RoostError::Cancelled);
                }

                let relative = source
                    .strip_prefix(base)
                    .or_else(|_| source.strip_prefix(self.root()))
                    .map_err(|_| RoostError::PathResolution(source.clone()))?;

                let meta = std::fs::symlink_metadata(source)?;
                if meta.is_dir() {
                    builder.append_dir_all(relative, source)?;
                } else {
                    builder.append_path_with_name(source, relative)?;
                }
            }

            let mut counter = builder.into_inner()?.finish()?;
            counter.flush()?;
            Ok(counter.written)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(destination);
        }

        result
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: Decompression
//--------------------------------------------------------------------------------------------------

impl Filesystem {
    /// Walks the archive without extracting it, summing declared uncompressed
    /// sizes and failing early with `disk_space` once the sum plus the current
    /// usage exceeds the quota.
    ///
    /// Codecs that do not declare an uncompressed size are stream-counted with
    /// the same early abort, so no bytes ever land on disk.
    pub async fn space_available_for_decompression(
        self: &Arc<Self>,
        dir: &str,
        file: &str,
        token: CancellationToken,
    ) -> RoostResult<()> {
        let limit = self.disk_limit();
        if limit <= 0 {
            return Ok(());
        }

        let source = self.safe_path(join_entry(dir, file))?;
        let dir_size = self.disk_usage(false).await?;

        tokio::task::spawn_blocking(move || {
            let format = identify_format(&source)?;
            let mut sum: i64 = 0;
            let mut account = |add: i64| -> RoostResult<()> {
                sum += add;
                if dir_size + sum > limit {
                    return Err(RoostError::DiskSpace);
                }
                Ok(())
            };

            match format {
                ArchiveFormat::Zip => {
                    let mut archive = zip::ZipArchive::new(File::open(&source)?)?;
                    for index in 0..archive.len() {
                        if token.is_cancelled() {
                            return Err(RoostError::Cancelled);
                        }
                        let entry = archive.by_index_raw(index)?;
                        account(entry.size() as i64)?;
                    }
                }
                ArchiveFormat::Tar(codec) => {
                    let mut archive = tar::Archive::new(open_codec(codec, File::open(&source)?)?);
                    for entry in archive.entries()? {
                        if token.is_cancelled() {
                            return Err(RoostError::Cancelled);
                        }
                        account(entry?.header().size()? as i64)?;
                    }
                }
                ArchiveFormat::SingleFile(codec) => {
                    let mut reader = open_codec(codec, File::open(&source)?)?;
                    let mut buffer = [0u8; 32 * 1024];
                    loop {
                        if token.is_cancelled() {
                            return Err(RoostError::Cancelled);
                        }
                        let read = reader.read(&mut buffer)?;
                        if read == 0 {
                            break;
                        }
                        account(read as i64)?;
                    }
                }
            }

            Ok(())
        })
        .await?
    }

    /// Extracts the archive at `dir/file` into `dir`.
    ///
    /// Every entry streams through the quota-checked writer; entries matching
    /// the denylist are skipped silently, entries escaping the root fail the
    /// whole extraction with `path_resolution`.
    pub async fn decompress(
        self: &Arc<Self>,
        dir: &str,
        file: &str,
        token: CancellationToken,
    ) -> RoostResult<()> {
        let source = self.safe_path(join_entry(dir, file))?;
        let dir = dir.to_string();

        let fs = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let format = identify_format(&source)?;
            match format {
                ArchiveFormat::Zip => fs.extract_zip(&source, &dir, &token),
                ArchiveFormat::Tar(codec) => {
                    let reader = open_codec(codec, File::open(&source)?)?;
                    fs.extract_tar(reader, &dir, &token)
                }
                ArchiveFormat::SingleFile(codec) => {
                    fs.extract_single_file(&source, codec, &dir, &token)
                }
            }
        })
        .await?
    }

    /// Stream-extracts a `tar.gz` from an arbitrary reader into the server
    /// root. Used for backup restores and incoming transfers.
    pub fn extract_tar_gz_reader(
        &self,
        reader: impl Read + 'static,
        token: &CancellationToken,
    ) -> RoostResult<()> {
        self.extract_tar(Box::new(GzDecoder::new(BufReader::new(reader))), "", token)
    }

    fn extract_tar(
        &self,
        reader: Box<dyn Read>,
        dir: &str,
        token: &CancellationToken,
    ) -> RoostResult<()> {
        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries()? {
            if token.is_cancelled() {
                return Err(RoostError::Cancelled);
            }

            let mut entry = entry?;
            let kind = entry.header().entry_type();
            if kind.is_dir() {
                continue;
            }
            // Links are never followed or materialized.
            if kind.is_symlink() || kind.is_hard_link() {
                continue;
            }
            if !kind.is_file() {
                continue;
            }

            let raw = entry.path_bytes().into_owned();
            let name = match self.decode_entry_name(&raw) {
                Some(name) => name,
                None => {
                    return Err(RoostError::InvalidArgument(
                        "archive entry name is not valid UTF-8".to_string(),
                    ))
                }
            };
            if is_empty_entry_name(&name) {
                continue;
            }

            let target = join_entry(dir, &name);
            if self.is_ignored(&target) {
                continue;
            }

            let mode = entry.header().mode().ok();
            let mtime = entry.header().mtime().ok();

            self.write_file_sync(&target, &mut entry, Some(token))?;

            if let Some(mode) = mode {
                self.chmod(&target, mode)?;
            }
            if let Some(mtime) = mtime {
                self.chtimes(&target, SystemTime::UNIX_EPOCH + Duration::from_secs(mtime))?;
            }
        }

        Ok(())
    }

    fn extract_zip(&self, source: &Path, dir: &str, token: &CancellationToken) -> RoostResult<()> {
        let mut archive = zip::ZipArchive::new(File::open(source)?)?;

        for index in 0..archive.len() {
            if token.is_cancelled() {
                return Err(RoostError::Cancelled);
            }

            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }

            // The zip library already decodes names per the archive's declared
            // encoding flag.
            let name = entry.name().to_string();
            if is_empty_entry_name(&name) {
                continue;
            }

            // Symlink entries are dropped, never followed.
            if entry
                .unix_mode()
                .map_or(false, |mode| mode & 0o170000 == 0o120000)
            {
                continue;
            }

            let target = join_entry(dir, &name);
            if self.is_ignored(&target) {
                continue;
            }

            let mode = entry.unix_mode();
            let mtime = zip_entry_mtime(&entry);

            self.write_file_sync(&target, &mut entry, Some(token))?;

            if let Some(mode) = mode {
                self.chmod(&target, mode & 0o7777)?;
            }
            if let Some(mtime) = mtime {
                self.chtimes(&target, mtime)?;
            }
        }

        Ok(())
    }

    fn extract_single_file(
        &self,
        source: &Path,
        codec: CompressionCodec,
        dir: &str,
        token: &CancellationToken,
    ) -> RoostResult<()> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RoostError::InvalidArgument("invalid archive file name".to_string()))?;

        // Strip the compression suffix to derive the target name.
        let target_name = match name.rsplit_once('.') {
            Some((base, _)) if !base.is_empty() => base,
            _ => {
                return Err(RoostError::InvalidArgument(
                    "cannot derive a target name for the compressed file".to_string(),
                ))
            }
        };

        let target = join_entry(dir, target_name);
        if self.is_ignored(&target) {
            return Ok(());
        }

        let mut reader = open_codec(codec, File::open(source)?)?;
        self.write_file_sync(&target, &mut reader, Some(token))?;

        Ok(())
    }

    fn decode_entry_name(&self, raw: &[u8]) -> Option<String> {
        match std::str::from_utf8(raw) {
            Ok(name) => Some(name.to_string()),
            Err(_) if self.legacy_filename_fallback() => {
                Some(String::from_utf8_lossy(raw).into_owned())
            }
            Err(_) => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Identifies an archive by its header magic, falling back to the ustar
/// marker at offset 257 for uncompressed tarballs.
pub fn identify_format(path: &Path) -> RoostResult<ArchiveFormat> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 6];
    let read = read_up_to(&mut file, &mut magic)?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if read >= 4 && magic[..4] == [0x50, 0x4b, 0x03, 0x04] {
        return Ok(ArchiveFormat::Zip);
    }

    let codec = if read >= 2 && magic[..2] == [0x1f, 0x8b] {
        Some(CompressionCodec::Gzip)
    } else if read >= 3 && &magic[..3] == b"BZh" {
        Some(CompressionCodec::Bzip2)
    } else if read >= 6 && magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        Some(CompressionCodec::Xz)
    } else if read >= 4 && magic[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        Some(CompressionCodec::Zstd)
    } else {
        None
    };

    if let Some(codec) = codec {
        if is_tarball_name(&name, codec) {
            return Ok(ArchiveFormat::Tar(codec));
        }
        return Ok(ArchiveFormat::SingleFile(codec));
    }

    let mut ustar = [0u8; 5];
    file.seek(SeekFrom::Start(257))?;
    if read_up_to(&mut file, &mut ustar)? == 5 && &ustar == b"ustar" {
        return Ok(ArchiveFormat::Tar(CompressionCodec::None));
    }

    Err(RoostError::UnknownArchive)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn is_tarball_name(name: &str, codec: CompressionCodec) -> bool {
    match codec {
        CompressionCodec::None => true,
        CompressionCodec::Gzip => name.ends_with(".tar.gz") || name.ends_with(".tgz"),
        CompressionCodec::Bzip2 => name.ends_with(".tar.bz2") || name.ends_with(".tbz2"),
        CompressionCodec::Xz => name.ends_with(".tar.xz") || name.ends_with(".txz"),
        CompressionCodec::Zstd => name.ends_with(".tar.zst") || name.ends_with(".tzst"),
    }
}

fn open_codec(codec: CompressionCodec, file: File) -> RoostResult<Box<dyn Read>> {
    let reader = BufReader::new(file);
    Ok(match codec {
        CompressionCodec::None => Box::new(reader),
        CompressionCodec::Gzip => Box::new(GzDecoder::new(reader)),
        CompressionCodec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        CompressionCodec::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        CompressionCodec::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

fn join_entry(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn is_empty_entry_name(name: &str) -> bool {
    let trimmed = name.trim_matches('/');
    trimmed.is_empty() || trimmed == "."
}

fn zip_entry_mtime(entry: &zip::read::ZipFile) -> Option<SystemTime> {
    let dt = entry.last_modified();
    let date = chrono::NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?;
    let time = chrono::NaiveTime::from_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let stamp = chrono::NaiveDateTime::new(date, time).and_utc().timestamp();

    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(stamp.max(0) as u64))
}

fn read_up_to(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    Ok(filled)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
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
    use super::*;
    use std::{io::Cursor, sync::Arc, time::Duration as StdDuration};

    fn filesystem(limit: i64) -> (tempfile::TempDir, Arc<Filesystem>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new(
            dir.path().join("data"),
            limit,
            &[],
            StdDuration::from_secs(120),
        )
        .unwrap();
        (dir, Arc::new(fs))
    }

    /// Builds a raw ustar entry so tests control the stored name byte for
    /// byte, including names a well-behaved builder would refuse.
    fn raw_tar_entry(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[100..107].copy_from_slice(b"0000644");
        header[108..115].copy_from_slice(b"0000000");
        header[116..123].copy_from_slice(b"0000000");
        let size = format!("{:011o}", data.len());
        header[124..135].copy_from_slice(size.as_bytes());
        header[136..147].copy_from_slice(b"00000000000");
        header[156] = b'0';
        header[257..262].copy_from_slice(b"ustar");
        header[263..265].copy_from_slice(b"00");

        // Checksum is computed with the checksum field itself as spaces.
        header[148..156].copy_from_slice(b"        ");
        let sum: u64 = header.iter().map(|b| *b as u64).sum();
        let checksum = format!("{:06o}\0 ", sum);
        header[148..156].copy_from_slice(checksum.as_bytes());

        let mut out = header;
        out.extend_from_slice(data);
        let padding = (512 - data.len() % 512) % 512;
        out.extend(std::iter::repeat(0u8).take(padding));
        out
    }

    fn finish_tar(mut body: Vec<u8>) -> Vec<u8> {
        body.extend(std::iter::repeat(0u8).take(1024));
        body
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_compress_then_decompress_round_trips() {
        let (_dir, fs) = filesystem(0);

        fs.write_file_sync("world/level.dat", &mut Cursor::new(vec![3u8; 2048]), None)
            .unwrap();
        fs.write_file_sync("server.properties", &mut Cursor::new(b"motd=hi\n".to_vec()), None)
            .unwrap();
        fs.chmod("server.properties", 0o640).unwrap();

        let archive = fs
            .compress_files(
                "/",
                vec!["world".to_string(), "server.properties".to_string()],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(archive.name.starts_with("archive-"));
        assert!(archive.name.ends_with(".tar.gz"));
        assert!(!archive.name.contains(':'));

        let (_other, target) = filesystem(0);
        std::fs::copy(
            fs.root().join(&archive.name),
            target.root().join(&archive.name),
        )
        .unwrap();
        target.disk_usage(true).await.unwrap();

        target
            .decompress("/", &archive.name, CancellationToken::new())
            .await
            .unwrap();

        let restored = std::fs::read(target.root().join("world/level.dat")).unwrap();
        assert_eq!(restored, vec![3u8; 2048]);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(target.root().join("server.properties"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o640);
    }

    #[tokio::test]
    async fn test_zip_slip_entry_is_refused() {
        let (dir, fs) = filesystem(0);

        let body = finish_tar(raw_tar_entry("../evil", b"owned"));
        std::fs::write(fs.root().join("slip.tar"), body).unwrap();

        let err = fs
            .decompress("/", "slip.tar", CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);
        assert!(!dir.path().join("evil").exists());
        assert!(!dir.path().join("data/evil").exists());
    }

    #[tokio::test]
    async fn test_deeply_nested_traversal_is_refused() {
        let (dir, fs) = filesystem(0);

        let body = finish_tar(raw_tar_entry("../../../../etc/evil", b"owned"));
        std::fs::write(fs.root().join("slip.tar"), body).unwrap();

        let err = fs
            .decompress("/", "slip.tar", CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::PathResolution);
        assert!(!fs.root().join("etc").exists());
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn test_space_check_fails_before_any_write() {
        let (_dir, fs) = filesystem(1024);

        let body = finish_tar(raw_tar_entry("big.bin", &vec![0u8; 4096]));
        std::fs::write(fs.root().join("big.tar"), body).unwrap();
        fs.disk_usage(true).await.unwrap();

        let err = fs
            .space_available_for_decompression("/", "big.tar", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DiskSpace);

        let err = fs
            .decompress("/", "big.tar", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DiskSpace);
        assert!(!fs.root().join("big.bin").exists());
    }

    #[tokio::test]
    async fn test_single_file_gz_strips_suffix() {
        let (_dir, fs) = filesystem(0);

        std::fs::write(fs.root().join("server.log.gz"), gzip(b"line one\nline two\n")).unwrap();

        fs.decompress("/", "server.log.gz", CancellationToken::new())
            .await
            .unwrap();

        let restored = std::fs::read_to_string(fs.root().join("server.log")).unwrap();
        assert_eq!(restored, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_unknown_format_is_rejected() {
        let (_dir, fs) = filesystem(0);

        std::fs::write(fs.root().join("mystery.bin"), b"not an archive at all").unwrap();

        let err = fs
            .decompress("/", "mystery.bin", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnknownArchive);
    }

    #[tokio::test]
    async fn test_zero_byte_and_dot_entries() {
        let (_dir, fs) = filesystem(0);

        let mut body = raw_tar_entry("empty.txt", b"");
        body.extend(raw_tar_entry("./", b""));
        std::fs::write(fs.root().join("mixed.tar"), finish_tar(body)).unwrap();

        fs.decompress("/", "mixed.tar", CancellationToken::new())
            .await
            .unwrap();

        let meta = std::fs::metadata(fs.root().join("empty.txt")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_extraction_removes_partial_target() {
        let (_dir, fs) = filesystem(0);

        let body = finish_tar(raw_tar_entry("payload.bin", &vec![9u8; 8192]));
        std::fs::write(fs.root().join("payload.tar"), body).unwrap();
        let before = fs.disk_usage(true).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let err = fs
            .decompress("/", "payload.tar", token)
            .await
            .unwrap_err();
        assert!(matches!(err, RoostError::Cancelled));
        assert!(!fs.root().join("payload.bin").exists());
        assert_eq!(fs.cached_usage(), before);
    }

    #[tokio::test]
    async fn test_identify_by_magic_not_extension() {
        let (_dir, fs) = filesystem(0);

        // A gzip stream with a misleading name still identifies as gzip.
        std::fs::write(fs.root().join("data.weird"), gzip(b"contents")).unwrap();
        let format = identify_format(&fs.root().join("data.weird")).unwrap();
        assert_eq!(format, ArchiveFormat::SingleFile(CompressionCodec::Gzip));

        let body = finish_tar(raw_tar_entry("x", b"y"));
        std::fs::write(fs.root().join("archive.tar.gz"), gzip(&body)).unwrap();
        let format = identify_format(&fs.root().join("archive.tar.gz")).unwrap();
        assert_eq!(format, ArchiveFormat::Tar(CompressionCodec::Gzip));
    }
}
