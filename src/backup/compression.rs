// Gzip helpers for plain SQL artifacts, run on the blocking pool

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

async fn blocking<F>(work: F) -> io::Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Compress `src` into `dest`. `dest` is removed if compression fails.
pub async fn gzip_file(src: &Path, dest: &Path, level: u32) -> io::Result<()> {
    let (src, dest): (PathBuf, PathBuf) = (src.into(), dest.into());
    blocking(move || {
        let result = (|| {
            let mut reader = BufReader::new(File::open(&src)?);
            let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dest)?), Compression::new(level));
            io::copy(&mut reader, &mut encoder)?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
            writer.get_ref().sync_all()
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&dest);
        }
        result
    })
    .await
}

/// Decompress `src` into `dest`. `dest` is removed if decompression fails.
pub async fn gunzip_file(src: &Path, dest: &Path) -> io::Result<()> {
    let (src, dest): (PathBuf, PathBuf) = (src.into(), dest.into());
    blocking(move || {
        let result = (|| {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
            let mut writer = BufWriter::new(File::create(&dest)?);
            io::copy(&mut decoder, &mut writer)?;
            writer.flush()
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&dest);
        }
        result
    })
    .await
}

/// Whether the file starts with the gzip magic bytes
pub async fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic).await {
        Ok(_) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gzip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sql = dir.path().join("full.sql");
        let gz = dir.path().join("full.sql.gz");
        let back = dir.path().join("restored.sql");

        let script = "CREATE TABLE users (id int);\n".repeat(500);
        tokio::fs::write(&sql, &script).await.unwrap();

        gzip_file(&sql, &gz, 6).await.unwrap();
        assert!(is_gzip(&gz).await.unwrap());
        assert!(!is_gzip(&sql).await.unwrap());

        gunzip_file(&gz, &back).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&back).await.unwrap(), script);
    }

    #[tokio::test]
    async fn test_gunzip_garbage_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.sql.gz");
        let out = dir.path().join("out.sql");
        tokio::fs::write(&bogus, b"not gzip at all").await.unwrap();

        assert!(gunzip_file(&bogus, &out).await.is_err());
        assert!(!out.exists());
    }
}
