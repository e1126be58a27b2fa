//! TAR packing of part directories.
//!
//! A part is serialized as a TAR stream of its files in deterministic
//! order with zeroed mtime/uid/gid, so the stream is a pure function of
//! the file contents. Long member names are handled by the GNU long-name
//! extension, which also lifts destination filesystem name limits out of
//! the transfer path.

use std::io::Write;
use std::path::PathBuf;

use tokio::io::{AsyncRead, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::error::{EngineError, EngineResult};

/// Pipe buffer between the blocking TAR writer and the async consumer.
const PIPE_BUFFER: usize = 256 * 1024;

/// Produces a TAR stream of the given files under a base directory.
///
/// The returned handle must be awaited after the stream is consumed;
/// it carries producer-side failures such as a file disappearing while
/// being packed.
pub fn tarball_stream(
    base_dir: PathBuf,
    files: Vec<String>,
) -> (DuplexStream, JoinHandle<std::io::Result<()>>) {
    let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
    let bridge = SyncIoBridge::new(writer);

    let handle = tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(bridge);

        for file in files {
            let path = base_dir.join(&file);
            let mut source = std::fs::File::open(&path)?;
            let metadata = source.metadata()?;

            let mut header = tar::Header::new_gnu();
            header.set_size(metadata.len());
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            builder.append_data(&mut header, &file, &mut source)?;
        }

        let mut bridge = builder.into_inner()?;
        bridge.flush()?;
        Ok(())
    });

    (reader, handle)
}

/// Unpacks a TAR stream into a directory.
pub async fn unpack_tarball<R>(reader: R, dest: PathBuf) -> EngineResult<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(reader);

    let result = tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dest)?;
        let mut archive = tar::Archive::new(bridge);
        archive.set_preserve_permissions(false);
        archive.unpack(&dest)
    })
    .await
    .map_err(|e| EngineError::IntegrityError(format!("unpack task panicked: {}", e)))?;

    result.map_err(|e| EngineError::IntegrityError(format!("failed to unpack artifact: {}", e)))
}

/// Lists the member names and sizes of a TAR stream.
///
/// Used to verify an uploaded artifact against the catalog without
/// writing it to disk.
pub async fn tarball_entries<R>(reader: R) -> EngineResult<Vec<(String, u64)>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let bridge = SyncIoBridge::new(reader);

    let result = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<(String, u64)>> {
        let mut archive = tar::Archive::new(bridge);
        let mut entries = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let size = entry.header().size()?;

            // drain the member so the next header can be read
            std::io::copy(&mut entry, &mut std::io::sink())?;
            entries.push((name, size));
        }

        Ok(entries)
    })
    .await
    .map_err(|e| EngineError::IntegrityError(format!("listing task panicked: {}", e)))?;

    result.map_err(|e| EngineError::IntegrityError(format!("failed to read artifact: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    async fn collect<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_pack_unpack_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("columns.txt"), b"columns").unwrap();
        std::fs::write(src.path().join("nested/data.bin"), vec![7u8; 4096]).unwrap();

        let files = vec!["columns.txt".to_string(), "nested/data.bin".to_string()];
        let (reader, handle) = tarball_stream(src.path().to_path_buf(), files.clone());
        let tarball = collect(reader).await;
        handle.await.unwrap().unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_tarball(
            std::io::Cursor::new(tarball),
            dest.path().to_path_buf(),
        )
        .await
        .unwrap();

        assert_eq!(
            b"columns".as_slice(),
            std::fs::read(dest.path().join("columns.txt")).unwrap()
        );
        assert_eq!(
            vec![7u8; 4096],
            std::fs::read(dest.path().join("nested/data.bin")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_deterministic_output() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.bin"), b"aaa").unwrap();
        std::fs::write(src.path().join("b.bin"), b"bbb").unwrap();

        let files = vec!["a.bin".to_string(), "b.bin".to_string()];

        let (reader, handle) = tarball_stream(src.path().to_path_buf(), files.clone());
        let first = collect(reader).await;
        handle.await.unwrap().unwrap();

        // touch mtimes; the stream must not change
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
        let file = std::fs::File::options()
            .append(true)
            .open(src.path().join("a.bin"))
            .unwrap();
        file.set_modified(later).unwrap();

        let (reader, handle) = tarball_stream(src.path().to_path_buf(), files);
        let second = collect(reader).await;
        handle.await.unwrap().unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_long_member_names_survive() {
        let src = tempfile::tempdir().unwrap();
        let long_name = format!("{}.bin", "x".repeat(180));
        std::fs::write(src.path().join(&long_name), b"payload").unwrap();

        let (reader, handle) = tarball_stream(src.path().to_path_buf(), vec![long_name.clone()]);
        let tarball = collect(reader).await;
        handle.await.unwrap().unwrap();

        let entries = tarball_entries(std::io::Cursor::new(tarball)).await.unwrap();
        assert_eq!(vec![(long_name, 7)], entries);
    }

    #[tokio::test]
    async fn test_missing_file_surfaces_as_error() {
        let src = tempfile::tempdir().unwrap();

        let (reader, handle) =
            tarball_stream(src.path().to_path_buf(), vec!["vanished.bin".to_string()]);
        let _ = collect(reader).await;
        handle.await.unwrap().unwrap_err();
    }
}
