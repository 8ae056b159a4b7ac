//! Zstd staging of next-round probe files

use std::path::{Path, PathBuf};

use crate::types::PipelineError;

/// Compress `source` into `destination` (zstd, default level).
///
/// The encode runs on the blocking pool; probe files can be large.
pub async fn compress_file(source: &Path, destination: &Path) -> Result<(), PipelineError> {
    let source: PathBuf = source.to_path_buf();
    let destination: PathBuf = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut reader = std::fs::File::open(source)?;
        let writer = std::fs::File::create(destination)?;
        let mut encoder = zstd::stream::Encoder::new(writer, 0)?;
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|join| PipelineError::Compression(std::io::Error::other(join)))?
    .map_err(PipelineError::Compression)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_zstd() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("probes.csv");
        let packed = dir.path().join("probes.csv.zst");
        let payload = "8.8.8.8,24000,33434,32,icmp\n".repeat(1000);
        std::fs::write(&plain, &payload).unwrap();

        compress_file(&plain, &packed).await.unwrap();

        let compressed = std::fs::read(&packed).unwrap();
        assert!(compressed.len() < payload.len());
        let restored = zstd::stream::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(String::from_utf8(restored).unwrap(), payload);
    }
}
