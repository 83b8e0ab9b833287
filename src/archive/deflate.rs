//! Whole-entry zlib compression for [super::ArchiveFormat::Deflate] archives.
use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use super::ArchiveError;
use crate::ResourceId;

/// Worst-case size of a zlib stream for `len` input bytes (zlib's `compressBound`).
pub fn compress_bound(len: u64) -> u64 {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Compress one entry into a single zlib stream.
pub fn compress(data: &[u8], level: Compression) -> Result<Vec<u8>, ArchiveError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let bound = compress_bound(data.len() as u64);
    if compressed.len() as u64 > bound {
        return Err(ArchiveError::Integrity(format!(
            "compressed {} bytes into {}, above the bound of {}",
            data.len(),
            compressed.len(),
            bound
        )));
    }
    Ok(compressed)
}

/// Inflate `input` into `dest`, which must be exactly the size of the original data.
///
/// A stream that ends early, runs long, or fails to decode is an error rather than a short read.
pub fn inflate_exact(id: ResourceId, input: &[u8], dest: &mut [u8]) -> Result<(), ArchiveError> {
    let fail = |reason: String| ArchiveError::Decompression { id, reason };

    let mut de = Decompress::new(true);
    let status = de
        .decompress(input, dest, FlushDecompress::Finish)
        .map_err(|e| fail(e.to_string()))?;

    match status {
        Status::StreamEnd if de.total_out() == dest.len() as u64 => Ok(()),
        Status::StreamEnd => Err(fail(format!(
            "stream ended after {} of {} bytes",
            de.total_out(),
            dest.len()
        ))),
        // Either the input ran out or the output filled before the end of the stream.
        Status::Ok | Status::BufError => {
            if de.total_out() == dest.len() as u64 {
                Err(fail("stream holds more data than the entry length".into()))
            } else {
                Err(fail(format!(
                    "stream truncated after {} of {} bytes",
                    de.total_out(),
                    dest.len()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflate_restores_the_input() {
        let data = b"level geometry ".repeat(200);
        let compressed = compress(&data, Compression::default()).unwrap();
        assert!(compressed.len() < data.len());

        let mut out = vec![0u8; data.len()];
        inflate_exact(1, &compressed, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn wrong_length_is_reported() {
        let data = b"0123456789".repeat(10);
        let compressed = compress(&data, Compression::default()).unwrap();

        let mut short = vec![0u8; data.len() - 1];
        assert!(matches!(
            inflate_exact(4, &compressed, &mut short),
            Err(ArchiveError::Decompression { id: 4, .. })
        ));

        let mut long = vec![0u8; data.len() + 1];
        assert!(matches!(
            inflate_exact(4, &compressed, &mut long),
            Err(ArchiveError::Decompression { id: 4, .. })
        ));
    }

    #[test]
    fn garbage_is_reported() {
        let mut out = vec![0u8; 16];
        assert!(matches!(
            inflate_exact(2, b"definitely not zlib", &mut out),
            Err(ArchiveError::Decompression { id: 2, .. })
        ));

        let compressed = compress(&[7u8; 16], Compression::default()).unwrap();
        assert!(matches!(
            inflate_exact(2, &compressed[..compressed.len() / 2], &mut out),
            Err(ArchiveError::Decompression { .. })
        ));
    }

    #[test]
    fn bound_matches_zlib() {
        assert_eq!(compress_bound(0), 13);
        assert_eq!(compress_bound(4096), 4096 + 1 + 13);
    }
}
