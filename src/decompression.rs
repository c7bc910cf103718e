//! Decompression backends for data and metadata chunks.
//!
//! Legacy images are compressed with zlib, or with raw LZMA on images built
//! by the LZMA-patched tools. Each call builds a fresh decoder, so no shared
//! state needs locking and concurrent reads can decompress in parallel.

use std::io;

use thiserror::Error;

/// Failure produced by a [`Decompressor`] backend.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct DecompressError {
    reason: String,
}

impl DecompressError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Inflates one on-disk chunk. `output` is sized for the largest possible
/// result (the block size for data, 8KiB for metadata); implementations
/// return the number of bytes produced and must fail rather than write past
/// the end of `output`.
pub trait Decompressor: Send + Sync {
    fn inflate(&self, input: &[u8], output: &mut [u8]) -> Result<usize, DecompressError>;
}

/// zlib-wrapped deflate, the format the stock legacy tools write.
pub struct ZlibDecompressor;

impl Decompressor for ZlibDecompressor {
    fn inflate(&self, input: &[u8], output: &mut [u8]) -> Result<usize, DecompressError> {
        let mut decoder = flate2::Decompress::new(true);
        let status = decoder
            .decompress(input, output, flate2::FlushDecompress::Finish)
            .map_err(|err| DecompressError::new(format!("zlib: {err}")))?;
        match status {
            flate2::Status::StreamEnd => Ok(decoder.total_out() as usize),
            // Ok or BufError here means the stream did not finish within the
            // output buffer, so the chunk claims more data than it may hold
            _ => Err(DecompressError::new("zlib: stream larger than chunk limit")),
        }
    }
}

/// Raw LZMA with the classic 13-byte header, as written by the LZMA-patched
/// mksquashfs.
pub struct LzmaDecompressor;

impl Decompressor for LzmaDecompressor {
    fn inflate(&self, input: &[u8], output: &mut [u8]) -> Result<usize, DecompressError> {
        let options = lzma_rs::decompress::Options {
            unpacked_size: lzma_rs::decompress::UnpackedSize::ReadFromHeader,
            memlimit: None,
            allow_incomplete: false,
        };
        let mut cursor = io::Cursor::new(Vec::with_capacity(output.len()));
        lzma_rs::lzma_decompress_with_options(&mut &input[..], &mut cursor, &options)
            .map_err(|err| DecompressError::new(format!("lzma: {err:?}")))?;
        let data = cursor.into_inner();
        if data.len() > output.len() {
            return Err(DecompressError::new("lzma: stream larger than chunk limit"));
        }
        output[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zlib_pack(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn zlib_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(40);
        let packed = zlib_pack(&data);
        let mut out = vec![0u8; 8192];
        let n = ZlibDecompressor.inflate(&packed, &mut out).unwrap();
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn zlib_rejects_garbage() {
        let mut out = vec![0u8; 128];
        assert!(ZlibDecompressor.inflate(b"not a zlib stream", &mut out).is_err());
    }

    #[test]
    fn zlib_rejects_oversized_stream() {
        let data = vec![7u8; 1000];
        let packed = zlib_pack(&data);
        let mut out = vec![0u8; 100];
        assert!(ZlibDecompressor.inflate(&packed, &mut out).is_err());
    }

    #[test]
    fn lzma_round_trip() {
        let data = b"squashfs lzma payload".repeat(100);
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut &data[..], &mut packed).unwrap();
        let mut out = vec![0u8; 4096];
        let n = LzmaDecompressor.inflate(&packed, &mut out).unwrap();
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn lzma_rejects_oversized_stream() {
        let data = vec![3u8; 4096];
        let mut packed = Vec::new();
        lzma_rs::lzma_compress(&mut &data[..], &mut packed).unwrap();
        let mut out = vec![0u8; 512];
        assert!(LzmaDecompressor.inflate(&packed, &mut out).is_err());
    }
}
