//! Device access and the raw chunk reader.
//!
//! The image is read through [`BlockReader`], a thread-safe block device
//! abstraction. [`ByteDevice`] adapts any [`ReadAt`] source (a file, a
//! [`SharedReader`]) into one. On top of that, [`RawReader`] reads single
//! on-disk chunks, parsing the length header where the chunk has one and
//! decompressing the payload when its compressed bit says so.

use std::{
    fs,
    io::{self, Read, Seek},
    sync::Mutex,
};

use log::trace;

use crate::{
    Error, Result,
    decompression::Decompressor,
    structs::{
        Endianness, MARKER_BYTE, METADATA_SIZE, block_compressed, block_size_on_disk,
        metadata_compressed, metadata_size_on_disk,
    },
};

/// Trait providing the function [ReadAt::read_at]
/// This function is thread safe and has the same behavior as seeking and reading at a given location
/// under a mutex. To improve compatibility with different operating systems, the guarantees
/// provided by this function are minimal
pub trait ReadAt {
    /// Similar to [io::Read::read] but instead of using the internal cursor,
    /// use `offset` as the explicit cursor.
    /// To maximise compatibility with different operating systems, the state
    /// of the internal cursor is considered as undefined after a call to this
    /// function
    #[doc(hidden)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Similar to [io::Read::read_exact], but with the same properties as [ReadAt::read_at]
    #[doc(hidden)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if matches!(e.kind(), io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }

        if !buf.is_empty() {
            Err(io::ErrorKind::UnexpectedEof.into())
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
impl ReadAt for &fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(*self, buf, offset)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(*self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for &fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        // [ReadAt::read_at] has no guarantee regarding the value of the cursor
        // after a call to this function. Therefore, it is valid to implement
        // read_at using seek_read, which modifies the internal cursor
        std::os::windows::fs::FileExt::seek_read(*self, buf, offset)
    }
}

#[cfg(any(unix, windows))]
impl ReadAt for fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (&self).read_at(buf, offset)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (&self).read_exact_at(buf, offset)
    }
}

/// Thread-safe reader which implements [ReadAt] using
/// a mutex with a [Read] and [Seek] type internally
pub struct SharedReader<T: Read + Seek> {
    inner: Mutex<T>,
}

impl<T: Read + Seek> SharedReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<T: Read + Seek> ReadAt for SharedReader<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(io::SeekFrom::Start(offset))?;
        inner.read(buf)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.seek(io::SeekFrom::Start(offset))?;
        inner.read_exact(buf)
    }
}

/// Device block size used when mounting from a plain file
pub const DEFAULT_DEVICE_BLOCK_SIZE: u32 = 1024;

/// A block device holding the image. All on-disk addressing in the crate is
/// in bytes; implementations only ever see whole device blocks.
pub trait BlockReader: Send + Sync {
    /// Size of one device block in bytes, a power of two.
    fn device_block_size(&self) -> u32;

    /// Read device block `block` into `buf`, which is exactly
    /// [`Self::device_block_size`] bytes long.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Adapts a byte-addressed [`ReadAt`] source into a [`BlockReader`].
pub struct ByteDevice<T> {
    inner: T,
    block_size: u32,
}

impl<T: ReadAt + Send + Sync> ByteDevice<T> {
    /// `block_size` must be a power of two.
    pub fn new(inner: T, block_size: u32) -> Self {
        assert!(block_size.is_power_of_two());
        Self { inner, block_size }
    }
}

impl<T: ReadAt + Send + Sync> BlockReader for ByteDevice<T> {
    fn device_block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner
            .read_exact_at(buf, block * self.block_size as u64)
    }
}

/// How long the chunk about to be read is.
pub(crate) enum ChunkLength {
    /// Metadata chunk: a u16 length header (plus marker byte on check-data
    /// images) precedes the payload.
    FromHeader,
    /// Data block or fragment: the length word (bit 24 convention) came from
    /// the block list or the fragment table.
    Explicit(u32),
}

/// Reads single chunks straight off the device, without caching. The
/// endianness and check-data fields start out as placeholders and are fixed
/// up once the superblock has been parsed; until then only `Explicit` reads
/// are meaningful.
pub(crate) struct RawReader<R> {
    device: R,
    devblksize: u32,
    devblksize_log2: u32,
    pub(crate) endian: Endianness,
    pub(crate) check_data: bool,
    /// Upper bound on the decompressed size of any chunk, i.e.
    /// max(block_size, 8KiB)
    pub(crate) read_size: usize,
    pub(crate) decompressor: Box<dyn Decompressor>,
}

impl<R: BlockReader> RawReader<R> {
    pub(crate) fn new(device: R, decompressor: Box<dyn Decompressor>) -> Self {
        let devblksize = device.device_block_size();
        Self {
            device,
            devblksize,
            devblksize_log2: devblksize.trailing_zeros(),
            endian: Endianness::Little,
            check_data: false,
            read_size: METADATA_SIZE,
            decompressor,
        }
    }

    /// Copy `out.len()` raw bytes starting at byte offset `at`, reading whole
    /// device blocks.
    fn read_raw(&self, at: u64, out: &mut [u8]) -> Result<()> {
        let devblksize = self.devblksize as usize;
        let mut block = at >> self.devblksize_log2;
        let mut offset = (at & (self.devblksize as u64 - 1)) as usize;
        let mut filled = 0;
        let mut buf = vec![0u8; devblksize];
        while filled < out.len() {
            self.device
                .read_block(block, &mut buf)
                .map_err(|source| Error::Io { block, source })?;
            let take = (devblksize - offset).min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&buf[offset..offset + take]);
            filled += take;
            offset = 0;
            block += 1;
        }
        Ok(())
    }

    /// Read and decompress one chunk starting at byte offset `start`. Returns
    /// the decompressed payload and the byte offset of the following chunk.
    pub(crate) fn read_chunk(&self, start: u64, length: ChunkLength) -> Result<(Vec<u8>, u64)> {
        let (compressed, on_disk_len, header_len) = match length {
            ChunkLength::Explicit(word) => {
                (block_compressed(word), block_size_on_disk(word), 0usize)
            }
            ChunkLength::FromHeader => {
                let header_len = if self.check_data { 3 } else { 2 };
                let mut header = [0u8; 3];
                self.read_raw(start, &mut header[..header_len])?;
                if self.check_data && header[2] != MARKER_BYTE {
                    return Err(Error::CorruptMetadata("metadata marker byte mismatch"));
                }
                let word = self.endian.u16_from(&header);
                let len = metadata_size_on_disk(word);
                if len == 0 || len > METADATA_SIZE {
                    return Err(Error::CorruptMetadata("bad metadata block length"));
                }
                (metadata_compressed(word), len, header_len)
            }
        };

        // A zero-length data block is a hole, it reads back as zeroes
        if on_disk_len == 0 {
            return Ok((Vec::new(), start));
        }
        if on_disk_len > self.read_size {
            return Err(Error::CorruptMetadata("chunk longer than read buffer"));
        }

        let mut raw = vec![0u8; on_disk_len];
        self.read_raw(start + header_len as u64, &mut raw)?;

        let data = if compressed {
            let mut out = vec![0u8; self.read_size];
            let n = self.decompressor.inflate(&raw, &mut out)?;
            out.truncate(n);
            out
        } else {
            raw
        };
        trace!(
            "read chunk at 0x{start:x}, {on_disk_len} on-disk -> {} bytes",
            data.len()
        );
        Ok((data, start + (header_len + on_disk_len) as u64))
    }
}
