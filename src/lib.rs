//! Read-only access to legacy squashfs images, versions 1.x and 2.x.
//!
//! These are the formats written by the original mksquashfs releases:
//! little or big endian depending on the build machine, zlib or (with the
//! patched tools) LZMA compressed, with the small superblock and banked 1.0
//! inode types that disappeared in later format revisions. The crate mounts
//! an image over any block-addressed source and exposes inodes, directory
//! iteration, name lookup and page-sized file reads.
//!
//! ```no_run
//! use squashfs_legacy::FileSystem;
//!
//! # fn main() -> squashfs_legacy::Result<()> {
//! let fs = FileSystem::from_path("rootfs.sqsh")?;
//! let root = fs.root()?;
//! fs.iterate_directory(&root, 0, |entry| {
//!     println!("{} ({:?})", entry.name, entry.file_type);
//!     std::ops::ControlFlow::Continue(())
//! })?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    fs,
    io,
    ops::ControlFlow,
    path::Path,
    sync::Arc,
};

use log::{error, trace, warn};
use thiserror::Error as ThisError;

mod cache;
mod decompression;
mod dir;
mod metadata;
mod readers;
mod structs;
#[cfg(test)]
pub(crate) mod testutil;

pub use decompression::{DecompressError, Decompressor, LzmaDecompressor, ZlibDecompressor};
pub use dir::DirEntry;
pub use metadata::{
    DeviceNode, Directory, InodeRecord, InodeVariant, RegularFile, Symlink,
};
pub use readers::{
    BlockReader, ByteDevice, DEFAULT_DEVICE_BLOCK_SIZE, ReadAt, SharedReader,
};
pub use structs::{Endianness, METADATA_SIZE, NAME_LEN, PAGE_SIZE, Superblock, SuperblockFlags};

use cache::{BlockCache, FragmentCache, MetaPos};
use metadata::{CurrentFormat, FormatCodec, LegacyFormat, MetaCursor};
use readers::{ChunkLength, RawReader};
use structs::{
    CACHED_BLKS, CACHED_FRAGMENTS, COMPRESSED_BIT_BLOCK, DiskRecord, FRAGMENTS_PER_BLOCK,
    FragmentEntry, PAGE_SHIFT, SQUASHFS_MAGIC, SQUASHFS_MAGIC_SWAP, SUPPORTED_MAJOR,
    SUPPORTED_MINOR, block_size_on_disk,
};

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to open image")]
    Open(#[source] io::Error),
    #[error("i/o error reading device block {block}")]
    Io {
        block: u64,
        #[source]
        source: io::Error,
    },
    #[error("not a squashfs image (magic 0x{0:08x})")]
    BadMagic(u32),
    #[error("unsupported squashfs version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("decompression failed")]
    Decompress(#[from] DecompressError),
    #[error("inode is not a directory")]
    NotADirectory,
    #[error("inode is not a regular file")]
    NotARegularFile,
    #[error("inode is not a symbolic link")]
    NotASymlink,
    #[error("name longer than {NAME_LEN} bytes")]
    NameTooLong,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Packed reference to an inode: the inode table block holding it and the
/// offset within that block's decompressed contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeRef(u64);

impl InodeRef {
    pub(crate) fn from_block_and_offset(block: u64, offset: u16) -> Self {
        debug_assert!(block < 1 << 32);
        Self((block << 16) | offset as u64)
    }

    /// Byte offset of the metadata block, relative to the inode table start.
    pub(crate) fn block(self) -> u64 {
        (self.0 >> 16) & 0xffff_ffff
    }

    pub(crate) fn offset_within_block(self) -> u16 {
        self.0 as u16
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for InodeRef {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Directory,
    RegularFile,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// What [`FileSystem::read_page`] does when a data block cannot be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageFillPolicy {
    /// Log the failure and return a zeroed page, the way a kernel driver
    /// keeps a damaged file readable.
    #[default]
    ZeroFillOnError,
    /// Surface the error to the caller.
    PropagateError,
}

pub struct MountOptions {
    decompressor: Option<Box<dyn Decompressor>>,
    page_fill: PageFillPolicy,
}

impl MountOptions {
    pub fn new() -> Self {
        Self {
            decompressor: None,
            page_fill: PageFillPolicy::default(),
        }
    }

    /// Use a custom decompressor instead of zlib.
    pub fn decompressor(&mut self, decompressor: Box<dyn Decompressor>) -> &mut Self {
        self.decompressor = Some(decompressor);
        self
    }

    /// Shorthand for images written by the LZMA-patched tools.
    pub fn lzma(&mut self) -> &mut Self {
        self.decompressor(Box::new(LzmaDecompressor))
    }

    pub fn page_fill(&mut self, policy: PageFillPolicy) -> &mut Self {
        self.page_fill = policy;
        self
    }
}

impl Default for MountOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything shared between handles to one mounted image.
#[doc(hidden)]
pub struct FilesystemContext<R: BlockReader> {
    raw: RawReader<R>,
    superblock: Superblock,
    block_cache: BlockCache,
    fragment_cache: FragmentCache,
    uid_table: Vec<u32>,
    gid_table: Vec<u32>,
    /// Byte offsets of the metadata blocks holding fragment table entries
    fragment_index: Vec<u32>,
    codec: Box<dyn FormatCodec<R>>,
    page_fill: PageFillPolicy,
}

impl<R: BlockReader> FilesystemContext<R> {
    pub(crate) fn endian(&self) -> Endianness {
        self.raw.endian
    }

    pub(crate) fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// 2.1 images sort directory entries by the first byte of the name.
    pub(crate) fn first_byte_ordered(&self) -> bool {
        self.superblock.major == 2 && self.superblock.minor == 1
    }

    pub(crate) fn metadata_read(&self, pos: MetaPos, buf: &mut [u8]) -> Result<MetaPos> {
        self.block_cache.copy(pos, buf.len(), Some(buf), |block| {
            self.raw.read_chunk(block, ChunkLength::FromHeader)
        })
    }

    pub(crate) fn metadata_skip(&self, pos: MetaPos, len: usize) -> Result<MetaPos> {
        self.block_cache.copy(pos, len, None, |block| {
            self.raw.read_chunk(block, ChunkLength::FromHeader)
        })
    }

    pub(crate) fn uid_at(&self, index: usize) -> Result<u32> {
        self.uid_table
            .get(index)
            .copied()
            .ok_or(Error::CorruptMetadata("uid index out of range"))
    }

    pub(crate) fn gid_at(&self, index: usize) -> Result<u32> {
        self.gid_table
            .get(index)
            .copied()
            .ok_or(Error::CorruptMetadata("gid index out of range"))
    }

    /// Resolve a fragment table index to the fragment block's byte offset
    /// and length word.
    pub(crate) fn fragment_location(&self, fragment: u32) -> Result<(u64, u32)> {
        let block = *self
            .fragment_index
            .get(fragment as usize / FRAGMENTS_PER_BLOCK)
            .ok_or(Error::CorruptMetadata("fragment index out of range"))?;
        let offset = (fragment as usize % FRAGMENTS_PER_BLOCK) * FragmentEntry::SIZE;
        let mut cursor = MetaCursor::new(self, MetaPos::new(block as u64, offset));
        let entry: FragmentEntry = cursor.read_record()?;
        Ok((entry.start_block as u64, entry.size))
    }

    fn read_page(&self, inode: &InodeRecord, page_index: u64) -> Result<Vec<u8>> {
        let InodeVariant::RegularFile(file) = &inode.variant else {
            return Err(Error::NotARegularFile);
        };
        let mut page = vec![0u8; PAGE_SIZE];
        match self.fill_page(file, page_index, &mut page) {
            Ok(()) => Ok(page),
            Err(e) if self.page_fill == PageFillPolicy::ZeroFillOnError => {
                error!("unable to read page {page_index}: {e}");
                page.fill(0);
                Ok(page)
            }
            Err(e) => Err(e),
        }
    }

    fn fill_page(&self, file: &RegularFile, page_index: u64, page: &mut [u8]) -> Result<()> {
        // Pages past the end of the file read as zeroes
        if page_index >= file.file_size.div_ceil(PAGE_SIZE as u64) {
            return Ok(());
        }
        let block_log = self.superblock.block_log as u32;
        if block_log < PAGE_SHIFT {
            return self.fill_page_small_blocks(file, page_index, page);
        }

        let index = page_index >> (block_log - PAGE_SHIFT);
        let within = ((page_index << PAGE_SHIFT) - (index << block_log)) as usize;

        match &file.fragment {
            // The tail end of the file lives in a shared fragment block
            Some(frag) if index >= (file.file_size >> block_log) => {
                let handle = self.fragment_cache.acquire(frag.start_block, || {
                    self.raw
                        .read_chunk(frag.start_block, ChunkLength::Explicit(frag.size))
                        .map(|(data, _)| data)
                })?;
                let block_size = self.superblock.block_size as u64;
                let tail_len = (file.file_size & (block_size - 1)) as usize;
                if within < tail_len {
                    let take = (tail_len - within).min(PAGE_SIZE);
                    let start = frag.offset as usize + within;
                    let src = handle
                        .data
                        .get(start..start + take)
                        .ok_or(Error::CorruptMetadata("fragment data out of range"))?;
                    page[..take].copy_from_slice(src);
                }
            }
            _ => {
                let run = self.codec.block_run(self, file, index, 1)?;
                let (data, _) = self
                    .raw
                    .read_chunk(run.start, ChunkLength::Explicit(run.sizes[0]))?;
                if within < data.len() {
                    let take = (data.len() - within).min(PAGE_SIZE);
                    page[..take].copy_from_slice(&data[within..within + take]);
                }
            }
        }
        Ok(())
    }

    /// 1.0 images can use blocks smaller than a page; a page is then a run
    /// of consecutive blocks.
    fn fill_page_small_blocks(
        &self,
        file: &RegularFile,
        page_index: u64,
        page: &mut [u8],
    ) -> Result<()> {
        let block_log = self.superblock.block_log as u32;
        let blocks_per_page_log = PAGE_SHIFT - block_log;
        let first = page_index << blocks_per_page_log;
        let file_blocks = file.file_size.div_ceil(1u64 << block_log);
        let last = (first + (1 << blocks_per_page_log)).min(file_blocks);

        let run = self.codec.block_run(self, file, first, (last - first) as usize)?;
        let mut at = run.start;
        let mut filled = 0usize;
        for &word in &run.sizes {
            let (data, _) = self.raw.read_chunk(at, ChunkLength::Explicit(word))?;
            let dst = page
                .get_mut(filled..filled + data.len())
                .ok_or(Error::CorruptMetadata("data block overruns page"))?;
            dst.copy_from_slice(&data);
            filled += data.len();
            at += block_size_on_disk(word) as u64;
        }
        Ok(())
    }

    fn read_symlink_target(&self, inode: &InodeRecord) -> Result<Vec<u8>> {
        let InodeVariant::Symlink(sym) = &inode.variant else {
            return Err(Error::NotASymlink);
        };
        let mut target = vec![0u8; sym.target_size as usize];
        let mut cursor = MetaCursor::new(self, sym.target_pos);
        cursor.read_exact(&mut target)?;
        Ok(target)
    }
}

/// A mounted image. Cheap to clone; clones share the caches.
pub struct FileSystem<R: BlockReader> {
    inner: Arc<FilesystemContext<R>>,
}

impl<R: BlockReader> Clone for FileSystem<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BlockReader> fmt::Debug for FileSystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("superblock", &self.inner.superblock)
            .finish_non_exhaustive()
    }
}

#[cfg(any(unix, windows))]
impl FileSystem<ByteDevice<fs::File>> {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_path_with_options(path, MountOptions::new())
    }

    pub fn from_path_with_options(path: impl AsRef<Path>, options: MountOptions) -> Result<Self> {
        let file = fs::File::open(path).map_err(Error::Open)?;
        Self::mount(ByteDevice::new(file, DEFAULT_DEVICE_BLOCK_SIZE), options)
    }
}

impl<R: BlockReader> FileSystem<R> {
    /// Parse the superblock and the in-memory tables, returning a handle
    /// ready for inode and data access.
    pub fn mount(device: R, mut options: MountOptions) -> Result<Self> {
        let decompressor = options
            .decompressor
            .take()
            .unwrap_or_else(|| Box::new(ZlibDecompressor));
        let mut raw = RawReader::new(device, decompressor);

        // The superblock is raw bytes at offset zero, endianness unknown
        // until the magic has been seen
        let (sb_bytes, _) = raw.read_chunk(
            0,
            ChunkLength::Explicit(Superblock::SIZE as u32 | COMPRESSED_BIT_BLOCK),
        )?;
        let sb = Superblock::decode(&sb_bytes, Endianness::Little)?;
        let (mut superblock, endian) = if sb.magic == SQUASHFS_MAGIC {
            (sb, Endianness::Little)
        } else if sb.magic == SQUASHFS_MAGIC_SWAP {
            warn!("mounting a different endian squashfs filesystem");
            (Superblock::decode(&sb_bytes, Endianness::Big)?, Endianness::Big)
        } else {
            return Err(Error::BadMagic(sb.magic));
        };

        let codec: Box<dyn FormatCodec<R>> = match (superblock.major, superblock.minor) {
            (1, _) => {
                superblock.block_size = superblock.block_size_1 as u32;
                Box::new(LegacyFormat)
            }
            (SUPPORTED_MAJOR, minor) if minor <= SUPPORTED_MINOR => Box::new(CurrentFormat),
            (major, minor) => return Err(Error::UnsupportedVersion { major, minor }),
        };

        if !superblock.block_size.is_power_of_two() {
            return Err(Error::CorruptMetadata("block size is not a power of two"));
        }
        if superblock.major == SUPPORTED_MAJOR
            && 1u32.checked_shl(superblock.block_log as u32) != Some(superblock.block_size)
        {
            return Err(Error::CorruptMetadata("block size and block log disagree"));
        }
        if superblock.major == 1 {
            superblock.block_log = superblock.block_size.trailing_zeros() as u16;
        }

        raw.endian = endian;
        raw.check_data = superblock.flags.contains(SuperblockFlags::CHECK_DATA);
        raw.read_size = METADATA_SIZE.max(superblock.block_size as usize);

        trace!("found valid superblock, version {}.{}", superblock.major, superblock.minor);
        trace!(
            "inodes are {}compressed",
            if superblock.flags.contains(SuperblockFlags::INODES_UNCOMPRESSED) { "un" } else { "" }
        );
        trace!(
            "data is {}compressed",
            if superblock.flags.contains(SuperblockFlags::DATA_UNCOMPRESSED) { "un" } else { "" }
        );
        trace!("check data is {}present", if raw.check_data { "" } else { "not " });
        trace!("block size {}", superblock.block_size);
        trace!("number of inodes {}", superblock.inodes);
        trace!("number of fragments {}", superblock.fragments);
        trace!("number of uids {}, gids {}", superblock.no_uids, superblock.no_guids);
        trace!("inode table starts at 0x{:x}", superblock.inode_table_start);
        trace!("directory table starts at 0x{:x}", superblock.directory_table_start);
        trace!("fragment table starts at 0x{:x}", superblock.fragment_table_start);
        trace!("uid table starts at 0x{:x}", superblock.uid_start);

        // The uid and gid tables are flat uncompressed arrays, gids right
        // after uids
        let total_ids = superblock.no_uids as usize + superblock.no_guids as usize;
        let mut uid_table = Vec::with_capacity(superblock.no_uids as usize);
        let mut gid_table = Vec::with_capacity(superblock.no_guids as usize);
        if total_ids > 0 {
            let (table, _) = raw.read_chunk(
                superblock.uid_start,
                ChunkLength::Explicit((total_ids * 4) as u32 | COMPRESSED_BIT_BLOCK),
            )?;
            let mut ids = table.chunks_exact(4).map(|raw| endian.u32_from(raw));
            uid_table.extend(ids.by_ref().take(superblock.no_uids as usize));
            gid_table.extend(ids);
        }

        // 2.x images index the fragment table; 1.0 images have no fragments
        let fragment_index: Vec<u32> = if superblock.major >= 2 && superblock.fragments > 0 {
            let indexes = (superblock.fragments as usize).div_ceil(FRAGMENTS_PER_BLOCK);
            let (table, _) = raw.read_chunk(
                superblock.fragment_table_start,
                ChunkLength::Explicit((indexes * 4) as u32 | COMPRESSED_BIT_BLOCK),
            )?;
            table.chunks_exact(4).map(|raw| endian.u32_from(raw)).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            inner: Arc::new(FilesystemContext {
                raw,
                superblock,
                block_cache: BlockCache::new(CACHED_BLKS),
                fragment_cache: FragmentCache::new(CACHED_FRAGMENTS),
                uid_table,
                gid_table,
                fragment_index,
                codec,
                page_fill: options.page_fill,
            }),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.inner.superblock
    }

    /// Decode the root directory inode.
    pub fn root(&self) -> Result<InodeRecord> {
        self.inode(self.inner.superblock.root_inode)
    }

    /// Decode the inode behind a reference obtained from the superblock or
    /// a directory entry.
    pub fn inode(&self, inode_ref: InodeRef) -> Result<InodeRecord> {
        self.inner.codec.decode_inode(&self.inner, inode_ref)
    }

    /// Walk a directory from stream position `start_pos` (0 for the
    /// beginning, or a [`DirEntry::position`] to resume), calling `emit` for
    /// each entry until the stream ends or `emit` breaks. Returns the
    /// position where iteration stopped.
    pub fn iterate_directory(
        &self,
        dir: &InodeRecord,
        start_pos: u64,
        emit: impl FnMut(DirEntry) -> ControlFlow<()>,
    ) -> Result<u64> {
        let InodeVariant::Directory(d) = &dir.variant else {
            return Err(Error::NotADirectory);
        };
        dir::iterate(self.inner.as_ref(), d, start_pos, emit)
    }

    /// Find `name` in a directory.
    pub fn lookup(&self, dir: &InodeRecord, name: &str) -> Result<Option<InodeRef>> {
        let InodeVariant::Directory(d) = &dir.variant else {
            return Err(Error::NotADirectory);
        };
        dir::lookup(self.inner.as_ref(), d, name)
    }

    /// Read the 4KiB page `page_index` of a regular file. Pages past the end
    /// of the file and the slack after the last byte read as zeroes.
    pub fn read_page(&self, inode: &InodeRecord, page_index: u64) -> Result<Vec<u8>> {
        self.inner.read_page(inode, page_index)
    }

    pub fn read_symlink_target(&self, inode: &InodeRecord) -> Result<Vec<u8>> {
        self.inner.read_symlink_target(inode)
    }
}
