//! This file defines the on-disk data structures of the legacy squashfs
//! format (1.x and 2.x).
//!
//! Every multi-byte field is stored in the endianness of the machine that ran
//! mksquashfs, so each record exists as a raw `#[repr(C)]` layout generic over
//! a [`ByteOrder`] and is decoded exactly once into a native struct through
//! [`DiskRecord`]. The swapped magic in the superblock selects which byte
//! order is used for the whole image.

use bitflags::bitflags;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, ByteOrder, LittleEndian, U16, U32, U64},
};

use crate::{Error, InodeRef, Result};

/// "sqsh" when read in the endianness the image was written in
pub(crate) const SQUASHFS_MAGIC: u32 = 0x7371_7368;
/// The magic as seen when host and image endianness disagree
pub(crate) const SQUASHFS_MAGIC_SWAP: u32 = 0x6873_7173;

/// Decompressed metadata blocks are at most 8KiB
pub const METADATA_SIZE: usize = 8192;
/// Maximum length of a directory entry name
pub const NAME_LEN: usize = 64;
/// Size of a page returned by [`crate::FileSystem::read_page`]
pub const PAGE_SIZE: usize = 4096;
pub(crate) const PAGE_SHIFT: u32 = 12;

/// Number of slots in the metadata block cache
pub(crate) const CACHED_BLKS: usize = 8;
/// Number of slots in the fragment cache
pub(crate) const CACHED_FRAGMENTS: usize = 3;

/// Validation byte following metadata length headers on check-data images
pub(crate) const MARKER_BYTE: u8 = 0xff;

pub(crate) const SUPPORTED_MAJOR: u16 = 2;
pub(crate) const SUPPORTED_MINOR: u16 = 2;

/// Sentinel for "no fragment" in regular file inodes
pub(crate) const INVALID_BLOCK: u32 = 0xffff_ffff;

/// Metadata length headers are a u16 where a set bit 15 means the payload is
/// stored uncompressed; the low 15 bits are the on-disk payload size.
pub(crate) const COMPRESSED_BIT: u16 = 1 << 15;
/// Data block and fragment length words are a u32 where a set bit 24 means
/// stored uncompressed; the low 24 bits are the on-disk size. The two
/// conventions intentionally differ and must not be mixed up.
pub(crate) const COMPRESSED_BIT_BLOCK: u32 = 1 << 24;

pub(crate) fn metadata_compressed(word: u16) -> bool {
    word & COMPRESSED_BIT == 0
}

pub(crate) fn metadata_size_on_disk(word: u16) -> usize {
    (word & !COMPRESSED_BIT) as usize
}

pub(crate) fn block_compressed(word: u32) -> bool {
    word & COMPRESSED_BIT_BLOCK == 0
}

pub(crate) fn block_size_on_disk(word: u32) -> usize {
    (word & !COMPRESSED_BIT_BLOCK) as usize
}

// Inode type tags shared by the current format and (after unbanking, see
// the legacy codec in metadata.rs) the 1.0 format.
pub(crate) const DIR_TYPE: u16 = 1;
pub(crate) const FILE_TYPE: u16 = 2;
pub(crate) const SYMLINK_TYPE: u16 = 3;
pub(crate) const BLKDEV_TYPE: u16 = 4;
pub(crate) const CHRDEV_TYPE: u16 = 5;
pub(crate) const FIFO_TYPE: u16 = 6;
pub(crate) const SOCKET_TYPE: u16 = 7;
pub(crate) const LDIR_TYPE: u16 = 8;

/// The 1.0 format packs five inode types per uid bank into the type byte
pub(crate) const TYPES_1: u8 = 5;
/// Type byte 0 marks a fifo/socket inode in the 1.0 format
pub(crate) const IPC_TYPE_1: u8 = 0;

/// gid index meaning "gid equals uid" in the current format
pub(crate) const GUID_SAME_AS_UID: u8 = 0xff;
/// Same sentinel in the 1.0 format (the field was four bits wide)
pub(crate) const GUID_SAME_AS_UID_1: u8 = 15;

/// Fragment table entries are packed 1024 to a metadata block
pub(crate) const FRAGMENTS_PER_BLOCK: usize = METADATA_SIZE / 8;

/// Byte order of a mounted image, fixed at mount from the superblock magic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub(crate) fn u16_from(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            Endianness::Little => u16::from_le_bytes(raw),
            Endianness::Big => u16::from_be_bytes(raw),
        }
    }

    pub(crate) fn u32_from(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        }
    }
}

/// One record of the on-disk format: a raw byte-order-generic layout plus the
/// conversion into its native representation. This is the single place where
/// byte swapping happens; everything past `decode` works on native integers.
pub(crate) trait DiskRecord: Sized {
    type Raw<O: ByteOrder>: FromBytes + Unaligned + Immutable + KnownLayout;

    const SIZE: usize = size_of::<Self::Raw<LittleEndian>>();

    fn from_raw<O: ByteOrder>(raw: &Self::Raw<O>) -> Self;

    fn decode(bytes: &[u8], endian: Endianness) -> Result<Self> {
        match endian {
            Endianness::Little => Self::Raw::<LittleEndian>::read_from_bytes(bytes)
                .map(|raw| Self::from_raw(&raw))
                .map_err(|_| Error::CorruptMetadata("truncated on-disk record")),
            Endianness::Big => Self::Raw::<BigEndian>::read_from_bytes(bytes)
                .map(|raw| Self::from_raw(&raw))
                .map_err(|_| Error::CorruptMetadata("truncated on-disk record")),
        }
    }
}

/// Flags containing properties of the squashfs image. Only CHECK_DATA changes
/// how the reader parses anything (metadata length headers grow a marker
/// byte); the compression flags are informational since every chunk carries
/// its own compressed bit.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct SuperblockFlags(u16);

bitflags! {
    impl SuperblockFlags: u16 {
        /// Inode metadata blocks are stored uncompressed.
        const INODES_UNCOMPRESSED = 0x0001;
        /// Data blocks are stored uncompressed.
        const DATA_UNCOMPRESSED = 0x0002;
        /// Metadata length headers are followed by a marker byte.
        const CHECK_DATA = 0x0004;
        /// The image was created without fragments.
        const NO_FRAGMENTS = 0x0008;
    }
}

/// The superblock is the first 58 bytes of the image. Read once at mount,
/// immutable afterwards.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawSuperblock<O: ByteOrder> {
    pub(crate) s_magic: U32<O>,
    pub(crate) s_major: U16<O>,
    pub(crate) s_minor: U16<O>,
    pub(crate) flags: U16<O>,
    /// 1.0 images store the block size here; the 32-bit field is unused
    pub(crate) block_size_1: U16<O>,
    pub(crate) block_log: U16<O>,
    pub(crate) block_size: U32<O>,
    pub(crate) inodes: U32<O>,
    pub(crate) fragments: U32<O>,
    pub(crate) inode_table_start: U32<O>,
    pub(crate) directory_table_start: U32<O>,
    pub(crate) fragment_table_start: U32<O>,
    /// The gid table follows the uid table with no gap
    pub(crate) uid_start: U32<O>,
    pub(crate) no_uids: U16<O>,
    pub(crate) no_guids: U16<O>,
    pub(crate) root_inode: U64<O>,
    pub(crate) mkfs_time: U32<O>,
}

const _: () = {
    assert!(size_of::<RawSuperblock<LittleEndian>>() == 58);
};

#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub major: u16,
    pub minor: u16,
    pub flags: SuperblockFlags,
    /// Data block size in bytes. For 1.0 images this is rewritten from the
    /// 16-bit field during mount.
    pub block_size: u32,
    pub block_log: u16,
    pub inodes: u32,
    pub fragments: u32,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub uid_start: u64,
    pub no_uids: u16,
    pub no_guids: u16,
    pub root_inode: InodeRef,
    pub mkfs_time: u32,
    pub(crate) block_size_1: u16,
}

impl DiskRecord for Superblock {
    type Raw<O: ByteOrder> = RawSuperblock<O>;

    fn from_raw<O: ByteOrder>(raw: &RawSuperblock<O>) -> Self {
        Self {
            magic: raw.s_magic.get(),
            major: raw.s_major.get(),
            minor: raw.s_minor.get(),
            flags: SuperblockFlags::from_bits_retain(raw.flags.get()),
            block_size: raw.block_size.get(),
            block_log: raw.block_log.get(),
            inodes: raw.inodes.get(),
            fragments: raw.fragments.get(),
            inode_table_start: raw.inode_table_start.get().into(),
            directory_table_start: raw.directory_table_start.get().into(),
            fragment_table_start: raw.fragment_table_start.get().into(),
            uid_start: raw.uid_start.get().into(),
            no_uids: raw.no_uids.get(),
            no_guids: raw.no_guids.get(),
            root_inode: InodeRef::from(raw.root_inode.get()),
            mkfs_time: raw.mkfs_time.get(),
            block_size_1: raw.block_size_1.get(),
        }
    }
}

/// Base header shared by every current-format inode variant.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawInodeHeader<O: ByteOrder> {
    pub(crate) inode_type: U16<O>,
    pub(crate) mode: U16<O>,
    pub(crate) uid: u8,
    pub(crate) guid: u8,
}

pub(crate) struct InodeHeader {
    pub(crate) inode_type: u16,
    pub(crate) mode: u16,
    pub(crate) uid: u8,
    pub(crate) guid: u8,
}

impl DiskRecord for InodeHeader {
    type Raw<O: ByteOrder> = RawInodeHeader<O>;

    fn from_raw<O: ByteOrder>(raw: &RawInodeHeader<O>) -> Self {
        Self {
            inode_type: raw.inode_type.get(),
            mode: raw.mode.get(),
            uid: raw.uid,
            guid: raw.guid,
        }
    }
}

/// Current-format regular file body. The per-block size list follows it in
/// the inode table.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawRegInode<O: ByteOrder> {
    pub(crate) mtime: U32<O>,
    pub(crate) start_block: U32<O>,
    /// Fragment table index, or [`INVALID_BLOCK`] when the file has no tail
    /// fragment
    pub(crate) fragment: U32<O>,
    pub(crate) frag_offset: U32<O>,
    pub(crate) file_size: U32<O>,
}

pub(crate) struct RegInodeBody {
    pub(crate) mtime: u32,
    pub(crate) start_block: u32,
    pub(crate) fragment: u32,
    pub(crate) frag_offset: u32,
    pub(crate) file_size: u32,
}

impl DiskRecord for RegInodeBody {
    type Raw<O: ByteOrder> = RawRegInode<O>;

    fn from_raw<O: ByteOrder>(raw: &RawRegInode<O>) -> Self {
        Self {
            mtime: raw.mtime.get(),
            start_block: raw.start_block.get(),
            fragment: raw.fragment.get(),
            frag_offset: raw.frag_offset.get(),
            file_size: raw.file_size.get(),
        }
    }
}

/// Directory body, shared by the current and 1.0 formats. `start_block` is
/// relative to the directory table start.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawDirInode<O: ByteOrder> {
    pub(crate) mtime: U32<O>,
    pub(crate) start_block: U32<O>,
    pub(crate) file_size: U32<O>,
    pub(crate) offset: U16<O>,
}

pub(crate) struct DirInodeBody {
    pub(crate) mtime: u32,
    pub(crate) start_block: u32,
    pub(crate) file_size: u32,
    pub(crate) offset: u16,
}

impl DiskRecord for DirInodeBody {
    type Raw<O: ByteOrder> = RawDirInode<O>;

    fn from_raw<O: ByteOrder>(raw: &RawDirInode<O>) -> Self {
        Self {
            mtime: raw.mtime.get(),
            start_block: raw.start_block.get(),
            file_size: raw.file_size.get(),
            offset: raw.offset.get(),
        }
    }
}

/// Extended directory body: a directory plus `i_count` index entries which
/// follow the body in the inode table.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawLdirInode<O: ByteOrder> {
    pub(crate) mtime: U32<O>,
    pub(crate) start_block: U32<O>,
    pub(crate) file_size: U32<O>,
    pub(crate) offset: U16<O>,
    pub(crate) i_count: U16<O>,
}

pub(crate) struct LdirInodeBody {
    pub(crate) mtime: u32,
    pub(crate) start_block: u32,
    pub(crate) file_size: u32,
    pub(crate) offset: u16,
    pub(crate) i_count: u16,
}

impl DiskRecord for LdirInodeBody {
    type Raw<O: ByteOrder> = RawLdirInode<O>;

    fn from_raw<O: ByteOrder>(raw: &RawLdirInode<O>) -> Self {
        Self {
            mtime: raw.mtime.get(),
            start_block: raw.start_block.get(),
            file_size: raw.file_size.get(),
            offset: raw.offset.get(),
            i_count: raw.i_count.get(),
        }
    }
}

/// Symlink body; the target bytes follow it in the inode table.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawSymlinkInode<O: ByteOrder> {
    pub(crate) symlink_size: U16<O>,
}

pub(crate) struct SymlinkInodeBody {
    pub(crate) symlink_size: u16,
}

impl DiskRecord for SymlinkInodeBody {
    type Raw<O: ByteOrder> = RawSymlinkInode<O>;

    fn from_raw<O: ByteOrder>(raw: &RawSymlinkInode<O>) -> Self {
        Self {
            symlink_size: raw.symlink_size.get(),
        }
    }
}

/// Device node body, `rdev` packed as `major << 8 | minor`.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawDevInode<O: ByteOrder> {
    pub(crate) rdev: U16<O>,
}

pub(crate) struct DevInodeBody {
    pub(crate) rdev: u16,
}

impl DiskRecord for DevInodeBody {
    type Raw<O: ByteOrder> = RawDevInode<O>;

    fn from_raw<O: ByteOrder>(raw: &RawDevInode<O>) -> Self {
        Self { rdev: raw.rdev.get() }
    }
}

/// 1.0 base header. The type byte packs the uid table bank together with the
/// variant tag, five variants per bank; type byte zero is a fifo/socket.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawInodeHeader1<O: ByteOrder> {
    pub(crate) inode_type: u8,
    pub(crate) mode: U16<O>,
    pub(crate) uid: u8,
    pub(crate) guid: u8,
}

pub(crate) struct InodeHeader1 {
    pub(crate) inode_type: u8,
    pub(crate) mode: u16,
    pub(crate) uid: u8,
    pub(crate) guid: u8,
}

impl DiskRecord for InodeHeader1 {
    type Raw<O: ByteOrder> = RawInodeHeader1<O>;

    fn from_raw<O: ByteOrder>(raw: &RawInodeHeader1<O>) -> Self {
        Self {
            inode_type: raw.inode_type,
            mode: raw.mode.get(),
            uid: raw.uid,
            guid: raw.guid,
        }
    }
}

/// 1.0 regular file body. No fragments; the 16-bit block list follows it.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawRegInode1<O: ByteOrder> {
    pub(crate) mtime: U32<O>,
    pub(crate) start_block: U32<O>,
    pub(crate) file_size: U32<O>,
}

pub(crate) struct RegInodeBody1 {
    pub(crate) mtime: u32,
    pub(crate) start_block: u32,
    pub(crate) file_size: u32,
}

impl DiskRecord for RegInodeBody1 {
    type Raw<O: ByteOrder> = RawRegInode1<O>;

    fn from_raw<O: ByteOrder>(raw: &RawRegInode1<O>) -> Self {
        Self {
            mtime: raw.mtime.get(),
            start_block: raw.start_block.get(),
            file_size: raw.file_size.get(),
        }
    }
}

/// 1.0 fifo/socket body. `uid_bank` extends the base header's uid index the
/// same way the type byte does for the other variants.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawIpcInode1<O: ByteOrder> {
    pub(crate) kind: u8,
    pub(crate) uid_bank: u8,
    pub(crate) _order: core::marker::PhantomData<O>,
}

pub(crate) struct IpcInodeBody1 {
    pub(crate) kind: u8,
    pub(crate) uid_bank: u8,
}

impl DiskRecord for IpcInodeBody1 {
    type Raw<O: ByteOrder> = RawIpcInode1<O>;

    fn from_raw<O: ByteOrder>(raw: &RawIpcInode1<O>) -> Self {
        Self {
            kind: raw.kind,
            uid_bank: raw.uid_bank,
        }
    }
}

/// Directory stream header. The stored count is one less than the number of
/// entries that follow (a header never announces zero entries).
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawDirHeader<O: ByteOrder> {
    pub(crate) count: U16<O>,
    /// Inode-table-relative block holding the inodes of the entries below
    pub(crate) start_block: U32<O>,
}

pub(crate) struct DirHeader {
    pub(crate) count: u16,
    pub(crate) start_block: u32,
}

impl DiskRecord for DirHeader {
    type Raw<O: ByteOrder> = RawDirHeader<O>;

    fn from_raw<O: ByteOrder>(raw: &RawDirHeader<O>) -> Self {
        Self {
            count: raw.count.get(),
            start_block: raw.start_block.get(),
        }
    }
}

/// Fixed part of a directory entry; `size + 1` name bytes follow.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawDirEntry<O: ByteOrder> {
    pub(crate) offset: U16<O>,
    pub(crate) entry_type: u8,
    pub(crate) size: u8,
}

pub(crate) struct DirEntryFixed {
    pub(crate) offset: u16,
    pub(crate) entry_type: u8,
    pub(crate) size: u8,
}

impl DiskRecord for DirEntryFixed {
    type Raw<O: ByteOrder> = RawDirEntry<O>;

    fn from_raw<O: ByteOrder>(raw: &RawDirEntry<O>) -> Self {
        Self {
            offset: raw.offset.get(),
            entry_type: raw.entry_type,
            size: raw.size,
        }
    }
}

/// Fixed part of a directory index entry; `size + 1` name bytes follow.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawDirIndex<O: ByteOrder> {
    /// Byte position within the directory stream, as if the uncompressed
    /// directory metadata blocks were laid out in memory consecutively
    pub(crate) index: U32<O>,
    /// Directory-table-relative block to jump to
    pub(crate) start_block: U32<O>,
    /// One less than the size of the entry name
    pub(crate) size: u8,
}

pub(crate) struct DirIndex {
    pub(crate) index: u32,
    pub(crate) start_block: u32,
    pub(crate) size: u8,
}

impl DiskRecord for DirIndex {
    type Raw<O: ByteOrder> = RawDirIndex<O>;

    fn from_raw<O: ByteOrder>(raw: &RawDirIndex<O>) -> Self {
        Self {
            index: raw.index.get(),
            start_block: raw.start_block.get(),
            size: raw.size,
        }
    }
}

/// Fragment table entry: where a shared tail block lives and how big it is
/// on disk (data block length convention).
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct RawFragmentEntry<O: ByteOrder> {
    pub(crate) start_block: U32<O>,
    pub(crate) size: U32<O>,
}

pub(crate) struct FragmentEntry {
    pub(crate) start_block: u32,
    pub(crate) size: u32,
}

impl DiskRecord for FragmentEntry {
    type Raw<O: ByteOrder> = RawFragmentEntry<O>;

    fn from_raw<O: ByteOrder>(raw: &RawFragmentEntry<O>) -> Self {
        Self {
            start_block: raw.start_block.get(),
            size: raw.size.get(),
        }
    }
}
