//! Inode decoding.
//!
//! The 2.x and 1.x inode table layouts differ enough that each gets its own
//! [`FormatCodec`]; mount picks one from the superblock version and the rest
//! of the crate only ever sees the decoded [`InodeRecord`]. Both codecs also
//! know how to walk their format's block size list, which follows the
//! regular file body in the inode table.

use log::trace;

use crate::{
    Error, FileType, FilesystemContext, InodeRef, Result,
    cache::MetaPos,
    readers::BlockReader,
    structs::{
        BLKDEV_TYPE, CHRDEV_TYPE, COMPRESSED_BIT, COMPRESSED_BIT_BLOCK, DIR_TYPE, DevInodeBody,
        DirInodeBody, DiskRecord, FILE_TYPE, FIFO_TYPE, GUID_SAME_AS_UID, GUID_SAME_AS_UID_1,
        INVALID_BLOCK, IPC_TYPE_1, InodeHeader, InodeHeader1, IpcInodeBody1, LDIR_TYPE,
        LdirInodeBody, RegInodeBody, RegInodeBody1, SOCKET_TYPE, SYMLINK_TYPE, SymlinkInodeBody,
        TYPES_1, block_size_on_disk,
    },
};

/// A decoded inode. The variant carries everything needed to read the
/// object's contents without going back to the inode table, except for
/// regular file block lists which are walked on demand.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub inode_ref: InodeRef,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub variant: InodeVariant,
}

impl InodeRecord {
    pub fn file_type(&self) -> FileType {
        match &self.variant {
            InodeVariant::Directory(_) => FileType::Directory,
            InodeVariant::RegularFile(_) => FileType::RegularFile,
            InodeVariant::Symlink(_) => FileType::Symlink,
            InodeVariant::BlockDevice(_) => FileType::BlockDevice,
            InodeVariant::CharDevice(_) => FileType::CharDevice,
            InodeVariant::Fifo => FileType::Fifo,
            InodeVariant::Socket => FileType::Socket,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.variant, InodeVariant::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.variant, InodeVariant::RegularFile(_))
    }
}

#[derive(Debug, Clone)]
pub enum InodeVariant {
    RegularFile(RegularFile),
    Directory(Directory),
    Symlink(Symlink),
    BlockDevice(DeviceNode),
    CharDevice(DeviceNode),
    Fifo,
    Socket,
}

#[derive(Debug, Clone)]
pub struct RegularFile {
    pub file_size: u64,
    /// Byte offset of the first data block
    pub(crate) start_block: u64,
    /// Tail fragment, already resolved through the fragment table
    pub(crate) fragment: Option<Fragment>,
    /// Where the block size list starts in the inode table
    pub(crate) block_list: MetaPos,
}

#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    /// Byte offset of the fragment block
    pub(crate) start_block: u64,
    /// Length word of the fragment block (bit 24 convention)
    pub(crate) size: u32,
    /// Offset of this file's tail within the decompressed fragment block
    pub(crate) offset: u32,
}

#[derive(Debug, Clone)]
pub struct Directory {
    /// Length of the directory stream in bytes
    pub file_size: u32,
    /// Metadata block holding the stream, relative to the directory table
    pub(crate) start_block: u32,
    pub(crate) offset: u16,
    pub(crate) index: Option<DirIndexLocation>,
}

/// Where an extended directory's index entries live in the inode table.
#[derive(Debug, Clone)]
pub(crate) struct DirIndexLocation {
    pub(crate) count: u16,
    pub(crate) pos: MetaPos,
}

#[derive(Debug, Clone)]
pub struct Symlink {
    pub target_size: u16,
    /// The target bytes follow the symlink body in the inode table
    pub(crate) target_pos: MetaPos,
}

#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNode {
    fn from_rdev(rdev: u16) -> Self {
        Self {
            major: (rdev as u32 >> 8) & 0xff,
            minor: rdev as u32 & 0xff,
        }
    }
}

/// Sequential reader over the metadata stream, going through the block
/// cache. Records are decoded with the image's byte order.
pub(crate) struct MetaCursor<'a, R: BlockReader> {
    fs: &'a FilesystemContext<R>,
    pub(crate) pos: MetaPos,
}

impl<'a, R: BlockReader> MetaCursor<'a, R> {
    pub(crate) fn new(fs: &'a FilesystemContext<R>, pos: MetaPos) -> Self {
        Self { fs, pos }
    }

    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.pos = self.fs.metadata_read(self.pos, buf)?;
        Ok(())
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.pos = self.fs.metadata_skip(self.pos, len)?;
        Ok(())
    }

    pub(crate) fn read_record<T: DiskRecord>(&mut self) -> Result<T> {
        // No record is larger than the superblock
        let mut buf = [0u8; 64];
        let buf = &mut buf[..T::SIZE];
        self.read_exact(buf)?;
        T::decode(buf, self.fs.endian())
    }
}

/// Byte offsets and length words for a run of consecutive data blocks.
pub(crate) struct BlockRun {
    /// Byte offset where the first block of the run starts
    pub(crate) start: u64,
    /// Length words (bit 24 convention) of the blocks in the run
    pub(crate) sizes: Vec<u32>,
}

/// The per-version parts of the on-disk format: inode layout and block size
/// list width.
pub(crate) trait FormatCodec<R: BlockReader>: Send + Sync {
    fn decode_inode(&self, fs: &FilesystemContext<R>, inode_ref: InodeRef) -> Result<InodeRecord>;

    /// Walk `file`'s block size list up to block `index` and return the
    /// length words of the `count` blocks from there, along with the byte
    /// offset where the first of them starts.
    fn block_run(
        &self,
        fs: &FilesystemContext<R>,
        file: &RegularFile,
        index: u64,
        count: usize,
    ) -> Result<BlockRun>;
}

fn inode_pos<R: BlockReader>(fs: &FilesystemContext<R>, inode_ref: InodeRef) -> MetaPos {
    MetaPos::new(
        fs.superblock().inode_table_start + inode_ref.block(),
        inode_ref.offset_within_block() as usize,
    )
}

/// The block size list is a packed array of length words right after the
/// file body; entries before `index` only contribute their on-disk size to
/// the running start offset.
fn walk_block_list<R: BlockReader>(
    fs: &FilesystemContext<R>,
    file: &RegularFile,
    index: u64,
    count: usize,
    word_size: usize,
) -> Result<BlockRun> {
    let mut cursor = MetaCursor::new(fs, file.block_list);
    let mut start = file.start_block;
    let mut sizes = Vec::with_capacity(count);
    let mut buf = [0u8; 512];
    let words_per_read = buf.len() / word_size;
    let total = index + count as u64;
    let mut i = 0u64;
    while i < total {
        let n = ((total - i) as usize).min(words_per_read);
        let chunk = &mut buf[..n * word_size];
        cursor.read_exact(chunk)?;
        for raw in chunk.chunks_exact(word_size) {
            let word = if word_size == 4 {
                fs.endian().u32_from(raw)
            } else {
                // 1.0 block lists use 16-bit words with the metadata length
                // convention; normalize to the 32-bit data convention
                let v = fs.endian().u16_from(raw);
                let size = (v & !COMPRESSED_BIT) as u32;
                if v & COMPRESSED_BIT != 0 {
                    size | COMPRESSED_BIT_BLOCK
                } else {
                    size
                }
            };
            if i < index {
                start += block_size_on_disk(word) as u64;
            } else {
                sizes.push(word);
            }
            i += 1;
        }
    }
    Ok(BlockRun { start, sizes })
}

/// Inode layout of 2.x images.
pub(crate) struct CurrentFormat;

impl<R: BlockReader> FormatCodec<R> for CurrentFormat {
    fn decode_inode(&self, fs: &FilesystemContext<R>, inode_ref: InodeRef) -> Result<InodeRecord> {
        let mut cursor = MetaCursor::new(fs, inode_pos(fs, inode_ref));
        let header: InodeHeader = cursor.read_record()?;

        let uid = fs.uid_at(header.uid as usize)?;
        let gid = if header.guid == GUID_SAME_AS_UID {
            uid
        } else {
            fs.gid_at(header.guid as usize)?
        };

        let (variant, mtime) = match header.inode_type {
            FILE_TYPE => {
                let body: RegInodeBody = cursor.read_record()?;
                let fragment = if body.fragment == INVALID_BLOCK {
                    None
                } else {
                    let (start_block, size) = fs.fragment_location(body.fragment)?;
                    Some(Fragment {
                        start_block,
                        size,
                        offset: body.frag_offset,
                    })
                };
                trace!(
                    "regular file inode, start block 0x{:x}, size {}, fragment {:x}",
                    body.start_block, body.file_size, body.fragment
                );
                (
                    InodeVariant::RegularFile(RegularFile {
                        file_size: body.file_size as u64,
                        start_block: body.start_block as u64,
                        fragment,
                        block_list: cursor.pos,
                    }),
                    body.mtime,
                )
            }
            DIR_TYPE => {
                let body: DirInodeBody = cursor.read_record()?;
                trace!(
                    "directory inode, start block 0x{:x}, size {}, offset {}",
                    body.start_block, body.file_size, body.offset
                );
                (
                    InodeVariant::Directory(Directory {
                        file_size: body.file_size,
                        start_block: body.start_block,
                        offset: body.offset,
                        index: None,
                    }),
                    body.mtime,
                )
            }
            LDIR_TYPE => {
                let body: LdirInodeBody = cursor.read_record()?;
                trace!(
                    "extended directory inode, start block 0x{:x}, size {}, {} index entries",
                    body.start_block, body.file_size, body.i_count
                );
                let index = (body.i_count > 0).then(|| DirIndexLocation {
                    count: body.i_count,
                    pos: cursor.pos,
                });
                (
                    InodeVariant::Directory(Directory {
                        file_size: body.file_size,
                        start_block: body.start_block,
                        offset: body.offset,
                        index,
                    }),
                    body.mtime,
                )
            }
            SYMLINK_TYPE => {
                let body: SymlinkInodeBody = cursor.read_record()?;
                (
                    InodeVariant::Symlink(Symlink {
                        target_size: body.symlink_size,
                        target_pos: cursor.pos,
                    }),
                    fs.superblock().mkfs_time,
                )
            }
            BLKDEV_TYPE | CHRDEV_TYPE => {
                let body: DevInodeBody = cursor.read_record()?;
                let dev = DeviceNode::from_rdev(body.rdev);
                let variant = if header.inode_type == BLKDEV_TYPE {
                    InodeVariant::BlockDevice(dev)
                } else {
                    InodeVariant::CharDevice(dev)
                };
                (variant, fs.superblock().mkfs_time)
            }
            FIFO_TYPE => (InodeVariant::Fifo, fs.superblock().mkfs_time),
            SOCKET_TYPE => (InodeVariant::Socket, fs.superblock().mkfs_time),
            _ => return Err(Error::CorruptMetadata("unknown inode type")),
        };

        Ok(InodeRecord {
            inode_ref,
            mode: header.mode,
            uid,
            gid,
            mtime,
            variant,
        })
    }

    fn block_run(
        &self,
        fs: &FilesystemContext<R>,
        file: &RegularFile,
        index: u64,
        count: usize,
    ) -> Result<BlockRun> {
        walk_block_list(fs, file, index, count, 4)
    }
}

/// Inode layout of 1.0 images.
pub(crate) struct LegacyFormat;

impl<R: BlockReader> FormatCodec<R> for LegacyFormat {
    fn decode_inode(&self, fs: &FilesystemContext<R>, inode_ref: InodeRef) -> Result<InodeRecord> {
        let mut cursor = MetaCursor::new(fs, inode_pos(fs, inode_ref));
        let header: InodeHeader1 = cursor.read_record()?;

        if header.inode_type == IPC_TYPE_1 {
            let body: IpcInodeBody1 = cursor.read_record()?;
            let variant = match body.kind as u16 {
                FIFO_TYPE => InodeVariant::Fifo,
                SOCKET_TYPE => InodeVariant::Socket,
                _ => return Err(Error::CorruptMetadata("bad ipc inode kind")),
            };
            let uid = fs.uid_at(body.uid_bank as usize * 16 + header.uid as usize)?;
            let gid = if header.guid == GUID_SAME_AS_UID_1 {
                uid
            } else {
                fs.gid_at(header.guid as usize)?
            };
            return Ok(InodeRecord {
                inode_ref,
                mode: header.mode,
                uid,
                gid,
                mtime: fs.superblock().mkfs_time,
                variant,
            });
        }

        // The 1.0 type byte packs the uid table bank with the variant, five
        // variants per bank
        let inode_type = ((header.inode_type - 1) % TYPES_1) as u16 + 1;
        let bank = ((header.inode_type - 1) / TYPES_1) as usize;
        let uid = fs.uid_at(bank * 16 + header.uid as usize)?;
        let gid = if header.guid == GUID_SAME_AS_UID_1 {
            uid
        } else {
            fs.gid_at(header.guid as usize)?
        };

        let (variant, mtime) = match inode_type {
            FILE_TYPE => {
                let body: RegInodeBody1 = cursor.read_record()?;
                trace!(
                    "1.0 regular file inode, start block 0x{:x}, size {}",
                    body.start_block, body.file_size
                );
                (
                    InodeVariant::RegularFile(RegularFile {
                        file_size: body.file_size as u64,
                        start_block: body.start_block as u64,
                        fragment: None,
                        block_list: cursor.pos,
                    }),
                    body.mtime,
                )
            }
            DIR_TYPE => {
                let body: DirInodeBody = cursor.read_record()?;
                (
                    InodeVariant::Directory(Directory {
                        file_size: body.file_size,
                        start_block: body.start_block,
                        offset: body.offset,
                        index: None,
                    }),
                    body.mtime,
                )
            }
            SYMLINK_TYPE => {
                let body: SymlinkInodeBody = cursor.read_record()?;
                (
                    InodeVariant::Symlink(Symlink {
                        target_size: body.symlink_size,
                        target_pos: cursor.pos,
                    }),
                    fs.superblock().mkfs_time,
                )
            }
            BLKDEV_TYPE | CHRDEV_TYPE => {
                let body: DevInodeBody = cursor.read_record()?;
                let dev = DeviceNode::from_rdev(body.rdev);
                let variant = if inode_type == BLKDEV_TYPE {
                    InodeVariant::BlockDevice(dev)
                } else {
                    InodeVariant::CharDevice(dev)
                };
                (variant, fs.superblock().mkfs_time)
            }
            _ => unreachable!("unbanked 1.0 inode type is always 1..=5"),
        };

        Ok(InodeRecord {
            inode_ref,
            mode: header.mode,
            uid,
            gid,
            mtime,
            variant,
        })
    }

    fn block_run(
        &self,
        fs: &FilesystemContext<R>,
        file: &RegularFile,
        index: u64,
        count: usize,
    ) -> Result<BlockRun> {
        walk_block_list(fs, file, index, count, 2)
    }
}
