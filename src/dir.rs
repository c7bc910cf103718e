//! Directory stream walking.
//!
//! A directory is a byte stream in the directory table: runs of entries, each
//! run preceded by a header naming the inode table block its entries point
//! into. Positions handed back to callers are byte offsets into that stream,
//! so iteration can resume exactly where it stopped. Extended directories
//! carry an index used to fast-forward close to a target position or name
//! without walking the whole stream.

use log::{trace, warn};

use crate::{
    Error, FileType, FilesystemContext, InodeRef, Result,
    cache::MetaPos,
    metadata::{Directory, MetaCursor},
    readers::BlockReader,
    structs::{
        BLKDEV_TYPE, CHRDEV_TYPE, DIR_TYPE, DirEntryFixed, DirHeader, DirIndex, DiskRecord,
        FILE_TYPE, FIFO_TYPE, METADATA_SIZE, NAME_LEN, SOCKET_TYPE, SYMLINK_TYPE,
    },
};

/// One directory entry, as produced by
/// [`crate::FileSystem::iterate_directory`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_ref: InodeRef,
    pub file_type: FileType,
    /// Stream position just past this entry; pass it back as `start_pos` to
    /// resume iteration with the following entry
    pub position: u64,
}

fn entry_file_type(entry_type: u8) -> Result<FileType> {
    Ok(match entry_type as u16 {
        DIR_TYPE => FileType::Directory,
        FILE_TYPE => FileType::RegularFile,
        SYMLINK_TYPE => FileType::Symlink,
        BLKDEV_TYPE => FileType::BlockDevice,
        CHRDEV_TYPE => FileType::CharDevice,
        FIFO_TYPE => FileType::Fifo,
        SOCKET_TYPE => FileType::Socket,
        _ => return Err(Error::CorruptMetadata("bad directory entry type")),
    })
}

fn stream_start<R: BlockReader>(fs: &FilesystemContext<R>, dir: &Directory) -> MetaPos {
    MetaPos::new(
        fs.superblock().directory_table_start + dir.start_block as u64,
        dir.offset as usize,
    )
}

/// Fast-forward through the directory index to the last indexed point at or
/// before `start_pos`. Adjusts `next` to that point and returns its stream
/// position.
fn fast_forward_by_offset<R: BlockReader>(
    fs: &FilesystemContext<R>,
    dir: &Directory,
    next: &mut MetaPos,
    start_pos: u64,
) -> Result<u64> {
    let mut length = 0u64;
    if start_pos > 0 {
        if let Some(loc) = &dir.index {
            let mut cursor = MetaCursor::new(fs, loc.pos);
            for _ in 0..loc.count {
                let index: DirIndex = cursor.read_record()?;
                if index.index as u64 > start_pos {
                    break;
                }
                cursor.skip(index.size as usize + 1)?;
                length = index.index as u64;
                next.block = fs.superblock().directory_table_start + index.start_block as u64;
            }
        }
    }
    // The jumped-to block starts `length` stream bytes after the directory's
    // start offset
    next.offset = (length as usize + next.offset) % METADATA_SIZE;
    Ok(length)
}

/// Fast-forward through the directory index to the last indexed name not
/// greater than `name`. An oversized search name is truncated for the
/// comparison, index entry names themselves are bounded by the format.
pub(crate) fn fast_forward_by_name<R: BlockReader>(
    fs: &FilesystemContext<R>,
    dir: &Directory,
    next: &mut MetaPos,
    name: &[u8],
) -> Result<u64> {
    let mut length = 0u64;
    if let Some(loc) = &dir.index {
        let name = if name.len() > NAME_LEN {
            warn!("search name truncated to {NAME_LEN} bytes for the index scan");
            &name[..NAME_LEN]
        } else {
            name
        };
        let mut cursor = MetaCursor::new(fs, loc.pos);
        for _ in 0..loc.count {
            let index: DirIndex = cursor.read_record()?;
            let index_name_len = index.size as usize + 1;
            if index_name_len > NAME_LEN {
                return Err(Error::CorruptMetadata("directory index name too long"));
            }
            let mut buf = [0u8; NAME_LEN];
            cursor.read_exact(&mut buf[..index_name_len])?;

            // Full lexicographic comparison; an index name that extends the
            // search name sorts after it and must not be jumped to
            if buf[..index_name_len] > *name {
                break;
            }
            length = index.index as u64;
            next.block = fs.superblock().directory_table_start + index.start_block as u64;
        }
    }
    next.offset = (length as usize + next.offset) % METADATA_SIZE;
    Ok(length)
}

/// Walk the directory stream from `start_pos`, calling `emit` for every
/// entry. Returns the stream position where iteration stopped: the end of
/// the stream, or just past the entry on which `emit` broke.
pub(crate) fn iterate<R: BlockReader>(
    fs: &FilesystemContext<R>,
    dir: &Directory,
    start_pos: u64,
    mut emit: impl FnMut(DirEntry) -> std::ops::ControlFlow<()>,
) -> Result<u64> {
    let mut next = stream_start(fs, dir);
    let mut length = fast_forward_by_offset(fs, dir, &mut next, start_pos)?;
    let mut cursor = MetaCursor::new(fs, next);

    while length < dir.file_size as u64 {
        let header: DirHeader = cursor.read_record()?;
        length += DirHeader::SIZE as u64;
        trace!(
            "directory run of {} entries, inode block 0x{:x}",
            header.count as u32 + 1,
            header.start_block
        );

        for _ in 0..header.count as u32 + 1 {
            let entry: DirEntryFixed = cursor.read_record()?;
            length += DirEntryFixed::SIZE as u64;

            let name_len = entry.size as usize + 1;
            if name_len > NAME_LEN {
                return Err(Error::CorruptMetadata("directory entry name too long"));
            }
            let mut name_buf = [0u8; NAME_LEN];
            cursor.read_exact(&mut name_buf[..name_len])?;
            length += name_len as u64;

            // Entries consumed by the fast-forward or already seen by the
            // caller are skipped without being emitted
            if start_pos >= length {
                continue;
            }

            let name = std::str::from_utf8(&name_buf[..name_len])
                .map_err(|_| Error::CorruptMetadata("directory entry name is not valid utf-8"))?
                .to_owned();
            let dir_entry = DirEntry {
                name,
                inode_ref: InodeRef::from_block_and_offset(header.start_block as u64, entry.offset),
                file_type: entry_file_type(entry.entry_type)?,
                position: length,
            };
            if emit(dir_entry).is_break() {
                return Ok(length);
            }
        }
    }
    Ok(length)
}

/// Find `name` in the directory, returning the inode reference of the
/// matching entry.
pub(crate) fn lookup<R: BlockReader>(
    fs: &FilesystemContext<R>,
    dir: &Directory,
    name: &str,
) -> Result<Option<InodeRef>> {
    if name.len() > NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let name = name.as_bytes();

    let mut next = stream_start(fs, dir);
    let mut length = fast_forward_by_name(fs, dir, &mut next, name)?;
    let mut cursor = MetaCursor::new(fs, next);

    // 2.1 images sort directory entries by first byte, which allows giving
    // up as soon as we pass where the name would be
    let first_byte_ordered = fs.first_byte_ordered();

    while length < dir.file_size as u64 {
        let header: DirHeader = cursor.read_record()?;
        length += DirHeader::SIZE as u64;

        for _ in 0..header.count as u32 + 1 {
            let entry: DirEntryFixed = cursor.read_record()?;
            length += DirEntryFixed::SIZE as u64;

            let name_len = entry.size as usize + 1;
            if name_len > NAME_LEN {
                return Err(Error::CorruptMetadata("directory entry name too long"));
            }
            let mut name_buf = [0u8; NAME_LEN];
            cursor.read_exact(&mut name_buf[..name_len])?;
            length += name_len as u64;
            let entry_name = &name_buf[..name_len];

            if first_byte_ordered && !name.is_empty() && name[0] < entry_name[0] {
                trace!("lookup stopped early on first-byte ordering");
                return Ok(None);
            }
            if name == entry_name {
                return Ok(Some(InodeRef::from_block_and_offset(
                    header.start_block as u64,
                    entry.offset,
                )));
            }
        }
    }
    Ok(None)
}
