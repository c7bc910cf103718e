//! Test support: an in-memory block device, instrumented decompressors and a
//! builder that assembles small images in either byte order.

use std::{
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    decompression::{DecompressError, Decompressor, ZlibDecompressor},
    readers::BlockReader,
    structs::{
        BLKDEV_TYPE, CHRDEV_TYPE, COMPRESSED_BIT, COMPRESSED_BIT_BLOCK, DIR_TYPE, Endianness,
        FILE_TYPE, IPC_TYPE_1, LDIR_TYPE, METADATA_SIZE, MARKER_BYTE, SQUASHFS_MAGIC,
        SYMLINK_TYPE, TYPES_1,
    },
};

pub(crate) fn zlib_pack(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Block device over a byte vector, padded to a whole number of blocks.
pub(crate) struct MemDevice {
    data: Vec<u8>,
    block_size: u32,
}

impl MemDevice {
    pub(crate) fn new(mut data: Vec<u8>, block_size: u32) -> Self {
        assert!(block_size.is_power_of_two());
        let padded = data.len().next_multiple_of(block_size as usize);
        data.resize(padded, 0);
        Self { data, block_size }
    }
}

impl BlockReader for MemDevice {
    fn device_block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = block as usize * self.block_size as usize;
        let end = start + buf.len();
        let src = self
            .data
            .get(start..end)
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Zlib decompressor that counts calls and optionally dawdles, to observe
/// how often and how concurrently the caches decompress.
pub(crate) struct CountingDecompressor {
    pub(crate) calls: Arc<AtomicUsize>,
    pub(crate) delay: Duration,
}

impl CountingDecompressor {
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                delay: Duration::ZERO,
            },
            calls,
        )
    }
}

impl Decompressor for CountingDecompressor {
    fn inflate(&self, input: &[u8], output: &mut [u8]) -> Result<usize, DecompressError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        ZlibDecompressor.inflate(input, output)
    }
}

fn put_u16(out: &mut Vec<u8>, endian: Endianness, v: u16) {
    match endian {
        Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
        Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
    }
}

fn put_u32(out: &mut Vec<u8>, endian: Endianness, v: u32) {
    match endian {
        Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
        Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
    }
}

fn put_u64(out: &mut Vec<u8>, endian: Endianness, v: u64) {
    match endian {
        Endianness::Little => out.extend_from_slice(&v.to_le_bytes()),
        Endianness::Big => out.extend_from_slice(&v.to_be_bytes()),
    }
}

/// Accumulates a metadata table, sealing the logical stream into headed,
/// uncompressed 8KiB blocks.
struct MetaTable {
    endian: Endianness,
    check_data: bool,
    stream: Vec<u8>,
    disk: Vec<u8>,
    logical_sealed: usize,
}

impl MetaTable {
    fn new(endian: Endianness, check_data: bool) -> Self {
        Self {
            endian,
            check_data,
            stream: Vec::new(),
            disk: Vec::new(),
            logical_sealed: 0,
        }
    }

    /// (disk offset of the current block within the table, offset within it)
    fn pos(&self) -> (u64, u16) {
        (self.disk.len() as u64, self.stream.len() as u16)
    }

    fn logical_len(&self) -> u64 {
        (self.logical_sealed + self.stream.len()) as u64
    }

    fn seal(&mut self, len: usize) {
        put_u16(&mut self.disk, self.endian, len as u16 | COMPRESSED_BIT);
        if self.check_data {
            self.disk.push(MARKER_BYTE);
        }
        self.disk.extend(self.stream.drain(..len));
        self.logical_sealed += len;
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.stream.extend_from_slice(bytes);
        while self.stream.len() >= METADATA_SIZE {
            self.seal(METADATA_SIZE);
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    fn put_u16(&mut self, v: u16) {
        let mut buf = Vec::with_capacity(2);
        put_u16(&mut buf, self.endian, v);
        self.put_bytes(&buf);
    }

    fn put_u32(&mut self, v: u32) {
        let mut buf = Vec::with_capacity(4);
        put_u32(&mut buf, self.endian, v);
        self.put_bytes(&buf);
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.stream.is_empty() {
            let len = self.stream.len();
            self.seal(len);
        }
        self.disk
    }
}

/// First byte offset of the data area; the superblock occupies bytes 0..58.
pub(crate) const DATA_BASE: u64 = 64;

/// Assembles a complete image: data area first, then the inode table, the
/// directory table, the fragment table and the uid/gid tables, with the
/// superblock patched in last.
pub(crate) struct ImageBuilder {
    endian: Endianness,
    major: u16,
    minor: u16,
    block_size: u32,
    check_data: bool,
    uids: Vec<u32>,
    gids: Vec<u32>,
    data: Vec<u8>,
    inode_table: MetaTable,
    dir_table: MetaTable,
    /// (start offset, length word) per fragment
    fragments: Vec<(u32, u32)>,
    root: u64,
    inode_count: u32,
    mkfs_time: u32,
}

impl ImageBuilder {
    pub(crate) fn new(endian: Endianness) -> Self {
        Self::with_options(endian, false)
    }

    pub(crate) fn with_options(endian: Endianness, check_data: bool) -> Self {
        Self {
            endian,
            major: 2,
            minor: 0,
            block_size: 65536,
            check_data,
            uids: Vec::new(),
            gids: Vec::new(),
            data: Vec::new(),
            inode_table: MetaTable::new(endian, check_data),
            dir_table: MetaTable::new(endian, check_data),
            fragments: Vec::new(),
            root: 0,
            inode_count: 0,
            mkfs_time: 1_000_000,
        }
    }

    pub(crate) fn set_version(&mut self, major: u16, minor: u16) {
        self.major = major;
        self.minor = minor;
        if major == 1 && self.block_size > u16::MAX as u32 {
            self.block_size = 4096;
        }
    }

    pub(crate) fn set_block_size(&mut self, block_size: u32) {
        assert!(block_size.is_power_of_two());
        self.block_size = block_size;
    }

    pub(crate) fn add_uid(&mut self, uid: u32) -> u8 {
        self.uids.push(uid);
        (self.uids.len() - 1) as u8
    }

    pub(crate) fn add_gid(&mut self, gid: u32) -> u8 {
        self.gids.push(gid);
        (self.gids.len() - 1) as u8
    }

    pub(crate) fn set_root(&mut self, inode_ref: u64) {
        self.root = inode_ref;
    }

    /// Absolute offset where the next data block will land.
    pub(crate) fn data_start(&self) -> u64 {
        DATA_BASE + self.data.len() as u64
    }

    fn append_data(&mut self, payload: &[u8], compress: bool) -> (u64, u32) {
        let start = self.data_start();
        let word = if compress {
            let packed = zlib_pack(payload);
            let word = packed.len() as u32;
            self.data.extend_from_slice(&packed);
            word
        } else {
            self.data.extend_from_slice(payload);
            payload.len() as u32 | COMPRESSED_BIT_BLOCK
        };
        (start, word)
    }

    /// Append a data block, returning its length word for the block list.
    pub(crate) fn add_data_block(&mut self, payload: &[u8], compress: bool) -> u32 {
        self.append_data(payload, compress).1
    }

    /// Like [`Self::add_data_block`] but returning the 16-bit length word
    /// used by 1.0 block lists.
    pub(crate) fn add_data_block_v1(&mut self, payload: &[u8], compress: bool) -> u16 {
        let (_, word) = self.append_data(payload, compress);
        if word & COMPRESSED_BIT_BLOCK != 0 {
            (word & !COMPRESSED_BIT_BLOCK) as u16 | COMPRESSED_BIT
        } else {
            word as u16
        }
    }

    /// Append a fragment block, returning its fragment table index.
    pub(crate) fn add_fragment(&mut self, payload: &[u8], compress: bool) -> u32 {
        let (start, word) = self.append_data(payload, compress);
        self.fragments.push((start as u32, word));
        (self.fragments.len() - 1) as u32
    }

    /// Packed reference to the next inode written.
    pub(crate) fn inode_pos(&self) -> u64 {
        let (block, offset) = self.inode_table.pos();
        (block << 16) | offset as u64
    }

    fn begin_inode(&mut self) -> u64 {
        self.inode_count += 1;
        self.inode_pos()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_reg_inode(
        &mut self,
        mode: u16,
        uid: u8,
        guid: u8,
        mtime: u32,
        start_block: u32,
        fragment: u32,
        frag_offset: u32,
        file_size: u32,
        words: &[u32],
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.inode_table.put_u16(FILE_TYPE);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
        self.inode_table.put_u32(mtime);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u32(fragment);
        self.inode_table.put_u32(frag_offset);
        self.inode_table.put_u32(file_size);
        for &word in words {
            self.inode_table.put_u32(word);
        }
        inode_ref
    }

    pub(crate) fn add_dir_inode(
        &mut self,
        mode: u16,
        uid: u8,
        guid: u8,
        start_block: u32,
        offset: u16,
        file_size: u32,
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.inode_table.put_u16(DIR_TYPE);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
        self.inode_table.put_u32(self.mkfs_time);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u32(file_size);
        self.inode_table.put_u16(offset);
        inode_ref
    }

    /// Extended directory; follow with `i_count` calls to
    /// [`Self::add_dir_index_entry`].
    pub(crate) fn add_ldir_inode(
        &mut self,
        mode: u16,
        uid: u8,
        guid: u8,
        start_block: u32,
        offset: u16,
        file_size: u32,
        i_count: u16,
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.inode_table.put_u16(LDIR_TYPE);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
        self.inode_table.put_u32(self.mkfs_time);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u32(file_size);
        self.inode_table.put_u16(offset);
        self.inode_table.put_u16(i_count);
        inode_ref
    }

    pub(crate) fn add_dir_index_entry(&mut self, index: u32, start_block: u32, name: &str) {
        self.inode_table.put_u32(index);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u8((name.len() - 1) as u8);
        self.inode_table.put_bytes(name.as_bytes());
    }

    pub(crate) fn add_symlink_inode(&mut self, mode: u16, uid: u8, guid: u8, target: &[u8]) -> u64 {
        let inode_ref = self.begin_inode();
        self.inode_table.put_u16(SYMLINK_TYPE);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
        self.inode_table.put_u16(target.len() as u16);
        self.inode_table.put_bytes(target);
        inode_ref
    }

    pub(crate) fn add_dev_inode(
        &mut self,
        block_dev: bool,
        mode: u16,
        uid: u8,
        guid: u8,
        rdev: u16,
    ) -> u64 {
        let inode_ref = self.begin_inode();
        let tag = if block_dev { BLKDEV_TYPE } else { CHRDEV_TYPE };
        self.inode_table.put_u16(tag);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
        self.inode_table.put_u16(rdev);
        inode_ref
    }

    fn put_v1_header(&mut self, bank: u8, tag: u16, mode: u16, uid: u8, guid: u8) {
        let type_byte = if tag == 0 {
            IPC_TYPE_1
        } else {
            bank * TYPES_1 + tag as u8
        };
        self.inode_table.put_u8(type_byte);
        self.inode_table.put_u16(mode);
        self.inode_table.put_u8(uid);
        self.inode_table.put_u8(guid);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_reg_inode_v1(
        &mut self,
        bank: u8,
        mode: u16,
        uid: u8,
        guid: u8,
        mtime: u32,
        start_block: u32,
        file_size: u32,
        words: &[u16],
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.put_v1_header(bank, FILE_TYPE, mode, uid, guid);
        self.inode_table.put_u32(mtime);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u32(file_size);
        for &word in words {
            self.inode_table.put_u16(word);
        }
        inode_ref
    }

    pub(crate) fn add_dir_inode_v1(
        &mut self,
        bank: u8,
        mode: u16,
        uid: u8,
        guid: u8,
        start_block: u32,
        offset: u16,
        file_size: u32,
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.put_v1_header(bank, DIR_TYPE, mode, uid, guid);
        self.inode_table.put_u32(self.mkfs_time);
        self.inode_table.put_u32(start_block);
        self.inode_table.put_u32(file_size);
        self.inode_table.put_u16(offset);
        inode_ref
    }

    pub(crate) fn add_ipc_inode_v1(
        &mut self,
        kind: u8,
        uid_bank: u8,
        mode: u16,
        uid: u8,
        guid: u8,
    ) -> u64 {
        let inode_ref = self.begin_inode();
        self.put_v1_header(0, 0, mode, uid, guid);
        self.inode_table.put_u8(kind);
        self.inode_table.put_u8(uid_bank);
        inode_ref
    }

    /// (directory-table-relative block, offset) of the next byte written to
    /// the directory table.
    pub(crate) fn dir_pos(&self) -> (u64, u16) {
        self.dir_table.pos()
    }

    /// Logical length of the directory stream written so far.
    pub(crate) fn dir_len(&self) -> u64 {
        self.dir_table.logical_len()
    }

    pub(crate) fn add_dir_header(&mut self, count_minus_one: u16, inode_start_block: u32) {
        self.dir_table.put_u16(count_minus_one);
        self.dir_table.put_u32(inode_start_block);
    }

    pub(crate) fn add_dir_entry(&mut self, offset: u16, entry_type: u8, name: &str) {
        self.add_dir_entry_raw(offset, entry_type, (name.len() - 1) as u8, name.as_bytes());
    }

    /// Raw variant for malformed streams; `size` need not match the name.
    pub(crate) fn add_dir_entry_raw(
        &mut self,
        offset: u16,
        entry_type: u8,
        size: u8,
        name: &[u8],
    ) {
        self.dir_table.put_u16(offset);
        self.dir_table.put_u8(entry_type);
        self.dir_table.put_u8(size);
        self.dir_table.put_bytes(name);
    }

    /// Write a single-run directory stream for `entries` and its inode.
    /// All referenced inodes must live in the same inode table block.
    /// Entries are written in the given order; callers wanting sorted
    /// directories pass them sorted.
    pub(crate) fn make_dir(&mut self, entries: &[(&str, u8, u64)]) -> u64 {
        let (start_block, offset) = self.dir_pos();
        let len_before = self.dir_table.logical_len();
        let inode_block = (entries[0].2 >> 16) as u32;
        self.add_dir_header((entries.len() - 1) as u16, inode_block);
        for &(name, entry_type, inode_ref) in entries {
            assert_eq!((inode_ref >> 16) as u32, inode_block);
            self.add_dir_entry(inode_ref as u16, entry_type, name);
        }
        let size = (self.dir_table.logical_len() - len_before) as u32;
        self.add_dir_inode(0o755, 0, 0xff, start_block as u32, offset, size)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut image = vec![0u8; DATA_BASE as usize];
        image.extend_from_slice(&self.data);

        let inode_table_start = image.len() as u32;
        image.extend(self.inode_table.finish());
        let directory_table_start = image.len() as u32;
        image.extend(self.dir_table.finish());

        let fragment_table_start = if self.fragments.is_empty() {
            0
        } else {
            assert!(self.fragments.len() <= METADATA_SIZE / 8);
            let mut entries = MetaTable::new(self.endian, self.check_data);
            for &(start, word) in &self.fragments {
                entries.put_u32(start);
                entries.put_u32(word);
            }
            let entries_start = image.len() as u32;
            image.extend(entries.finish());
            let index_start = image.len() as u32;
            put_u32(&mut image, self.endian, entries_start);
            index_start
        };

        let uid_start = image.len() as u32;
        for &uid in &self.uids {
            put_u32(&mut image, self.endian, uid);
        }
        for &gid in &self.gids {
            put_u32(&mut image, self.endian, gid);
        }

        let mut flags = 0u16;
        if self.check_data {
            flags |= 0x0004;
        }
        if self.fragments.is_empty() {
            flags |= 0x0008;
        }

        let mut sb = Vec::with_capacity(58);
        let endian = self.endian;
        put_u32(&mut sb, endian, SQUASHFS_MAGIC);
        put_u16(&mut sb, endian, self.major);
        put_u16(&mut sb, endian, self.minor);
        put_u16(&mut sb, endian, flags);
        put_u16(&mut sb, endian, if self.major == 1 { self.block_size as u16 } else { 0 });
        put_u16(&mut sb, endian, self.block_size.trailing_zeros() as u16);
        put_u32(&mut sb, endian, self.block_size);
        put_u32(&mut sb, endian, self.inode_count);
        put_u32(&mut sb, endian, self.fragments.len() as u32);
        put_u32(&mut sb, endian, inode_table_start);
        put_u32(&mut sb, endian, directory_table_start);
        put_u32(&mut sb, endian, fragment_table_start);
        put_u32(&mut sb, endian, uid_start);
        put_u16(&mut sb, endian, self.uids.len() as u16);
        put_u16(&mut sb, endian, self.gids.len() as u16);
        put_u64(&mut sb, endian, self.root);
        put_u32(&mut sb, endian, self.mkfs_time);
        image[..58].copy_from_slice(&sb);

        image
    }
}
