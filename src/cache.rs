//! Fixed-slot caches for decompressed blocks.
//!
//! Both caches hold a small constant number of slots behind a mutex and a
//! condvar. A reader that misses claims a free slot round-robin, marks it
//! busy, fills it outside the lock and publishes the result; readers that
//! find no usable slot wait on the condvar and rescan. The metadata cache
//! evicts any slot that is not mid-fill, the fragment cache additionally
//! pins slots with a reference count for as long as a handle to the data is
//! held.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
};

use log::trace;

use crate::Result;

/// Position inside the metadata stream: the byte offset of a metadata block
/// on disk plus an offset into its decompressed contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MetaPos {
    pub(crate) block: u64,
    pub(crate) offset: usize,
}

impl MetaPos {
    pub(crate) fn new(block: u64, offset: usize) -> Self {
        Self { block, offset }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockSlotState {
    Free,
    /// Claimed by a reader that is currently filling it
    Busy,
    Ready(u64),
}

struct BlockSlot {
    state: BlockSlotState,
    data: Vec<u8>,
    /// Byte offset of the metadata block following this one on disk
    next_index: u64,
}

struct BlockCacheInner {
    slots: Vec<BlockSlot>,
    /// Round-robin eviction cursor
    next_slot: usize,
}

/// Cache of decompressed metadata blocks, keyed by the block's byte offset
/// on disk.
pub(crate) struct BlockCache {
    inner: Mutex<BlockCacheInner>,
    /// Signalled whenever a slot is published or freed
    available: Condvar,
}

impl BlockCache {
    pub(crate) fn new(slots: usize) -> Self {
        let slots = (0..slots)
            .map(|_| BlockSlot {
                state: BlockSlotState::Free,
                data: Vec::new(),
                next_index: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(BlockCacheInner {
                slots,
                next_slot: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Copy `len` bytes of the metadata stream starting at `pos` into `out`
    /// (or just advance past them when `out` is `None`), following the chain
    /// into the next block as needed. `fetch` reads and decompresses one
    /// metadata block, returning its contents and the disk offset of the
    /// block after it. Returns the stream position just past the copied span.
    pub(crate) fn copy<F>(
        &self,
        pos: MetaPos,
        len: usize,
        mut out: Option<&mut [u8]>,
        fetch: F,
    ) -> Result<MetaPos>
    where
        F: Fn(u64) -> Result<(Vec<u8>, u64)>,
    {
        if let Some(out) = &out {
            debug_assert_eq!(out.len(), len);
        }

        let mut pos = pos;
        let mut copied = 0;
        loop {
            // Acquire the block at pos.block, filling a slot if nobody has it
            let mut inner = self.inner.lock().unwrap();
            let slot = loop {
                if let Some(i) = inner
                    .slots
                    .iter()
                    .position(|s| s.state == BlockSlotState::Ready(pos.block))
                {
                    break i;
                }

                let n = inner.slots.len();
                let cursor = inner.next_slot;
                let claimed = (0..n)
                    .map(|k| (cursor + k) % n)
                    .find(|&i| inner.slots[i].state != BlockSlotState::Busy);
                let Some(i) = claimed else {
                    // Every slot is being filled, wait for one to settle
                    inner = self.available.wait(inner).unwrap();
                    continue;
                };

                inner.next_slot = (i + 1) % n;
                inner.slots[i].state = BlockSlotState::Busy;
                drop(inner);

                trace!("filling metadata cache slot {i} with block 0x{:x}", pos.block);
                let fetched = fetch(pos.block);
                inner = self.inner.lock().unwrap();
                match fetched {
                    Ok((data, next_index)) => {
                        let slot = &mut inner.slots[i];
                        slot.data = data;
                        slot.next_index = next_index;
                        slot.state = BlockSlotState::Ready(pos.block);
                        self.available.notify_all();
                        // Rescan: another reader may also have published this
                        // block, the copy below must see a consistent one
                    }
                    Err(e) => {
                        inner.slots[i].state = BlockSlotState::Free;
                        self.available.notify_all();
                        return Err(e);
                    }
                }
            };

            let slot = &inner.slots[slot];
            if pos.offset > slot.data.len() {
                return Err(crate::Error::CorruptMetadata(
                    "offset beyond end of metadata block",
                ));
            }
            let available = slot.data.len() - pos.offset;
            let wanted = len - copied;
            let take = available.min(wanted);
            if let Some(out) = &mut out {
                out[copied..copied + take].copy_from_slice(&slot.data[pos.offset..pos.offset + take]);
            }
            copied += take;

            if copied == len {
                // Land on the next block when the span ends exactly at a
                // block boundary, so follow-up reads chain correctly
                let next = if pos.offset + take == slot.data.len() {
                    MetaPos::new(slot.next_index, 0)
                } else {
                    MetaPos::new(pos.block, pos.offset + take)
                };
                return Ok(next);
            }
            pos = MetaPos::new(slot.next_index, 0);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FragSlotState {
    Free,
    /// Being filled with the fragment block at this disk offset
    Filling(u64),
    Ready(u64),
}

struct FragSlot {
    state: FragSlotState,
    /// Number of outstanding handles, the slot cannot be evicted while > 0
    locked: u32,
    data: Arc<[u8]>,
}

struct FragCacheInner {
    slots: Vec<FragSlot>,
    next_slot: usize,
}

/// Pinned view of a decompressed fragment block. Dropping it unpins the
/// slot.
pub(crate) struct FragmentHandle<'a> {
    cache: &'a FragmentCache,
    slot: usize,
    pub(crate) data: Arc<[u8]>,
}

impl fmt::Debug for FragmentHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentHandle")
            .field("slot", &self.slot)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for FragmentHandle<'_> {
    fn drop(&mut self) {
        let mut inner = self.cache.inner.lock().unwrap();
        inner.slots[self.slot].locked -= 1;
        drop(inner);
        self.cache.available.notify_all();
    }
}

/// Cache of decompressed fragment blocks, keyed by the fragment block's byte
/// offset on disk. Unlike the metadata cache, concurrent readers of the same
/// fragment share one fill: whoever claims the slot decompresses, everyone
/// else waits for the publication.
pub(crate) struct FragmentCache {
    inner: Mutex<FragCacheInner>,
    available: Condvar,
}

impl FragmentCache {
    pub(crate) fn new(slots: usize) -> Self {
        let slots = (0..slots)
            .map(|_| FragSlot {
                state: FragSlotState::Free,
                locked: 0,
                data: Arc::from(Vec::new()),
            })
            .collect();
        Self {
            inner: Mutex::new(FragCacheInner {
                slots,
                next_slot: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Get a pinned handle on the fragment block at `start_block`, filling a
    /// slot through `fetch` on a miss.
    pub(crate) fn acquire<F>(&self, start_block: u64, fetch: F) -> Result<FragmentHandle<'_>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let mut fetch = Some(fetch);
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(i) = inner
                .slots
                .iter()
                .position(|s| s.state == FragSlotState::Ready(start_block))
            {
                inner.slots[i].locked += 1;
                let data = Arc::clone(&inner.slots[i].data);
                return Ok(FragmentHandle {
                    cache: self,
                    slot: i,
                    data,
                });
            }

            if inner
                .slots
                .iter()
                .any(|s| s.state == FragSlotState::Filling(start_block))
            {
                // Someone else is already decompressing this fragment
                inner = self.available.wait(inner).unwrap();
                continue;
            }

            let n = inner.slots.len();
            let cursor = inner.next_slot;
            let claimed = (0..n)
                .map(|k| (cursor + k) % n)
                .find(|&i| inner.slots[i].locked == 0);
            let Some(i) = claimed else {
                inner = self.available.wait(inner).unwrap();
                continue;
            };

            inner.next_slot = (i + 1) % n;
            inner.slots[i].state = FragSlotState::Filling(start_block);
            inner.slots[i].locked = 1;
            drop(inner);

            trace!("filling fragment cache slot {i} with block 0x{start_block:x}");
            // acquire is entered with Some(fetch) and the claim path runs at
            // most once, every other path loops back or returns
            let fetched = fetch.take().expect("fragment fill ran twice")();
            inner = self.inner.lock().unwrap();
            match fetched {
                Ok(data) => {
                    inner.slots[i].data = Arc::from(data);
                    inner.slots[i].state = FragSlotState::Ready(start_block);
                    let data = Arc::clone(&inner.slots[i].data);
                    drop(inner);
                    self.available.notify_all();
                    return Ok(FragmentHandle {
                        cache: self,
                        slot: i,
                        data,
                    });
                }
                Err(e) => {
                    inner.slots[i].state = FragSlotState::Free;
                    inner.slots[i].locked = 0;
                    drop(inner);
                    self.available.notify_all();
                    return Err(e);
                }
            }
        }
    }
}
