//! DMA buffer pools.
//!
//! Slab allocators over physically contiguous pages. Two flavours share
//! one slab core:
//!
//! - [`DmaObjectPool<T>`]: one page carved into `T`-sized slots, each
//!   constructed in place from a prototype value
//! - [`DmaBufferPool`]: `count` byte buffers of a size chosen at runtime,
//!   rounded up to whole pages
//!
//! Slot bookkeeping lives on the kernel heap, never inside the DMA pages,
//! so a device scribbling over its buffers cannot corrupt the free list.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::config::{align_up, pages_for, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hal::{DmaRegion, PageAllocator, PhysAddr};

/// Source of pool identities, so handles can be matched to their pool.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// An exclusively owned slot of a DMA pool.
///
/// Not `Clone`: ownership moves back to the pool on release.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaHandle {
    pool: u32,
    slot: u16,
    virt: usize,
    phys: PhysAddr,
    size: usize,
}

impl DmaHandle {
    /// Kernel virtual address of the slot.
    pub fn virt(&self) -> usize {
        self.virt
    }

    /// Physical address of the slot.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Slot size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Free list plus ownership map for one slab.
struct SlotTable {
    /// Capacity-bounded stack of free slot indices.
    free: Vec<u16>,
    in_use: Vec<bool>,
}

impl SlotTable {
    fn new(count: usize) -> Self {
        let mut free = Vec::with_capacity(count);
        // Hand out low slots first.
        free.extend((0..count as u16).rev());
        Self {
            free,
            in_use: alloc::vec![false; count],
        }
    }

    fn acquire(&mut self) -> Option<u16> {
        let slot = self.free.pop()?;
        debug_assert!(!self.in_use[slot as usize], "free list held a live slot");
        self.in_use[slot as usize] = true;
        Some(slot)
    }

    fn release(&mut self, slot: u16) -> bool {
        match self.in_use.get(slot as usize) {
            Some(true) => {}
            _ => {
                log::error!("[DMA] release of slot {} that is not held", slot);
                return false;
            }
        }
        if self.free.len() == self.in_use.len() {
            log::error!("[DMA] free list overflow releasing slot {}", slot);
            return false;
        }
        self.in_use[slot as usize] = false;
        self.free.push(slot);
        true
    }
}

/// Shared slab core.
struct Slab {
    id: u32,
    region: DmaRegion,
    slot_size: usize,
    count: usize,
    slots: Mutex<SlotTable>,
}

impl Slab {
    fn new(
        allocator: &Arc<dyn PageAllocator>,
        slot_size: usize,
        count: usize,
        tag: &'static str,
    ) -> Result<Self> {
        if slot_size == 0 || count == 0 || count > u16::MAX as usize {
            return Err(Error::BufferTooSmall);
        }
        let region = DmaRegion::allocate(allocator, pages_for(slot_size * count), tag)?;
        log::debug!(
            "[DMA] pool '{}': {} x {} bytes at {:#x}",
            tag,
            count,
            slot_size,
            region.phys()
        );
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            region,
            slot_size,
            count,
            slots: Mutex::new(SlotTable::new(count)),
        })
    }

    fn try_acquire(&self) -> Option<DmaHandle> {
        let slot = self.slots.lock().acquire()?;
        let offset = slot as usize * self.slot_size;
        Some(DmaHandle {
            pool: self.id,
            slot,
            virt: self.region.virt() + offset,
            phys: self.region.phys_at(offset),
            size: self.slot_size,
        })
    }

    fn release(&self, handle: DmaHandle) -> bool {
        if handle.pool != self.id {
            log::error!(
                "[DMA] handle from pool {} released into pool {}",
                handle.pool,
                self.id
            );
            return false;
        }
        self.slots.lock().release(handle.slot)
    }

    fn available(&self) -> usize {
        self.slots.lock().free.len()
    }

    /// Region offset of `handle`, checking it belongs here.
    fn offset_of(&self, handle: &DmaHandle) -> usize {
        assert_eq!(handle.pool, self.id, "DMA handle used with a foreign pool");
        handle.slot as usize * self.slot_size
    }
}

/// Pool of fixed-size byte buffers.
pub struct DmaBufferPool {
    slab: Slab,
}

impl DmaBufferPool {
    /// Create `count` buffers of `buffer_size` bytes.
    pub fn new(
        allocator: &Arc<dyn PageAllocator>,
        buffer_size: usize,
        count: usize,
        tag: &'static str,
    ) -> Result<Self> {
        Ok(Self {
            slab: Slab::new(allocator, buffer_size, count, tag)?,
        })
    }

    /// Take a free buffer; `None` means retry later.
    pub fn try_acquire(&self) -> Option<DmaHandle> {
        self.slab.try_acquire()
    }

    /// Take a free buffer or report [`Error::WouldBlock`].
    pub fn acquire(&self) -> Result<DmaHandle> {
        self.try_acquire().ok_or(Error::WouldBlock)
    }

    /// Return a buffer. Foreign or stale handles are logged and dropped.
    pub fn release(&self, handle: DmaHandle) {
        self.slab.release(handle);
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.slab.slot_size
    }

    /// Total buffers.
    pub fn capacity(&self) -> usize {
        self.slab.count
    }

    /// Buffers currently free.
    pub fn available(&self) -> usize {
        self.slab.available()
    }

    fn check_range(handle: &DmaHandle, offset: usize, len: usize) {
        assert!(offset + len <= handle.size, "access past end of DMA buffer");
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, handle: &DmaHandle, offset: usize, data: &[u8]) {
        Self::check_range(handle, offset, data.len());
        let base = self.slab.offset_of(handle);
        self.slab.region.write_bytes(base + offset, data);
    }

    /// Copy bytes at `offset` out of the buffer.
    pub fn read(&self, handle: &DmaHandle, offset: usize, out: &mut [u8]) {
        Self::check_range(handle, offset, out.len());
        let base = self.slab.offset_of(handle);
        self.slab.region.read_bytes(base + offset, out);
    }

    /// Fill `len` bytes at `offset` with `byte`.
    pub fn fill(&self, handle: &DmaHandle, offset: usize, len: usize, byte: u8) {
        Self::check_range(handle, offset, len);
        let base = self.slab.offset_of(handle);
        self.slab.region.fill(base + offset, len, byte);
    }
}

/// A typed slot from a [`DmaObjectPool`].
#[derive(Debug)]
pub struct DmaObject<T> {
    handle: DmaHandle,
    _marker: PhantomData<T>,
}

impl<T> DmaObject<T> {
    /// Physical address of the object.
    pub fn phys(&self) -> PhysAddr {
        self.handle.phys
    }

    /// Underlying untyped handle.
    pub fn handle(&self) -> &DmaHandle {
        &self.handle
    }
}

/// One page of in-place constructed `T` objects.
pub struct DmaObjectPool<T: Copy> {
    slab: Slab,
    prototype: T,
}

impl<T: Copy> DmaObjectPool<T> {
    /// Slot stride for `T`.
    pub const STRIDE: usize = align_up(size_of::<T>(), align_of::<T>());

    /// Carve one page into `T` slots, each initialised to `prototype`.
    pub fn new(allocator: &Arc<dyn PageAllocator>, prototype: T, tag: &'static str) -> Result<Self> {
        let count = PAGE_SIZE / Self::STRIDE;
        let slab = Slab::new(allocator, Self::STRIDE, count, tag)?;
        for slot in 0..count {
            slab.region.write(slot * Self::STRIDE, prototype);
        }
        Ok(Self { slab, prototype })
    }

    /// Take an object, reset to the prototype; `None` means retry later.
    pub fn try_acquire(&self) -> Option<DmaObject<T>> {
        let handle = self.slab.try_acquire()?;
        let object = DmaObject {
            handle,
            _marker: PhantomData,
        };
        self.write(&object, self.prototype);
        Some(object)
    }

    /// Return an object.
    pub fn release(&self, object: DmaObject<T>) {
        self.slab.release(object.handle);
    }

    /// Volatile read of the object.
    pub fn read(&self, object: &DmaObject<T>) -> T {
        self.slab.region.read(self.slab.offset_of(&object.handle))
    }

    /// Volatile write of the object.
    pub fn write(&self, object: &DmaObject<T>, value: T) {
        self.slab.region.write(self.slab.offset_of(&object.handle), value)
    }

    pub fn capacity(&self) -> usize {
        self.slab.count
    }

    pub fn available(&self) -> usize {
        self.slab.available()
    }
}
