//! Hardware collaborators.
//!
//! The transport never touches page tables or the interrupt controller
//! directly. The kernel hands it a [`Platform`] bundling:
//!
//! - a [`PageAllocator`] for physically contiguous, pinned pages
//! - an [`MmioMapper`] turning a physical BAR window into registers
//! - an [`InterruptController`] accepting interrupt-context callbacks
//!
//! [`DmaRegion`] is the one owned view over allocated pages; every ring
//! and pool addresses its memory through bounds-checked offsets into it.

use alloc::sync::Arc;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::pci::PciBus;

/// Physical (bus) address as seen by the device.
pub type PhysAddr = u64;

/// A run of physically contiguous pages.
#[derive(Debug)]
pub struct ContiguousPages {
    /// Kernel virtual address of the first page.
    pub virt: NonNull<u8>,
    /// Physical address of the first page.
    pub phys: PhysAddr,
    /// Number of pages.
    pub count: usize,
}

// SAFETY: the pages are plain memory owned by whoever holds the value.
unsafe impl Send for ContiguousPages {}

/// Memory manager collaborator.
pub trait PageAllocator: Send + Sync {
    /// Allocate `count` physically contiguous, pinned pages.
    fn allocate_contiguous_pages(&self, count: usize, tag: &'static str) -> Option<ContiguousPages>;

    /// Return pages obtained from [`Self::allocate_contiguous_pages`].
    ///
    /// # Safety
    ///
    /// The pages must come from this allocator and must not be accessed
    /// by the CPU or any device afterwards.
    unsafe fn free_contiguous_pages(&self, pages: ContiguousPages);
}

/// A window of device registers.
///
/// Offsets are relative to the start of the window. Implementations
/// perform volatile, correctly sized accesses.
pub trait RegisterWindow: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);

    /// 64-bit register as two 32-bit halves, low half first.
    fn read64(&self, offset: usize) -> u64 {
        let low = self.read32(offset) as u64;
        let high = self.read32(offset + 4) as u64;
        low | (high << 32)
    }

    /// 64-bit register as two 32-bit halves, low half first.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// MMIO mapping collaborator.
pub trait MmioMapper: Send + Sync {
    /// Map `len` bytes of device memory at physical address `phys`.
    fn map(&self, phys: PhysAddr, len: usize) -> Option<Arc<dyn RegisterWindow>>;
}

/// Callback run in interrupt context. Must not block or allocate.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt controller collaborator.
pub trait InterruptController: Send + Sync {
    /// Install `handler` for legacy interrupt line `irq`.
    ///
    /// Returns `false` if the line cannot be routed.
    fn register_handler(&self, irq: u8, handler: InterruptHandler) -> bool;
}

/// Everything the transport needs from the rest of the kernel.
pub struct Platform {
    /// PCI configuration access.
    pub pci: PciBus,
    /// Contiguous page allocator.
    pub pages: Arc<dyn PageAllocator>,
    /// BAR mapper.
    pub mmio: Arc<dyn MmioMapper>,
    /// Interrupt controller.
    pub interrupts: Arc<dyn InterruptController>,
}

/// Registers mapped at a kernel virtual address.
pub struct MmioWindow {
    base: usize,
    len: usize,
}

impl MmioWindow {
    /// Wrap an already mapped register block.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped uncached device memory for the
    /// lifetime of the window.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        assert!(offset + size_of::<T>() <= self.len, "MMIO access out of window");
        (self.base + offset) as *mut T
    }
}

impl RegisterWindow for MmioWindow {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn read16(&self, offset: usize) -> u16 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.ptr(offset)) }
    }

    fn write8(&self, offset: usize, value: u8) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.ptr(offset), value) }
    }
}

/// One owned, physically contiguous DMA allocation.
///
/// Accessors take `&self`: the memory is shared with the device, so the
/// CPU side uses volatile accesses and callers provide their own
/// serialization for the bytes they own.
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: PhysAddr,
    len: usize,
    pages: usize,
    allocator: Arc<dyn PageAllocator>,
}

// SAFETY: the region is plain pinned memory; concurrent access is
// coordinated by the owners of the sub-ranges.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate `pages` zeroed pages.
    pub fn allocate(
        allocator: &Arc<dyn PageAllocator>,
        pages: usize,
        tag: &'static str,
    ) -> Result<Self> {
        let chunk = allocator
            .allocate_contiguous_pages(pages, tag)
            .ok_or(Error::OutOfMemory)?;
        debug_assert_eq!(chunk.phys as usize % PAGE_SIZE, 0, "pages must be page aligned");

        let region = DmaRegion {
            virt: chunk.virt,
            phys: chunk.phys,
            len: pages * PAGE_SIZE,
            pages,
            allocator: Arc::clone(allocator),
        };
        region.fill(0, region.len, 0);
        Ok(region)
    }

    /// Physical address of the first byte.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Kernel virtual address of the first byte.
    pub fn virt(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    /// Length in bytes (whole pages).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of `offset`.
    pub fn phys_at(&self, offset: usize) -> PhysAddr {
        assert!(offset <= self.len, "DMA offset out of region");
        self.phys + offset as u64
    }

    fn checked<T>(&self, offset: usize) -> *mut T {
        assert!(offset + size_of::<T>() <= self.len, "DMA access out of region");
        let addr = self.virt() + offset;
        debug_assert_eq!(addr % align_of::<T>(), 0, "misaligned DMA access");
        addr as *mut T
    }

    /// Volatile read of a `T` at `offset`.
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        unsafe { ptr::read_volatile(self.checked::<T>(offset)) }
    }

    /// Volatile write of a `T` at `offset`.
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        unsafe { ptr::write_volatile(self.checked::<T>(offset), value) }
    }

    /// Copy bytes out of the region.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "DMA access out of region");
        unsafe {
            ptr::copy_nonoverlapping(
                (self.virt() + offset) as *const u8,
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// Copy bytes into the region.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "DMA access out of region");
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), (self.virt() + offset) as *mut u8, data.len());
        }
    }

    /// Set `len` bytes at `offset` to `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len, "DMA access out of region");
        unsafe { ptr::write_bytes((self.virt() + offset) as *mut u8, byte, len) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        let pages = ContiguousPages {
            virt: self.virt,
            phys: self.phys,
            count: self.pages,
        };
        // SAFETY: allocated from this allocator in `allocate`; the region
        // is being dropped so nothing references it any more.
        unsafe { self.allocator.free_contiguous_pages(pages) };
    }
}
