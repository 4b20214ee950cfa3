//! Split virtqueue memory.
//!
//! Virtqueues are the mechanism for bulk data transport between the
//! driver and the device. A split queue of size N lives in one
//! physically contiguous region:
//!
//! ```text
//! offset 0            descriptor table   N x 16 bytes
//! 16 * N              available ring     flags, idx, ring[N], used_event
//! next page boundary  used ring          flags, idx, ring[N] {id, len}, avail_event
//! ```
//!
//! This module only owns that memory and the producer/consumer cursors.
//! Building and walking descriptor chains is the device layer's job.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use core::sync::atomic::{fence, AtomicU16, Ordering};
use spin::{Mutex, MutexGuard};

use crate::config::{align_up, MAX_QUEUE_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hal::{DmaRegion, PageAllocator, PhysAddr};

/// VirtQueue descriptor flags.
pub mod desc_flags {
    /// Buffer continues via the next field.
    pub const NEXT: u16 = 1;
    /// Buffer is write-only (device writes, driver reads).
    pub const WRITE: u16 = 2;
    /// Buffer contains a list of buffer descriptors (indirect).
    pub const INDIRECT: u16 = 4;
}

/// Available ring flag: driver does not want used-buffer interrupts.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Used ring flag: device does not want available-buffer notifications.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// A virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Physical address of buffer.
    pub addr: u64,
    /// Length of buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

/// Used ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElement {
    /// Index of the descriptor chain head.
    pub id: u32,
    /// Total bytes written to buffer.
    pub len: u32,
}

/// Byte offsets of the three rings inside the queue region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    size: u16,
    available: usize,
    used: usize,
    total: usize,
}

impl RingLayout {
    /// Compute the layout for a queue of `size` entries.
    pub fn new(size: u16) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(Error::InvalidQueueSize(size));
        }
        let n = size as usize;
        let available = n * size_of::<Descriptor>();
        let available_len = 2 + 2 + 2 * n + 2;
        let used = align_up(available + available_len, PAGE_SIZE);
        let used_len = 2 + 2 + size_of::<UsedElement>() * n + 2;
        let total = align_up(used + used_len, PAGE_SIZE);
        Ok(Self { size, available, used, total })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Offset of the descriptor table.
    pub fn descriptors(&self) -> usize {
        0
    }

    /// Offset of the available ring.
    pub fn available(&self) -> usize {
        self.available
    }

    /// Offset of the used ring.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total bytes, a whole number of pages.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pages(&self) -> usize {
        self.total / PAGE_SIZE
    }

    fn descriptor(&self, index: u16) -> usize {
        index as usize * size_of::<Descriptor>()
    }

    fn avail_flags(&self) -> usize {
        self.available
    }

    fn avail_idx(&self) -> usize {
        self.available + 2
    }

    fn avail_slot(&self, ring_index: u16) -> usize {
        self.available + 4 + 2 * (ring_index % self.size) as usize
    }

    fn used_idx(&self) -> usize {
        self.used + 2
    }

    fn used_slot(&self, ring_index: u16) -> usize {
        self.used + 4 + size_of::<UsedElement>() * (ring_index % self.size) as usize
    }
}

/// Producer-side cursor, guarded by the queue lock.
struct ProducerState {
    free: Vec<u16>,
    next_avail: u16,
}

/// One split virtqueue.
pub struct VirtQueue {
    index: u16,
    notify_offset: u16,
    layout: RingLayout,
    region: DmaRegion,
    producer: Mutex<ProducerState>,
    /// Next used-ring index to consume. Only the consumer advances it.
    last_used: AtomicU16,
}

impl VirtQueue {
    /// Allocate ring memory for queue `index` with `size` entries.
    pub fn new(
        index: u16,
        size: u16,
        notify_offset: u16,
        allocator: &Arc<dyn PageAllocator>,
    ) -> Result<Self> {
        let layout = RingLayout::new(size)?;
        let region = DmaRegion::allocate(allocator, layout.pages(), "virtqueue")?;

        Ok(Self {
            index,
            notify_offset,
            layout,
            region,
            producer: Mutex::new(ProducerState {
                free: (0..size).rev().collect(),
                next_avail: 0,
            }),
            last_used: AtomicU16::new(0),
        })
    }

    /// Queue index within the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of descriptors.
    pub fn size(&self) -> u16 {
        self.layout.size
    }

    /// `queue_notify_off` read from the device.
    pub fn notify_offset(&self) -> u16 {
        self.notify_offset
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Physical address of the descriptor table.
    pub fn descriptor_area(&self) -> PhysAddr {
        self.region.phys_at(self.layout.descriptors())
    }

    /// Physical address of the available (driver) ring.
    pub fn driver_area(&self) -> PhysAddr {
        self.region.phys_at(self.layout.available())
    }

    /// Physical address of the used (device) ring.
    pub fn device_area(&self) -> PhysAddr {
        self.region.phys_at(self.layout.used())
    }

    /// Ask the device for used-buffer interrupts. Only a hint.
    pub fn enable_interrupts(&self) {
        let flags: u16 = self.region.read(self.layout.avail_flags());
        self.region
            .write(self.layout.avail_flags(), flags & !VIRTQ_AVAIL_F_NO_INTERRUPT);
    }

    /// Ask the device to suppress used-buffer interrupts. Only a hint.
    pub fn disable_interrupts(&self) {
        let flags: u16 = self.region.read(self.layout.avail_flags());
        self.region
            .write(self.layout.avail_flags(), flags | VIRTQ_AVAIL_F_NO_INTERRUPT);
    }

    /// Whether used-buffer interrupts are currently requested.
    pub fn interrupts_enabled(&self) -> bool {
        let flags: u16 = self.region.read(self.layout.avail_flags());
        flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0
    }

    /// Whether the device asked not to be notified.
    pub fn device_wants_notify(&self) -> bool {
        fence(Ordering::SeqCst);
        let flags: u16 = self.region.read(self.layout.used());
        flags & VIRTQ_USED_F_NO_NOTIFY == 0
    }

    /// Lock the producer side.
    pub fn producer(&self) -> QueueProducer<'_> {
        QueueProducer {
            queue: self,
            state: self.producer.lock(),
        }
    }

    /// Consume the next used element, if the device produced one.
    ///
    /// Single consumer: only one context (normally the interrupt
    /// handler) may call this for a given queue. It never takes the
    /// producer lock.
    pub fn pop_used(&self) -> Option<UsedElement> {
        let last = self.last_used.load(Ordering::Acquire);

        fence(Ordering::SeqCst);
        let device_idx: u16 = self.region.read(self.layout.used_idx());
        if last == device_idx {
            return None;
        }
        // Read the element only after observing the index.
        fence(Ordering::SeqCst);

        let elem: UsedElement = self.region.read(self.layout.used_slot(last));
        self.last_used.store(last.wrapping_add(1), Ordering::Release);
        Some(elem)
    }

    /// Check if the queue has completions not yet consumed.
    pub fn has_pending(&self) -> bool {
        fence(Ordering::SeqCst);
        let device_idx: u16 = self.region.read(self.layout.used_idx());
        self.last_used.load(Ordering::Acquire) != device_idx
    }
}

/// Exclusive producer access to a queue.
pub struct QueueProducer<'a> {
    queue: &'a VirtQueue,
    state: MutexGuard<'a, ProducerState>,
}

impl QueueProducer<'_> {
    /// Allocate a descriptor from the free list.
    pub fn alloc_descriptor(&mut self) -> Option<u16> {
        self.state.free.pop()
    }

    /// Free a descriptor back to the free list.
    pub fn free_descriptor(&mut self, index: u16) {
        debug_assert!(index < self.queue.size());
        debug_assert!(!self.state.free.contains(&index), "descriptor freed twice");
        self.state.free.push(index);
    }

    /// Get the number of free descriptors.
    pub fn free_count(&self) -> usize {
        self.state.free.len()
    }

    /// Store a descriptor in the table.
    pub fn write_descriptor(&mut self, index: u16, desc: Descriptor) {
        assert!(index < self.queue.size(), "descriptor index out of range");
        self.queue.region.write(self.queue.layout.descriptor(index), desc);
    }

    /// Load a descriptor from the table.
    pub fn read_descriptor(&self, index: u16) -> Descriptor {
        assert!(index < self.queue.size(), "descriptor index out of range");
        self.queue.region.read(self.queue.layout.descriptor(index))
    }

    /// Publish a chain head on the available ring.
    pub fn make_available(&mut self, head: u16) {
        let ring_index = self.state.next_avail;
        self.queue
            .region
            .write(self.queue.layout.avail_slot(ring_index), head);

        // Memory barrier before updating index
        fence(Ordering::SeqCst);

        let next = ring_index.wrapping_add(1);
        self.queue.region.write(self.queue.layout.avail_idx(), next);
        self.state.next_avail = next;

        // Index visible before the notify that follows.
        fence(Ordering::SeqCst);
    }

    /// Current free-running available index.
    pub fn available_index(&self) -> u16 {
        self.state.next_avail
    }
}
