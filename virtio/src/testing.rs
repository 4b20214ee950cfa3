//! Host-side stand-ins for the kernel collaborators.
//!
//! `HeapPages` hands out page-aligned heap memory whose "physical"
//! address is its virtual address, so a simulated device can follow the
//! addresses the driver programs. `SimGpu` implements the VirtIO PCI
//! register semantics over one BAR and services the real rings in memory.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::device::{common_cfg, isr, ConfigurationType, DeviceStatus, PCI_CAP_ID_VENDOR};
use crate::gpu::{
    command, gpu_config, ControlHeader, DisplayOne, Rect, RespDisplayInfo, RespEdid,
    ResourceAttachBacking, ResourceCreate2d, ResourceDetachBacking, ResourceFlush, ResourceUnref,
    SetScanout, TransferToHost2d, UpdateCursor, WireFormat, EDID_BLOB_SIZE, MAX_SCANOUTS,
};
use crate::hal::{
    ContiguousPages, InterruptController, InterruptHandler, MmioMapper, PageAllocator, PhysAddr,
    Platform, RegisterWindow,
};
use crate::pci::{ConfigAccess, PciAddress, PciBus, PciFunction};
use crate::queue::{desc_flags, Descriptor, UsedElement, VIRTQ_AVAIL_F_NO_INTERRUPT};

/// Page allocator over the host heap.
pub struct HeapPages {
    outstanding: AtomicUsize,
}

impl HeapPages {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Pages allocated and not yet freed.
    pub fn pages_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn layout(count: usize) -> Option<Layout> {
        Layout::from_size_align(count.checked_mul(PAGE_SIZE)?, PAGE_SIZE).ok()
    }
}

impl PageAllocator for HeapPages {
    fn allocate_contiguous_pages(&self, count: usize, _tag: &'static str) -> Option<ContiguousPages> {
        if count == 0 {
            return None;
        }
        let layout = Self::layout(count)?;
        // SAFETY: layout has non-zero size.
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        Some(ContiguousPages {
            virt,
            phys: virt.as_ptr() as PhysAddr,
            count,
        })
    }

    unsafe fn free_contiguous_pages(&self, pages: ContiguousPages) {
        if let Some(layout) = Self::layout(pages.count) {
            self.outstanding.fetch_sub(pages.count, Ordering::SeqCst);
            dealloc(pages.virt.as_ptr(), layout);
        }
    }
}

/// One function's configuration registers.
struct FakeFunction {
    regs: [u8; 256],
    /// Writable bits per BAR dword; zero means unimplemented.
    bar_masks: [u32; 6],
    cap_tail: Option<u8>,
}

impl FakeFunction {
    fn dword(&self, offset: u16) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([self.regs[o], self.regs[o + 1], self.regs[o + 2], self.regs[o + 3]])
    }

    fn set_dword(&mut self, offset: u16, value: u32) {
        let o = offset as usize;
        self.regs[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// In-memory PCI configuration space.
pub struct FakeConfigSpace {
    functions: Mutex<BTreeMap<PciAddress, FakeFunction>>,
}

impl FakeConfigSpace {
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(BTreeMap::new()),
        }
    }

    fn with<R>(&self, addr: PciAddress, f: impl FnOnce(&mut FakeFunction) -> R) -> R {
        let mut functions = self.functions.lock();
        let function = functions.get_mut(&addr).expect("function not present");
        f(function)
    }

    /// Add a function with the raw header type byte (bit 7: multifunction).
    pub fn add_function(&self, addr: PciAddress, vendor: u16, device: u16, header_type: u8) {
        let mut function = FakeFunction {
            regs: [0; 256],
            bar_masks: [0; 6],
            cap_tail: None,
        };
        function.regs[0..2].copy_from_slice(&vendor.to_le_bytes());
        function.regs[2..4].copy_from_slice(&device.to_le_bytes());
        function.regs[0x0E] = header_type;
        self.functions.lock().insert(addr, function);
    }

    /// Add a PCI-to-PCI bridge forwarding to `secondary_bus`.
    pub fn add_bridge(&self, addr: PciAddress, secondary_bus: u8) {
        self.add_function(addr, 0x8086, 0x244E, 0x01);
        self.with(addr, |f| {
            f.regs[0x0B] = 0x06;
            f.regs[0x0A] = 0x04;
            f.regs[0x19] = secondary_bus;
        });
    }

    /// Implement memory BAR `index` of `size` bytes at `address`.
    pub fn set_memory_bar(&self, addr: PciAddress, index: usize, address: u64, size: u64, is_64bit: bool) {
        self.with(addr, |f| {
            let offset = 0x10 + index as u16 * 4;
            let type_bits = if is_64bit { 0x4 } else { 0x0 };
            f.set_dword(offset, (address as u32 & !0xF) | type_bits);
            f.bar_masks[index] = !(size as u32 - 1) & !0xF;
            if is_64bit {
                f.set_dword(offset + 4, (address >> 32) as u32);
                f.bar_masks[index + 1] = 0xFFFF_FFFF;
            }
        });
    }

    pub fn set_interrupt(&self, addr: PciAddress, line: u8, pin: u8) {
        self.with(addr, |f| {
            f.regs[0x3C] = line;
            f.regs[0x3D] = pin;
        });
    }

    /// Append a capability; `body` follows the id/next bytes.
    pub fn add_capability(&self, addr: PciAddress, offset: u8, id: u8, body: &[u8]) {
        self.with(addr, |f| {
            let o = offset as usize;
            f.regs[o] = id;
            f.regs[o + 1] = 0;
            f.regs[o + 2..o + 2 + body.len()].copy_from_slice(body);
            match f.cap_tail {
                Some(tail) => f.regs[tail as usize + 1] = offset,
                None => f.regs[0x34] = offset,
            }
            f.cap_tail = Some(offset);
            f.regs[0x06] |= 0x10;
        });
    }

    /// Overwrite a dword of `addr`'s configuration space.
    pub fn set_register32(&self, addr: PciAddress, offset: u16, value: u32) {
        self.with(addr, |f| f.set_dword(offset, value));
    }

    /// Append a VirtIO vendor capability.
    pub fn add_virtio_capability(
        &self,
        addr: PciAddress,
        offset: u8,
        cfg_type: ConfigurationType,
        bar: u8,
        region_offset: u32,
        length: u32,
        notify_multiplier: Option<u32>,
    ) {
        let mut body = Vec::new();
        let cap_len = if notify_multiplier.is_some() { 20 } else { 16 };
        body.extend_from_slice(&[cap_len, cfg_type as u8, bar, 0, 0, 0]);
        body.extend_from_slice(&region_offset.to_le_bytes());
        body.extend_from_slice(&length.to_le_bytes());
        if let Some(multiplier) = notify_multiplier {
            body.extend_from_slice(&multiplier.to_le_bytes());
        }
        self.add_capability(addr, offset, PCI_CAP_ID_VENDOR, &body);
    }
}

impl ConfigAccess for FakeConfigSpace {
    fn read32(&self, address: PciAddress, offset: u16) -> u32 {
        match self.functions.lock().get(&address) {
            Some(function) => function.dword(offset),
            None => 0xFFFF_FFFF,
        }
    }

    fn write32(&self, address: PciAddress, offset: u16, value: u32) {
        let mut functions = self.functions.lock();
        let Some(function) = functions.get_mut(&address) else {
            return;
        };
        let old = function.dword(offset);
        let new = match offset {
            // Status half is read-only here.
            0x04 => (old & 0xFFFF_0000) | (value & 0xFFFF),
            0x10..=0x27 => {
                let mask = function.bar_masks[(offset as usize - 0x10) / 4];
                (value & mask) | (old & !mask)
            }
            // Identification and header type are read-only.
            0x00 | 0x08 | 0x0C => old,
            _ => value,
        };
        function.set_dword(offset, new);
    }
}

/// Interrupt controller that records handlers and raises lines on demand.
pub struct FakeInterrupts {
    handlers: Mutex<Vec<(u8, InterruptHandler)>>,
    refuse: AtomicBool,
}

impl FakeInterrupts {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        }
    }

    /// Fire every handler registered on `irq`.
    pub fn raise(&self, irq: u8) {
        let handlers: Vec<InterruptHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(line, _)| *line == irq)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler();
        }
    }

    pub fn has_handler(&self, irq: u8) -> bool {
        self.handlers.lock().iter().any(|(line, _)| *line == irq)
    }

    /// Make later registrations fail.
    pub fn refuse_registrations(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

impl InterruptController for FakeInterrupts {
    fn register_handler(&self, irq: u8, handler: InterruptHandler) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        self.handlers.lock().push((irq, handler));
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct SimQueue {
    size: u16,
    msix_vector: u16,
    enabled: bool,
    desc: u64,
    driver: u64,
    device: u64,
    last_avail: u16,
    used_idx: u16,
}

impl SimQueue {
    const fn new() -> Self {
        Self {
            size: SimGpu::QUEUE_MAX,
            msix_vector: 0,
            enabled: false,
            desc: 0,
            driver: 0,
            device: 0,
            last_avail: 0,
            used_idx: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimResource {
    width: u32,
    height: u32,
    backing: bool,
}

struct SimState {
    device_features: u64,
    device_feature_select: u32,
    driver_features: u64,
    driver_feature_select: u32,
    driver_feature_writes: usize,
    msix_config: u16,
    status: u8,
    status_reads: usize,
    stall_reset: bool,
    refuse_features_ok: bool,
    generation: u8,
    generation_reads: usize,
    torn_reads: u32,
    queue_select: u16,
    queues: [SimQueue; SimGpu::NUM_QUEUES],
    queue_max: [u16; SimGpu::NUM_QUEUES],
    isr: u8,
    events_read: u32,
    num_scanouts: u32,
    deferred: bool,
    max_in_flight: [u16; SimGpu::NUM_QUEUES],
    commands: Vec<u32>,
    resources: BTreeMap<u32, SimResource>,
    scanouts: [u32; MAX_SCANOUTS],
    cursor: Option<(u32, u32, u32)>,
}

unsafe fn read_phys<T: Copy>(addr: u64) -> T {
    ptr::read_volatile(addr as usize as *const T)
}

unsafe fn write_phys<T: Copy>(addr: u64, value: T) {
    ptr::write_volatile(addr as usize as *mut T, value)
}

fn set_half(value: &mut u64, high: bool, half: u32) {
    if high {
        *value = (*value & 0xFFFF_FFFF) | ((half as u64) << 32);
    } else {
        *value = (*value & !0xFFFF_FFFF) | half as u64;
    }
}

impl SimState {
    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = 0;
        self.driver_feature_select = 0;
        self.device_feature_select = 0;
        self.queue_select = 0;
        self.queues = [SimQueue::new(); SimGpu::NUM_QUEUES];
        for (queue, &max) in self.queues.iter_mut().zip(&self.queue_max) {
            queue.size = max;
        }
        self.isr = 0;
        self.resources.clear();
        self.scanouts = [0; MAX_SCANOUTS];
    }

    fn selected(&mut self) -> Option<&mut SimQueue> {
        self.queues.get_mut(self.queue_select as usize)
    }

    fn read_common(&mut self, offset: usize) -> u32 {
        let select_half = |value: u64, select: u32| match select {
            0 => value as u32,
            1 => (value >> 32) as u32,
            _ => 0,
        };
        match offset {
            common_cfg::DEVICE_FEATURE_SELECT => self.device_feature_select,
            common_cfg::DEVICE_FEATURE => select_half(self.device_features, self.device_feature_select),
            common_cfg::DRIVER_FEATURE_SELECT => self.driver_feature_select,
            common_cfg::DRIVER_FEATURE => select_half(self.driver_features, self.driver_feature_select),
            common_cfg::MSIX_CONFIG => self.msix_config as u32,
            common_cfg::NUM_QUEUES => SimGpu::NUM_QUEUES as u32,
            common_cfg::DEVICE_STATUS => {
                self.status_reads += 1;
                self.status as u32
            }
            common_cfg::CONFIG_GENERATION => {
                self.generation_reads += 1;
                self.generation as u32
            }
            common_cfg::QUEUE_SELECT => self.queue_select as u32,
            _ => {
                let Some(queue) = self.queues.get(self.queue_select as usize).copied() else {
                    return 0;
                };
                match offset {
                    common_cfg::QUEUE_SIZE => queue.size as u32,
                    common_cfg::QUEUE_MSIX_VECTOR => queue.msix_vector as u32,
                    common_cfg::QUEUE_ENABLE => queue.enabled as u32,
                    common_cfg::QUEUE_NOTIFY_OFF => self.queue_select as u32,
                    0x20 => queue.desc as u32,
                    0x24 => (queue.desc >> 32) as u32,
                    0x28 => queue.driver as u32,
                    0x2C => (queue.driver >> 32) as u32,
                    0x30 => queue.device as u32,
                    0x34 => (queue.device >> 32) as u32,
                    _ => 0,
                }
            }
        }
    }

    fn write_common(&mut self, offset: usize, value: u32) {
        match offset {
            common_cfg::DEVICE_FEATURE_SELECT => self.device_feature_select = value,
            common_cfg::DRIVER_FEATURE_SELECT => self.driver_feature_select = value,
            common_cfg::DRIVER_FEATURE => {
                self.driver_feature_writes += 1;
                match self.driver_feature_select {
                    0 => set_half(&mut self.driver_features, false, value),
                    1 => set_half(&mut self.driver_features, true, value),
                    _ => {}
                }
            }
            common_cfg::MSIX_CONFIG => self.msix_config = value as u16,
            common_cfg::DEVICE_STATUS => self.write_status(value as u8),
            common_cfg::QUEUE_SELECT => self.queue_select = value as u16,
            _ => {
                let Some(queue) = self.selected() else {
                    return;
                };
                match offset {
                    common_cfg::QUEUE_SIZE => queue.size = value as u16,
                    common_cfg::QUEUE_MSIX_VECTOR => queue.msix_vector = value as u16,
                    common_cfg::QUEUE_ENABLE => queue.enabled = value & 1 != 0,
                    0x20 => set_half(&mut queue.desc, false, value),
                    0x24 => set_half(&mut queue.desc, true, value),
                    0x28 => set_half(&mut queue.driver, false, value),
                    0x2C => set_half(&mut queue.driver, true, value),
                    0x30 => set_half(&mut queue.device, false, value),
                    0x34 => set_half(&mut queue.device, true, value),
                    _ => {}
                }
            }
        }
    }

    fn write_status(&mut self, value: u8) {
        if value == 0 {
            if self.stall_reset {
                return;
            }
            self.reset();
            return;
        }
        let mut value = value;
        let features_ok = DeviceStatus::FEATURES_OK.bits();
        if value & features_ok != 0 && self.status & features_ok == 0 {
            let unoffered = self.driver_features & !self.device_features;
            if self.refuse_features_ok || unoffered != 0 {
                value &= !features_ok;
            }
        }
        self.status = value;
    }

    fn read_device_config(&mut self, offset: usize) -> u32 {
        if self.torn_reads > 0 {
            // A concurrent device-side update lands mid-read.
            self.torn_reads -= 1;
            self.generation = self.generation.wrapping_add(1);
            self.num_scanouts += 1;
        }
        match offset {
            gpu_config::EVENTS_READ => self.events_read,
            gpu_config::EVENTS_CLEAR => 0,
            gpu_config::NUM_SCANOUTS => self.num_scanouts,
            gpu_config::NUM_CAPSETS => 0,
            _ => 0,
        }
    }

    fn write_device_config(&mut self, offset: usize, value: u32) {
        if offset == gpu_config::EVENTS_CLEAR {
            self.events_read &= !value;
        }
    }

    /// Consume every available chain of `index`. Returns whether an
    /// interrupt is due.
    fn process_queue(&mut self, index: usize) -> bool {
        let mut queue = self.queues[index];
        if !queue.enabled || self.status & DeviceStatus::DRIVER_OK.bits() == 0 {
            return false;
        }

        fence(Ordering::SeqCst);
        // SAFETY: the driver programmed these addresses to live ring memory.
        let avail_idx: u16 = unsafe { read_phys(queue.driver + 2) };
        let outstanding = avail_idx.wrapping_sub(queue.last_avail);
        self.max_in_flight[index] = self.max_in_flight[index].max(outstanding);
        if outstanding == 0 {
            return false;
        }

        while queue.last_avail != avail_idx {
            fence(Ordering::SeqCst);
            let slot = (queue.last_avail % queue.size) as u64;
            let head: u16 = unsafe { read_phys(queue.driver + 4 + 2 * slot) };

            let mut request = Vec::new();
            let mut writable = Vec::new();
            let mut desc_index = head;
            for _ in 0..queue.size {
                let desc: Descriptor = unsafe { read_phys(queue.desc + 16 * desc_index as u64) };
                if desc.flags & desc_flags::WRITE != 0 {
                    writable.push((desc.addr, desc.len as usize));
                } else {
                    // SAFETY: readable buffers are live driver memory.
                    let bytes = unsafe {
                        core::slice::from_raw_parts(desc.addr as usize as *const u8, desc.len as usize)
                    };
                    request.extend_from_slice(bytes);
                }
                if desc.flags & desc_flags::NEXT == 0 {
                    break;
                }
                desc_index = desc.next;
            }

            let response = if index == 0 {
                self.control_command(&request)
            } else {
                self.cursor_command(&request);
                Vec::new()
            };

            let mut written = 0;
            for (addr, len) in writable {
                let n = len.min(response.len() - written);
                // SAFETY: writable buffers are live driver memory of `len` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(response[written..].as_ptr(), addr as usize as *mut u8, n);
                }
                written += n;
            }

            let used_slot = (queue.used_idx % queue.size) as u64;
            unsafe {
                write_phys(
                    queue.device + 4 + 8 * used_slot,
                    UsedElement {
                        id: head as u32,
                        len: written as u32,
                    },
                );
            }
            fence(Ordering::SeqCst);
            queue.used_idx = queue.used_idx.wrapping_add(1);
            unsafe { write_phys(queue.device + 2, queue.used_idx) };
            queue.last_avail = queue.last_avail.wrapping_add(1);
        }
        self.queues[index] = queue;

        let flags: u16 = unsafe { read_phys(queue.driver) };
        if flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0 {
            self.isr |= isr::QUEUE;
            true
        } else {
            false
        }
    }

    fn control_command(&mut self, request: &[u8]) -> Vec<u8> {
        let Some(hdr) = ControlHeader::from_bytes(request) else {
            return ControlHeader::new(command::RESP_ERR_UNSPEC).as_bytes().to_vec();
        };
        self.commands.push(hdr.hdr_type);

        let status = match hdr.hdr_type {
            command::GET_DISPLAY_INFO => {
                let mut info = RespDisplayInfo {
                    hdr: ControlHeader::new(command::RESP_OK_DISPLAY_INFO),
                    ..RespDisplayInfo::default()
                };
                info.pmodes[0] = DisplayOne {
                    rect: Rect::new(0, 0, 1024, 768),
                    enabled: 1,
                    flags: 0,
                };
                return info.as_bytes().to_vec();
            }
            command::GET_EDID => {
                let mut response = RespEdid {
                    hdr: ControlHeader::new(command::RESP_OK_EDID),
                    size: 128,
                    padding: 0,
                    edid: [0; EDID_BLOB_SIZE],
                };
                response.edid[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
                return response.as_bytes().to_vec();
            }
            command::RESOURCE_CREATE_2D => match ResourceCreate2d::from_bytes(request) {
                Some(req) if req.resource_id != 0 && !self.resources.contains_key(&req.resource_id) => {
                    self.resources.insert(
                        req.resource_id,
                        SimResource {
                            width: req.width,
                            height: req.height,
                            backing: false,
                        },
                    );
                    command::RESP_OK_NODATA
                }
                Some(_) => command::RESP_ERR_INVALID_RESOURCE_ID,
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::RESOURCE_UNREF => match ResourceUnref::from_bytes(request) {
                Some(req) => match self.resources.remove(&req.resource_id) {
                    Some(_) => {
                        for scanout in self.scanouts.iter_mut() {
                            if *scanout == req.resource_id {
                                *scanout = 0;
                            }
                        }
                        command::RESP_OK_NODATA
                    }
                    None => command::RESP_ERR_INVALID_RESOURCE_ID,
                },
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::SET_SCANOUT => match SetScanout::from_bytes(request) {
                Some(req) if req.scanout_id >= self.num_scanouts => command::RESP_ERR_INVALID_SCANOUT_ID,
                Some(req) if req.resource_id == 0 => {
                    self.scanouts[req.scanout_id as usize] = 0;
                    command::RESP_OK_NODATA
                }
                Some(req) => match self.resources.get(&req.resource_id) {
                    Some(res) if req.rect.x + req.rect.width > res.width
                        || req.rect.y + req.rect.height > res.height =>
                    {
                        command::RESP_ERR_INVALID_PARAMETER
                    }
                    Some(_) => {
                        self.scanouts[req.scanout_id as usize] = req.resource_id;
                        command::RESP_OK_NODATA
                    }
                    None => command::RESP_ERR_INVALID_RESOURCE_ID,
                },
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::RESOURCE_FLUSH => match ResourceFlush::from_bytes(request) {
                Some(req) if self.resources.contains_key(&req.resource_id) => command::RESP_OK_NODATA,
                Some(_) => command::RESP_ERR_INVALID_RESOURCE_ID,
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::TRANSFER_TO_HOST_2D => match TransferToHost2d::from_bytes(request) {
                Some(req) => match self.resources.get(&req.resource_id) {
                    Some(res) if res.backing => command::RESP_OK_NODATA,
                    Some(_) => command::RESP_ERR_UNSPEC,
                    None => command::RESP_ERR_INVALID_RESOURCE_ID,
                },
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::RESOURCE_ATTACH_BACKING => match ResourceAttachBacking::from_bytes(request) {
                Some(req) => {
                    let entries_len = req.nr_entries as usize * 16;
                    let header_len = core::mem::size_of::<ResourceAttachBacking>();
                    match self.resources.get_mut(&req.resource_id) {
                        _ if request.len() < header_len + entries_len => command::RESP_ERR_INVALID_PARAMETER,
                        Some(res) if res.backing => command::RESP_ERR_UNSPEC,
                        Some(res) => {
                            res.backing = true;
                            command::RESP_OK_NODATA
                        }
                        None => command::RESP_ERR_INVALID_RESOURCE_ID,
                    }
                }
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            command::RESOURCE_DETACH_BACKING => match ResourceDetachBacking::from_bytes(request) {
                Some(req) => match self.resources.get_mut(&req.resource_id) {
                    Some(res) if res.backing => {
                        res.backing = false;
                        command::RESP_OK_NODATA
                    }
                    Some(_) => command::RESP_ERR_UNSPEC,
                    None => command::RESP_ERR_INVALID_RESOURCE_ID,
                },
                None => command::RESP_ERR_INVALID_PARAMETER,
            },
            _ => command::RESP_ERR_UNSPEC,
        };
        ControlHeader::new(status).as_bytes().to_vec()
    }

    fn cursor_command(&mut self, request: &[u8]) {
        if let Some(message) = UpdateCursor::from_bytes(request) {
            self.cursor = Some((message.pos.scanout_id, message.pos.x, message.pos.y));
        }
    }
}

/// Simulated VirtIO GPU behind one memory BAR.
///
/// BAR layout: common config at 0x0000, ISR at 0x1000, device config at
/// 0x2000, notifications at 0x3000.
pub struct SimGpu {
    state: Mutex<SimState>,
    interrupts: Arc<FakeInterrupts>,
    irq: u8,
}

impl SimGpu {
    pub const NUM_QUEUES: usize = 2;
    pub const QUEUE_MAX: u16 = 256;
    pub const NOTIFY_MULTIPLIER: u32 = 4;
    pub const BAR_SIZE: u64 = 0x4000;
    pub const COMMON: usize = 0x0000;
    pub const ISR: usize = 0x1000;
    pub const DEVICE: usize = 0x2000;
    pub const NOTIFY: usize = 0x3000;

    pub fn new(device_features: u64, interrupts: Arc<FakeInterrupts>, irq: u8) -> Self {
        Self {
            state: Mutex::new(SimState {
                device_features,
                device_feature_select: 0,
                driver_features: 0,
                driver_feature_select: 0,
                driver_feature_writes: 0,
                msix_config: 0,
                status: 0,
                status_reads: 0,
                stall_reset: false,
                refuse_features_ok: false,
                generation: 0,
                generation_reads: 0,
                torn_reads: 0,
                queue_select: 0,
                queues: [SimQueue::new(); Self::NUM_QUEUES],
                queue_max: [Self::QUEUE_MAX; Self::NUM_QUEUES],
                isr: 0,
                events_read: 0,
                num_scanouts: 1,
                deferred: false,
                max_in_flight: [0; Self::NUM_QUEUES],
                commands: Vec::new(),
                resources: BTreeMap::new(),
                scanouts: [0; MAX_SCANOUTS],
                cursor: None,
            }),
            interrupts,
            irq,
        }
    }

    fn read(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        match offset {
            o if o < Self::ISR => state.read_common(o - Self::COMMON),
            o if o < Self::DEVICE => {
                let value = state.isr;
                state.isr = 0;
                value as u32
            }
            o if o < Self::NOTIFY => state.read_device_config(o - Self::DEVICE),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        match offset {
            o if o < Self::ISR => state.write_common(o - Self::COMMON, value),
            o if o < Self::DEVICE => {}
            o if o < Self::NOTIFY => state.write_device_config(o - Self::DEVICE, value),
            _ => {
                let deferred = state.deferred;
                // The interrupt must fire without the device lock held.
                drop(state);
                if !deferred {
                    self.process(value as usize);
                }
            }
        }
    }

    fn process(&self, queue: usize) {
        let raise = {
            let mut state = self.state.lock();
            queue < Self::NUM_QUEUES && state.process_queue(queue)
        };
        if raise {
            self.interrupts.raise(self.irq);
        }
    }

    /// Process every queue, as a deferred device would on its own time.
    pub fn service(&self) {
        let raise = {
            let mut state = self.state.lock();
            let mut raise = false;
            for queue in 0..Self::NUM_QUEUES {
                raise |= state.process_queue(queue);
            }
            raise
        };
        if raise {
            self.interrupts.raise(self.irq);
        }
    }

    /// With `deferred` set, notifications are only acted on by [`service`](Self::service).
    pub fn set_deferred(&self, deferred: bool) {
        self.state.lock().deferred = deferred;
    }

    pub fn refuse_features_ok(&self) {
        self.state.lock().refuse_features_ok = true;
    }

    /// Make the next `count` device-config reads race a device update.
    pub fn tear_config_reads(&self, count: u32) {
        self.state.lock().torn_reads = count;
    }

    /// Signal a display configuration change.
    pub fn raise_display_event(&self) {
        {
            let mut state = self.state.lock();
            state.events_read |= gpu_config::EVENT_DISPLAY;
            state.generation = state.generation.wrapping_add(1);
            state.isr |= isr::CONFIG;
        }
        self.interrupts.raise(self.irq);
    }

    /// Report `max` as the largest size of queue `index` from the next reset on.
    pub fn set_queue_max(&self, index: usize, max: u16) {
        self.state.lock().queue_max[index] = max;
    }

    /// Ignore writes of 0 to the status register.
    pub fn stall_reset(&self) {
        self.state.lock().stall_reset = true;
    }

    /// Enter the NEEDS_RESET state and signal a configuration change.
    pub fn raise_needs_reset(&self) {
        {
            let mut state = self.state.lock();
            state.status |= DeviceStatus::NEEDS_RESET.bits();
            state.isr |= isr::CONFIG;
        }
        self.interrupts.raise(self.irq);
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.state.lock().status)
    }

    /// Reads of the status register so far.
    pub fn status_reads(&self) -> usize {
        self.state.lock().status_reads
    }

    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    pub fn driver_feature_writes(&self) -> usize {
        self.state.lock().driver_feature_writes
    }

    pub fn generation_reads(&self) -> usize {
        self.state.lock().generation_reads
    }

    pub fn queue_enabled(&self, index: usize) -> bool {
        self.state.lock().queues[index].enabled
    }

    /// Descriptor, driver and device areas of an enabled queue.
    pub fn queue_addresses(&self, index: usize) -> Option<(u64, u64, u64)> {
        let queue = self.state.lock().queues[index];
        queue.enabled.then_some((queue.desc, queue.driver, queue.device))
    }

    /// Peak number of chains found outstanding on a queue.
    pub fn max_in_flight(&self, index: u16) -> u16 {
        self.state.lock().max_in_flight[index as usize]
    }

    /// Control commands processed, in order.
    pub fn commands(&self) -> Vec<u32> {
        self.state.lock().commands.clone()
    }

    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// Last cursor position as `(scanout, x, y)`.
    pub fn cursor_position(&self) -> Option<(u32, u32, u32)> {
        self.state.lock().cursor
    }

    pub fn pending_events(&self) -> u32 {
        self.state.lock().events_read
    }
}

/// Register window into a [`SimGpu`] BAR.
struct SimWindow {
    sim: Arc<SimGpu>,
    base: usize,
    len: usize,
}

impl SimWindow {
    fn at(&self, offset: usize, width: usize) -> usize {
        assert!(offset + width <= self.len, "access outside mapped window");
        self.base + offset
    }
}

impl RegisterWindow for SimWindow {
    fn read8(&self, offset: usize) -> u8 {
        self.sim.read(self.at(offset, 1)) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.sim.read(self.at(offset, 2)) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.sim.read(self.at(offset, 4))
    }

    fn write8(&self, offset: usize, value: u8) {
        self.sim.write(self.at(offset, 1), value as u32)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.sim.write(self.at(offset, 2), value as u32)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.sim.write(self.at(offset, 4), value)
    }
}

/// Maps ranges of the simulated BAR.
pub struct SimMapper {
    bar_base: PhysAddr,
    sim: Arc<SimGpu>,
}

impl MmioMapper for SimMapper {
    fn map(&self, phys: PhysAddr, len: usize) -> Option<Arc<dyn RegisterWindow>> {
        let end = phys.checked_add(len as u64)?;
        if phys < self.bar_base || end > self.bar_base + SimGpu::BAR_SIZE {
            return None;
        }
        Some(Arc::new(SimWindow {
            sim: Arc::clone(&self.sim),
            base: (phys - self.bar_base) as usize,
            len,
        }))
    }
}

/// A platform with one simulated GPU at 00:03.0.
pub struct TestPlatform {
    pub platform: Platform,
    pub function: PciFunction,
    pub sim: Arc<SimGpu>,
    pub pages: Arc<HeapPages>,
    pub interrupts: Arc<FakeInterrupts>,
    pub space: Arc<FakeConfigSpace>,
}

impl TestPlatform {
    pub const GPU_ADDRESS: PciAddress = PciAddress::new(0, 3, 0);
    pub const GPU_IRQ: u8 = 11;
    pub const BAR_BASE: u64 = 0xFE00_0000;
    /// Capability offsets in the GPU's configuration space.
    pub const NOTIFY_CAP: u16 = 0x50;
    pub const ISR_CAP: u16 = 0x68;
    pub const DEVICE_CAP: u16 = 0x78;

    pub fn gpu(device_features: u64) -> Self {
        Self::build(device_features, true)
    }

    /// Like [`gpu`](Self::gpu) but without a common configuration capability.
    pub fn gpu_without_common_cfg(device_features: u64) -> Self {
        Self::build(device_features, false)
    }

    /// Rewrite the region length advertised by the capability at `cap`.
    pub fn set_capability_length(&self, cap: u16, length: u32) {
        self.space.set_register32(Self::GPU_ADDRESS, cap + 12, length);
    }

    fn build(device_features: u64, with_common: bool) -> Self {
        let space = Arc::new(FakeConfigSpace::new());
        let addr = Self::GPU_ADDRESS;
        space.add_function(PciAddress::new(0, 0, 0), 0x8086, 0x1237, 0x00);
        space.add_function(addr, crate::config::VIRTIO_VENDOR_ID, 0x1050, 0x00);
        space.set_memory_bar(addr, 4, Self::BAR_BASE, SimGpu::BAR_SIZE, true);
        space.set_interrupt(addr, Self::GPU_IRQ, 1);

        if with_common {
            space.add_virtio_capability(addr, 0x40, ConfigurationType::Common, 4, SimGpu::COMMON as u32, 0x38, None);
        }
        space.add_virtio_capability(
            addr,
            Self::NOTIFY_CAP as u8,
            ConfigurationType::Notify,
            4,
            SimGpu::NOTIFY as u32,
            0x1000,
            Some(SimGpu::NOTIFY_MULTIPLIER),
        );
        space.add_virtio_capability(addr, Self::ISR_CAP as u8, ConfigurationType::Isr, 4, SimGpu::ISR as u32, 4, None);
        space.add_virtio_capability(addr, Self::DEVICE_CAP as u8, ConfigurationType::Device, 4, SimGpu::DEVICE as u32, 16, None);
        space.add_virtio_capability(addr, 0x88, ConfigurationType::Pci, 0, 0, 4, None);

        let interrupts = Arc::new(FakeInterrupts::new());
        let sim = Arc::new(SimGpu::new(device_features, Arc::clone(&interrupts), Self::GPU_IRQ));
        let pages = Arc::new(HeapPages::new());

        let pci = PciBus::new(Arc::clone(&space) as Arc<dyn ConfigAccess>);
        let function = pci.read_function(addr).expect("GPU function");

        let platform = Platform {
            pci,
            pages: Arc::clone(&pages) as Arc<dyn PageAllocator>,
            mmio: Arc::new(SimMapper {
                bar_base: Self::BAR_BASE,
                sim: Arc::clone(&sim),
            }),
            interrupts: Arc::clone(&interrupts) as Arc<dyn InterruptController>,
        };

        Self {
            platform,
            function,
            sim,
            pages,
            interrupts,
            space,
        }
    }
}
