//! VirtIO GPU driver (2D).
//!
//! Commands travel on the control queue as synchronous request/response
//! transactions: one device-wide lock serializes them, the request and
//! the response area share a reserved scratch DMA buffer, and the caller
//! spins on a completion latched by the control-queue interrupt.
//!
//! Cursor updates go to the cursor queue without waiting. Their buffers
//! come from a typed DMA pool and are reclaimed by polling the next time
//! the cursor is touched; interrupts stay disabled on that queue.

use alloc::vec::Vec;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::{ptr, slice};

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{TransportConfig, GPU_CONTROL_QUEUE, GPU_CURSOR_QUEUE};
use crate::device::{features, ConfigurationType, DeviceClass, Segment, VirtioDevice, VirtioDriver};
use crate::dma::{DmaBufferPool, DmaHandle, DmaObject, DmaObjectPool};
use crate::error::{Error, GpuError, Result};
use crate::hal::{PhysAddr, Platform};
use crate::pci::PciFunction;
use crate::sync::Completion;

/// Device supports 3D (virgl) contexts.
pub const VIRTIO_GPU_F_VIRGL: u64 = 1 << 0;
/// Device can report EDID blobs.
pub const VIRTIO_GPU_F_EDID: u64 = 1 << 1;

/// Scanouts addressable by the protocol.
pub const MAX_SCANOUTS: usize = 16;

/// Largest EDID blob a response carries.
pub const EDID_BLOB_SIZE: usize = 1024;

/// Features the driver can use.
const SUPPORTED_FEATURES: u64 = features::VERSION_1 | VIRTIO_GPU_F_EDID;

/// Descriptors used by one control command.
const COMMAND_SEGMENTS: u16 = 2;

/// Command and response codes.
pub mod command {
    pub const GET_DISPLAY_INFO: u32 = 0x0100;
    pub const RESOURCE_CREATE_2D: u32 = 0x0101;
    pub const RESOURCE_UNREF: u32 = 0x0102;
    pub const SET_SCANOUT: u32 = 0x0103;
    pub const RESOURCE_FLUSH: u32 = 0x0104;
    pub const TRANSFER_TO_HOST_2D: u32 = 0x0105;
    pub const RESOURCE_ATTACH_BACKING: u32 = 0x0106;
    pub const RESOURCE_DETACH_BACKING: u32 = 0x0107;
    pub const GET_EDID: u32 = 0x010A;

    pub const UPDATE_CURSOR: u32 = 0x0300;
    pub const MOVE_CURSOR: u32 = 0x0301;

    pub const RESP_OK_NODATA: u32 = 0x1100;
    pub const RESP_OK_DISPLAY_INFO: u32 = 0x1101;
    pub const RESP_OK_EDID: u32 = 0x1104;

    pub const RESP_ERR_UNSPEC: u32 = 0x1200;
    pub const RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
    pub const RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
    pub const RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
    pub const RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
    pub const RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;
}

/// Device-specific configuration layout.
pub mod gpu_config {
    pub const EVENTS_READ: usize = 0x00;
    pub const EVENTS_CLEAR: usize = 0x04;
    pub const NUM_SCANOUTS: usize = 0x08;
    pub const NUM_CAPSETS: usize = 0x0C;
    /// Size of the configuration structure.
    pub const LEN: usize = 0x10;

    /// Display configuration changed.
    pub const EVENT_DISPLAY: u32 = 1;
}

/// Map a response type to the outcome it reports.
pub fn check_response(hdr_type: u32, expected: u32) -> Result<()> {
    let err = match hdr_type {
        t if t == expected => return Ok(()),
        command::RESP_ERR_UNSPEC => GpuError::Unspecified,
        command::RESP_ERR_OUT_OF_MEMORY => GpuError::OutOfMemory,
        command::RESP_ERR_INVALID_SCANOUT_ID => GpuError::InvalidScanoutId,
        command::RESP_ERR_INVALID_RESOURCE_ID => GpuError::InvalidResourceId,
        command::RESP_ERR_INVALID_CONTEXT_ID => GpuError::InvalidContextId,
        command::RESP_ERR_INVALID_PARAMETER => GpuError::InvalidParameter,
        other => GpuError::UnexpectedResponse(other),
    };
    Err(Error::Gpu(err))
}

/// Plain-old-data structures exchanged with the device.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain no padding, and accept any bit
/// pattern.
pub unsafe trait WireFormat: Copy + 'static {
    /// View the structure as its wire bytes.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: Self is padding-free POD per the trait contract.
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    /// Decode from the front of `bytes`.
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked; any bit pattern is valid.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Header of every control and cursor message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlHeader {
    pub hdr_type: u32,
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub padding: u32,
}

impl ControlHeader {
    pub fn new(hdr_type: u32) -> Self {
        Self {
            hdr_type,
            ..Self::default()
        }
    }
}

/// Rectangle in resource or scanout coordinates.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// One scanout entry of the display info response.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayOne {
    pub rect: Rect,
    pub enabled: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RespDisplayInfo {
    pub hdr: ControlHeader,
    pub pmodes: [DisplayOne; MAX_SCANOUTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCreate2d {
    pub hdr: ControlHeader,
    pub resource_id: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUnref {
    pub hdr: ControlHeader,
    pub resource_id: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetScanout {
    pub hdr: ControlHeader,
    pub rect: Rect,
    pub scanout_id: u32,
    pub resource_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceFlush {
    pub hdr: ControlHeader,
    pub rect: Rect,
    pub resource_id: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferToHost2d {
    pub hdr: ControlHeader,
    pub rect: Rect,
    pub offset: u64,
    pub resource_id: u32,
    pub padding: u32,
}

/// Followed on the wire by `nr_entries` [`MemEntry`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceAttachBacking {
    pub hdr: ControlHeader,
    pub resource_id: u32,
    pub nr_entries: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemEntry {
    pub addr: u64,
    pub length: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceDetachBacking {
    pub hdr: ControlHeader,
    pub resource_id: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GetEdid {
    pub hdr: ControlHeader,
    pub scanout: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RespEdid {
    pub hdr: ControlHeader,
    pub size: u32,
    pub padding: u32,
    pub edid: [u8; EDID_BLOB_SIZE],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPos {
    pub scanout_id: u32,
    pub x: u32,
    pub y: u32,
    pub padding: u32,
}

/// Shared by UPDATE_CURSOR and MOVE_CURSOR.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCursor {
    pub hdr: ControlHeader,
    pub pos: CursorPos,
    pub resource_id: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub padding: u32,
}

// SAFETY: all of these are repr(C), padding-free, integer-only.
unsafe impl WireFormat for ControlHeader {}
unsafe impl WireFormat for Rect {}
unsafe impl WireFormat for DisplayOne {}
unsafe impl WireFormat for RespDisplayInfo {}
unsafe impl WireFormat for ResourceCreate2d {}
unsafe impl WireFormat for ResourceUnref {}
unsafe impl WireFormat for SetScanout {}
unsafe impl WireFormat for ResourceFlush {}
unsafe impl WireFormat for TransferToHost2d {}
unsafe impl WireFormat for ResourceAttachBacking {}
unsafe impl WireFormat for MemEntry {}
unsafe impl WireFormat for ResourceDetachBacking {}
unsafe impl WireFormat for GetEdid {}
unsafe impl WireFormat for RespEdid {}
unsafe impl WireFormat for CursorPos {}
unsafe impl WireFormat for UpdateCursor {}

/// Pixel formats for 2D resources.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    B8G8R8A8Unorm = 1,
    B8G8R8X8Unorm = 2,
    A8R8G8B8Unorm = 3,
    X8R8G8B8Unorm = 4,
    R8G8B8A8Unorm = 67,
    X8B8G8R8Unorm = 68,
    A8B8G8R8Unorm = 121,
    R8G8B8X8Unorm = 134,
}

/// Device-side resource identifier. Never 0, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A guest memory range backing a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingRange {
    pub addr: PhysAddr,
    pub len: u32,
}

impl From<&DmaHandle> for BackingRange {
    fn from(handle: &DmaHandle) -> Self {
        Self {
            addr: handle.phys(),
            len: handle.size() as u32,
        }
    }
}

/// Driver-side view of a resource the device accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Attached guest memory, if any.
    pub backing: Option<Vec<BackingRange>>,
    /// Bit `n` set while bound to scanout `n`.
    pub scanouts: u32,
}

/// Reserved buffer for control-queue transactions.
struct CommandSlot {
    pool: DmaBufferPool,
    scratch: DmaHandle,
}

struct CursorState {
    pool: DmaObjectPool<UpdateCursor>,
    in_flight: Vec<(u16, DmaObject<UpdateCursor>)>,
}

/// VirtIO GPU device.
pub struct GpuDevice {
    transport: VirtioDevice,
    config: TransportConfig,
    command: Mutex<CommandSlot>,
    control_done: Completion,
    cursor: Mutex<CursorState>,
    resources: Mutex<HashMap<ResourceId, Resource>>,
    next_resource_id: AtomicU32,
    num_scanouts: u32,
    display_changed: AtomicBool,
}

impl GpuDevice {
    /// Probe and initialize the GPU behind `function`.
    ///
    /// On failure the device is left reset.
    pub fn initialize(platform: &Platform, function: &PciFunction, config: TransportConfig) -> Result<Self> {
        let mut transport = VirtioDevice::probe(platform, function, &config)?;
        if transport.class() != DeviceClass::Gpu {
            return Err(Error::UnsupportedDevice);
        }
        if transport.device_config_len() < gpu_config::LEN {
            log::error!(
                "[VirtIO-GPU] {} config region too short ({} bytes)",
                function.address,
                transport.device_config_len()
            );
            return Err(Error::MissingCapability(ConfigurationType::Device));
        }

        let pages = &platform.pages;
        let (num_scanouts, command, cursor) = transport.initialize(
            |offered| offered & SUPPORTED_FEATURES,
            &[config.control_queue_size, config.cursor_queue_size],
            pages,
            |transport| {
                // Every control command is a request and a response segment.
                let control_size = transport.queue(GPU_CONTROL_QUEUE).map_or(0, |queue| queue.size());
                if control_size < COMMAND_SEGMENTS {
                    return Err(Error::InvalidQueueSize(control_size));
                }

                let num_scanouts =
                    transport.read_config(|cfg| cfg.read32(gpu_config::NUM_SCANOUTS))?;
                let num_scanouts = num_scanouts.min(MAX_SCANOUTS as u32);

                let pool = DmaBufferPool::new(pages, config.scratch_buffer_size, 1, "virtio-gpu-cmd")?;
                let scratch = pool.acquire()?;
                let cursor_pool =
                    DmaObjectPool::new(pages, UpdateCursor::default(), "virtio-gpu-cursor")?;

                if let Some(queue) = transport.queue(GPU_CURSOR_QUEUE) {
                    queue.disable_interrupts();
                }

                Ok((
                    num_scanouts,
                    CommandSlot { pool, scratch },
                    CursorState {
                        pool: cursor_pool,
                        in_flight: Vec::new(),
                    },
                ))
            },
        )?;

        log::info!(
            "[VirtIO-GPU] {} ready: {} scanout(s), features {:#x}",
            function.address,
            num_scanouts,
            transport.accepted_features()
        );

        Ok(Self {
            transport,
            config,
            command: Mutex::new(command),
            control_done: Completion::new(),
            cursor: Mutex::new(cursor),
            resources: Mutex::new(HashMap::new()),
            next_resource_id: AtomicU32::new(1),
            num_scanouts,
            display_changed: AtomicBool::new(false),
        })
    }

    /// Scanouts reported by the device.
    pub fn num_scanouts(&self) -> u32 {
        self.num_scanouts
    }

    /// Whether the device offered and we accepted EDID support.
    pub fn has_edid(&self) -> bool {
        self.transport.has_feature(VIRTIO_GPU_F_EDID)
    }

    /// Consume a pending display-change event.
    pub fn take_display_event(&self) -> bool {
        self.display_changed.swap(false, Ordering::AcqRel)
    }

    /// Snapshot of a resource's bookkeeping.
    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.resources.lock().get(&id).cloned()
    }

    /// Number of live resources.
    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    /// Send one control command and wait for its response.
    ///
    /// The request (`request` followed by `payload`) and the response
    /// area sit back to back in the scratch buffer. Only one command is
    /// ever in flight.
    pub fn synchronous_command<Req, Resp>(&self, request: &Req, payload: &[u8], expected: u32) -> Result<Resp>
    where
        Req: WireFormat,
        Resp: WireFormat,
    {
        self.transport.ensure_live()?;

        let request_len = size_of::<Req>() + payload.len();
        let response_len = size_of::<Resp>();

        let slot = self.command.lock();
        if request_len + response_len > slot.scratch.size() {
            return Err(Error::BufferTooSmall);
        }

        slot.pool.write(&slot.scratch, 0, request.as_bytes());
        slot.pool.write(&slot.scratch, size_of::<Req>(), payload);
        slot.pool.fill(&slot.scratch, request_len, response_len, 0);

        let base = slot.scratch.phys();
        let segments = [
            Segment::readable(base, request_len as u32),
            Segment::writable(base + request_len as u64, response_len as u32),
        ];

        self.control_done.arm();
        let head = self.transport.submit_chain(GPU_CONTROL_QUEUE, &segments)?;
        self.transport.notify(GPU_CONTROL_QUEUE);

        let used = match self.control_done.wait(self.config.command_spin_limit) {
            Ok(used) => used,
            Err(err) => {
                // The device still owns the chain and the scratch buffer.
                self.transport.mark_failed("command timed out");
                return Err(err);
            }
        };
        if used != head as u32 {
            log::warn!("[VirtIO-GPU] completion for head {} while waiting on {}", used, head);
        }
        self.transport.reclaim_chain(GPU_CONTROL_QUEUE, head);

        let mut response = alloc::vec![0u8; response_len];
        slot.pool.read(&slot.scratch, request_len, &mut response);
        drop(slot);

        let header = ControlHeader::from_bytes(&response).ok_or(Error::BufferTooSmall)?;
        if let Err(err) = check_response(header.hdr_type, expected) {
            let sent = ControlHeader::from_bytes(request.as_bytes()).map_or(0, |hdr| hdr.hdr_type);
            log::debug!("[VirtIO-GPU] command {:#x} failed: {}", sent, err);
            return Err(err);
        }
        Resp::from_bytes(&response).ok_or(Error::BufferTooSmall)
    }

    fn command_nodata<Req: WireFormat>(&self, request: &Req, payload: &[u8]) -> Result<()> {
        self.synchronous_command::<Req, ControlHeader>(request, payload, command::RESP_OK_NODATA)
            .map(|_| ())
    }

    fn allocate_resource_id(&self) -> Result<ResourceId> {
        self.next_resource_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(1))
            .map(ResourceId)
            .map_err(|_| Error::ResourceIdsExhausted)
    }

    /// Current scanout configuration: `(scanout, rect)` per enabled one.
    pub fn display_info(&self) -> Result<Vec<(u32, Rect)>> {
        let request = ControlHeader::new(command::GET_DISPLAY_INFO);
        let info: RespDisplayInfo =
            self.synchronous_command(&request, &[], command::RESP_OK_DISPLAY_INFO)?;

        Ok(info
            .pmodes
            .iter()
            .enumerate()
            .take(self.num_scanouts as usize)
            .filter(|(_, mode)| mode.enabled != 0)
            .map(|(index, mode)| (index as u32, mode.rect))
            .collect())
    }

    /// EDID blob of `scanout`. Needs the EDID feature.
    pub fn edid(&self, scanout: u32) -> Result<Vec<u8>> {
        if !self.has_edid() {
            return Err(Error::Unsupported);
        }
        let request = GetEdid {
            hdr: ControlHeader::new(command::GET_EDID),
            scanout,
            padding: 0,
        };
        let response: RespEdid = self.synchronous_command(&request, &[], command::RESP_OK_EDID)?;
        let len = (response.size as usize).min(EDID_BLOB_SIZE);
        Ok(response.edid[..len].to_vec())
    }

    /// Create a 2D resource on the host.
    pub fn create_resource_2d(&self, format: PixelFormat, width: u32, height: u32) -> Result<ResourceId> {
        let id = self.allocate_resource_id()?;
        let request = ResourceCreate2d {
            hdr: ControlHeader::new(command::RESOURCE_CREATE_2D),
            resource_id: id.raw(),
            format: format as u32,
            width,
            height,
        };
        self.command_nodata(&request, &[])?;

        self.resources.lock().insert(
            id,
            Resource {
                format,
                width,
                height,
                backing: None,
                scanouts: 0,
            },
        );
        log::debug!("[VirtIO-GPU] resource {} created: {}x{} {:?}", id.raw(), width, height, format);
        Ok(id)
    }

    /// Attach guest memory as the resource's backing store.
    pub fn attach_backing(&self, id: ResourceId, ranges: &[BackingRange]) -> Result<()> {
        let request = ResourceAttachBacking {
            hdr: ControlHeader::new(command::RESOURCE_ATTACH_BACKING),
            resource_id: id.raw(),
            nr_entries: ranges.len() as u32,
        };
        let mut payload = Vec::with_capacity(ranges.len() * size_of::<MemEntry>());
        for range in ranges {
            let entry = MemEntry {
                addr: range.addr,
                length: range.len,
                padding: 0,
            };
            payload.extend_from_slice(entry.as_bytes());
        }
        self.command_nodata(&request, &payload)?;

        if let Some(resource) = self.resources.lock().get_mut(&id) {
            resource.backing = Some(ranges.to_vec());
        }
        Ok(())
    }

    /// Detach the backing store; returns the ranges that were attached.
    pub fn detach_backing(&self, id: ResourceId) -> Result<Vec<BackingRange>> {
        let request = ResourceDetachBacking {
            hdr: ControlHeader::new(command::RESOURCE_DETACH_BACKING),
            resource_id: id.raw(),
            padding: 0,
        };
        self.command_nodata(&request, &[])?;

        Ok(self
            .resources
            .lock()
            .get_mut(&id)
            .and_then(|resource| resource.backing.take())
            .unwrap_or_default())
    }

    /// Bind `resource` to `scanout_id`, or disable the scanout with `None`.
    pub fn set_scanout(&self, scanout_id: u32, resource: Option<ResourceId>, rect: Rect) -> Result<()> {
        let request = SetScanout {
            hdr: ControlHeader::new(command::SET_SCANOUT),
            rect,
            scanout_id,
            resource_id: resource.map_or(0, ResourceId::raw),
        };
        self.command_nodata(&request, &[])?;

        let mut resources = self.resources.lock();
        if scanout_id < u32::BITS {
            let bit = 1u32 << scanout_id;
            for record in resources.values_mut() {
                record.scanouts &= !bit;
            }
            if let Some(record) = resource.and_then(|id| resources.get_mut(&id)) {
                record.scanouts |= bit;
            }
        }
        Ok(())
    }

    /// Copy `rect` from the backing store into the host resource.
    pub fn transfer_to_host_2d(&self, id: ResourceId, rect: Rect, offset: u64) -> Result<()> {
        let request = TransferToHost2d {
            hdr: ControlHeader::new(command::TRANSFER_TO_HOST_2D),
            rect,
            offset,
            resource_id: id.raw(),
            padding: 0,
        };
        self.command_nodata(&request, &[])
    }

    /// Present `rect` of the resource on every scanout it is bound to.
    pub fn flush_resource(&self, id: ResourceId, rect: Rect) -> Result<()> {
        let request = ResourceFlush {
            hdr: ControlHeader::new(command::RESOURCE_FLUSH),
            rect,
            resource_id: id.raw(),
            padding: 0,
        };
        self.command_nodata(&request, &[])
    }

    /// Unreference the resource on the device, then forget it.
    pub fn delete_resource(&self, id: ResourceId) -> Result<()> {
        let request = ResourceUnref {
            hdr: ControlHeader::new(command::RESOURCE_UNREF),
            resource_id: id.raw(),
            padding: 0,
        };
        self.command_nodata(&request, &[])?;
        self.resources.lock().remove(&id);
        log::debug!("[VirtIO-GPU] resource {} destroyed", id.raw());
        Ok(())
    }

    /// Set the cursor image to `resource` (64x64) at `pos`.
    pub fn update_cursor(&self, pos: CursorPos, resource: Option<ResourceId>, hot_x: u32, hot_y: u32) -> Result<()> {
        self.cursor_command(UpdateCursor {
            hdr: ControlHeader::new(command::UPDATE_CURSOR),
            pos,
            resource_id: resource.map_or(0, ResourceId::raw),
            hot_x,
            hot_y,
            padding: 0,
        })
    }

    /// Move the cursor without changing its image.
    pub fn move_cursor(&self, pos: CursorPos) -> Result<()> {
        self.cursor_command(UpdateCursor {
            hdr: ControlHeader::new(command::MOVE_CURSOR),
            pos,
            ..UpdateCursor::default()
        })
    }

    fn cursor_command(&self, message: UpdateCursor) -> Result<()> {
        self.transport.ensure_live()?;

        let mut cursor = self.cursor.lock();
        self.reap_cursor(&mut cursor);

        let object = cursor.pool.try_acquire().ok_or(Error::WouldBlock)?;
        cursor.pool.write(&object, message);

        let segment = Segment::readable(object.phys(), size_of::<UpdateCursor>() as u32);
        match self.transport.submit_chain(GPU_CURSOR_QUEUE, &[segment]) {
            Ok(head) => {
                cursor.in_flight.push((head, object));
                self.transport.notify(GPU_CURSOR_QUEUE);
                Ok(())
            }
            Err(err) => {
                cursor.pool.release(object);
                Err(err)
            }
        }
    }

    /// Recycle cursor messages the device has consumed.
    fn reap_cursor(&self, cursor: &mut CursorState) {
        let Some(queue) = self.transport.queue(GPU_CURSOR_QUEUE) else {
            return;
        };
        while let Some(used) = queue.pop_used() {
            let head = used.id as u16;
            self.transport.reclaim_chain(GPU_CURSOR_QUEUE, head);
            match cursor.in_flight.iter().position(|(h, _)| *h == head) {
                Some(position) => {
                    let (_, object) = cursor.in_flight.swap_remove(position);
                    cursor.pool.release(object);
                }
                None => log::warn!("[VirtIO-GPU] cursor completion for unknown head {}", head),
            }
        }
    }
}

impl VirtioDriver for GpuDevice {
    fn class(&self) -> DeviceClass {
        DeviceClass::Gpu
    }

    fn transport(&self) -> &VirtioDevice {
        &self.transport
    }

    fn handle_device_config_change(&self) {
        match self.transport.read_config(|cfg| cfg.read32(gpu_config::EVENTS_READ)) {
            Ok(events) => {
                if events & gpu_config::EVENT_DISPLAY != 0 {
                    self.display_changed.store(true, Ordering::Release);
                }
                if events != 0 {
                    // Cannot fail: read_config just proved the window exists.
                    let _ = self.transport.write_config32(gpu_config::EVENTS_CLEAR, events);
                }
            }
            Err(err) => log::warn!("[VirtIO-GPU] config change unreadable: {}", err),
        }
    }

    fn handle_queue_update(&self, queue_index: u16) {
        // The cursor queue is reaped by its submitters.
        if queue_index != GPU_CONTROL_QUEUE {
            return;
        }
        let Some(queue) = self.transport.queue(GPU_CONTROL_QUEUE) else {
            return;
        };
        while let Some(used) = queue.pop_used() {
            self.control_done.complete(used.id);
        }
    }
}
