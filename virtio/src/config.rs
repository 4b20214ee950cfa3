//! Transport configuration.
//!
//! Compile-time constants shared by every layer, plus the runtime
//! [`TransportConfig`] handed to the registry at boot.

/// Page size (4 KB). DMA regions and the used ring are aligned to this.
pub const PAGE_SIZE: usize = 4096;

/// PCI vendor ID shared by every VirtIO device.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// First modern (non-transitional) VirtIO PCI device ID; the VirtIO
/// device type is added to it.
pub const VIRTIO_MODERN_DEVICE_BASE: u16 = 0x1040;

/// Largest queue size allowed by the split-queue format.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Queue index of the GPU control queue.
pub const GPU_CONTROL_QUEUE: u16 = 0;

/// Queue index of the GPU cursor queue.
pub const GPU_CURSOR_QUEUE: u16 = 1;

/// Runtime tunables for the transport and the GPU driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Requested control queue size (clamped to the device maximum).
    pub control_queue_size: u16,
    /// Requested cursor queue size (clamped to the device maximum).
    pub cursor_queue_size: u16,
    /// Size of the scratch DMA buffer used by synchronous commands.
    pub scratch_buffer_size: usize,
    /// Upper bound on spin iterations while waiting for a command.
    ///
    /// `None` waits for the device indefinitely.
    pub command_spin_limit: Option<u64>,
    /// Attempts at a generation-consistent configuration read.
    pub config_read_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            control_queue_size: 64,
            cursor_queue_size: 16,
            scratch_buffer_size: PAGE_SIZE,
            command_spin_limit: None,
            config_read_retries: 64,
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}
