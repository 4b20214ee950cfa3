//! Transport error types.

use core::fmt;

use crate::device::ConfigurationType;

/// Error kinds reported by the VirtIO GPU in a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuError {
    /// VIRTIO_GPU_RESP_ERR_UNSPEC
    Unspecified,
    /// VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY
    OutOfMemory,
    /// VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID
    InvalidScanoutId,
    /// VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID
    InvalidResourceId,
    /// VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID
    InvalidContextId,
    /// VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER
    InvalidParameter,
    /// A response type the command does not expect.
    UnexpectedResponse(u32),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Unspecified => write!(f, "unspecified device error"),
            GpuError::OutOfMemory => write!(f, "host out of memory"),
            GpuError::InvalidScanoutId => write!(f, "invalid scanout id"),
            GpuError::InvalidResourceId => write!(f, "invalid resource id"),
            GpuError::InvalidContextId => write!(f, "invalid context id"),
            GpuError::InvalidParameter => write!(f, "invalid parameter"),
            GpuError::UnexpectedResponse(ty) => write!(f, "unexpected response {:#x}", ty),
        }
    }
}

/// Transport error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device rejected the command (hardware/protocol error).
    Gpu(GpuError),
    /// A pool or queue is momentarily exhausted; retry later.
    WouldBlock,
    /// The page allocator could not provide contiguous pages.
    OutOfMemory,
    /// The GPU resource id space is exhausted for this session.
    ResourceIdsExhausted,
    /// The driver broke the initialization protocol.
    ProtocolViolation(&'static str),
    /// The driver asked for features the device does not offer.
    FeatureNotOffered {
        /// Bits requested but absent from the offer.
        missing: u64,
    },
    /// The device refused the negotiated feature set.
    UnsupportedDevice,
    /// The device instance is marked failed.
    DeviceFailed,
    /// The device is not live yet.
    NotReady,
    /// The operation needs a feature that was not negotiated.
    Unsupported,
    /// A required VirtIO PCI capability is missing.
    MissingCapability(ConfigurationType),
    /// A BAR index is out of range or unimplemented.
    InvalidBar(u8),
    /// The MMIO mapper refused a region.
    MapFailed,
    /// The device does not implement the queue.
    QueueUnavailable(u16),
    /// Queue size is zero, not a power of two, or too large.
    InvalidQueueSize(u16),
    /// A buffer does not fit the space reserved for it.
    BufferTooSmall,
    /// The device did not complete a command within the spin limit.
    Timeout,
    /// The configuration generation never settled.
    ConfigUnstable,
}

impl From<GpuError> for Error {
    fn from(err: GpuError) -> Self {
        Error::Gpu(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Gpu(e) => write!(f, "GPU error: {}", e),
            Error::WouldBlock => write!(f, "resource temporarily exhausted"),
            Error::OutOfMemory => write!(f, "out of contiguous memory"),
            Error::ResourceIdsExhausted => write!(f, "resource ids exhausted"),
            Error::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Error::FeatureNotOffered { missing } => {
                write!(f, "features {:#x} not offered by device", missing)
            }
            Error::UnsupportedDevice => write!(f, "unsupported device"),
            Error::DeviceFailed => write!(f, "device failed"),
            Error::NotReady => write!(f, "device not ready"),
            Error::Unsupported => write!(f, "feature not negotiated"),
            Error::MissingCapability(ty) => write!(f, "missing {:?} capability", ty),
            Error::InvalidBar(index) => write!(f, "invalid BAR{}", index),
            Error::MapFailed => write!(f, "MMIO mapping failed"),
            Error::QueueUnavailable(index) => write!(f, "queue {} unavailable", index),
            Error::InvalidQueueSize(size) => write!(f, "invalid queue size {}", size),
            Error::BufferTooSmall => write!(f, "buffer too small"),
            Error::Timeout => write!(f, "device timed out"),
            Error::ConfigUnstable => write!(f, "configuration generation unstable"),
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = core::result::Result<T, Error>;
