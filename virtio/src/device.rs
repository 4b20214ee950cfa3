//! VirtIO modern PCI transport.
//!
//! A [`VirtioDevice`] owns the register windows of one function (common
//! configuration, notification, ISR, device-specific configuration), its
//! virtqueues, and the device status state machine:
//!
//! ```text
//! Reset -> Acknowledged -> DriverLoaded -> FeaturesNegotiated -> Live
//!                 \______________\_________________\_____________-> Failed
//! ```
//!
//! Device drivers sit on top and implement [`VirtioDriver`] so the
//! interrupt path can hand them queue and configuration events.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::config::{TransportConfig, VIRTIO_MODERN_DEVICE_BASE};
use crate::error::{Error, Result};
use crate::hal::{PageAllocator, PhysAddr, Platform, RegisterWindow};
use crate::pci::{PciDeviceId, PciFunction};
use crate::queue::{desc_flags, Descriptor, VirtQueue};

/// PCI capability ID of vendor-specific capabilities.
pub const PCI_CAP_ID_VENDOR: u8 = 0x09;

/// Byte offsets inside a `virtio_pci_cap`.
mod cap_layout {
    pub const CFG_TYPE: u16 = 3;
    pub const BAR: u16 = 4;
    pub const OFFSET: u16 = 8;
    pub const LENGTH: u16 = 12;
    /// `notify_off_multiplier`, notification capability only.
    pub const NOTIFY_MULTIPLIER: u16 = 16;
}

/// Common configuration register offsets.
pub mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0C;
    pub const MSIX_CONFIG: usize = 0x10;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const CONFIG_GENERATION: usize = 0x15;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_MSIX_VECTOR: usize = 0x1A;
    pub const QUEUE_ENABLE: usize = 0x1C;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
    /// Size of the structure.
    pub const LEN: usize = 0x38;
}

/// ISR status bits. Reading the register clears it.
pub mod isr {
    /// A used ring was updated.
    pub const QUEUE: u8 = 0x1;
    /// The device configuration changed.
    pub const CONFIG: u8 = 0x2;
}

/// Transport feature bits shared by all device types.
pub mod features {
    /// Indirect descriptors.
    pub const RING_INDIRECT_DESC: u64 = 1 << 28;
    /// `used_event` / `avail_event` suppression.
    pub const RING_EVENT_IDX: u64 = 1 << 29;
    /// Modern (1.x) device.
    pub const VERSION_1: u64 = 1 << 32;
}

/// MSI-X vector value meaning "no vector"; interrupts go to INTx.
const NO_VECTOR: u16 = 0xFFFF;

/// Polls allowed for the device to acknowledge a reset.
const RESET_POLL_LIMIT: u32 = 1_000_000;

bitflags! {
    /// `device_status` register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// The guest noticed the device.
        const ACKNOWLEDGE = 1;
        /// The guest has a driver for it.
        const DRIVER = 2;
        /// The driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// The device hit an error it cannot recover from without reset.
        const NEEDS_RESET = 64;
        /// The driver gave up on the device.
        const FAILED = 128;
    }
}

/// `cfg_type` of a VirtIO PCI capability.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
    Pci = 5,
}

impl ConfigurationType {
    fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Common),
            2 => Some(Self::Notify),
            3 => Some(Self::Isr),
            4 => Some(Self::Device),
            5 => Some(Self::Pci),
            _ => None,
        }
    }
}

/// Register window location advertised by a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRegion {
    pub cfg_type: ConfigurationType,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
}

/// Initialization progress of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Reset,
    Acknowledged,
    DriverLoaded,
    FeaturesNegotiated,
    Live,
    Failed,
}

/// VirtIO device type, derived from the PCI device ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Network,
    Block,
    Console,
    Entropy,
    Gpu,
    Input,
    Other(u16),
}

impl DeviceClass {
    /// Classify a VirtIO PCI function. `None` if the ID is not VirtIO.
    pub fn from_pci(id: PciDeviceId) -> Option<Self> {
        if !id.is_virtio() {
            return None;
        }
        let device_type = match id.device_id {
            // Transitional IDs.
            0x1000 => 1,
            0x1001 => 2,
            0x1003 => 3,
            0x1005 => 4,
            0x1000..=0x103F => return Some(DeviceClass::Other(id.device_id)),
            // is_virtio() bounds the modern range.
            modern => modern - VIRTIO_MODERN_DEVICE_BASE,
        };
        Some(match device_type {
            1 => DeviceClass::Network,
            2 => DeviceClass::Block,
            3 => DeviceClass::Console,
            4 => DeviceClass::Entropy,
            16 => DeviceClass::Gpu,
            18 => DeviceClass::Input,
            other => DeviceClass::Other(other),
        })
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Network => write!(f, "network"),
            DeviceClass::Block => write!(f, "block"),
            DeviceClass::Console => write!(f, "console"),
            DeviceClass::Entropy => write!(f, "entropy"),
            DeviceClass::Gpu => write!(f, "gpu"),
            DeviceClass::Input => write!(f, "input"),
            DeviceClass::Other(ty) => write!(f, "type {}", ty),
        }
    }
}

/// One buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: PhysAddr,
    pub len: u32,
    /// The device writes into this buffer.
    pub device_writable: bool,
}

impl Segment {
    /// A buffer the device only reads.
    pub fn readable(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len, device_writable: false }
    }

    /// A buffer the device fills in.
    pub fn writable(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len, device_writable: true }
    }
}

/// A device driver bound to a transport.
///
/// The interrupt path calls into these hooks in interrupt context: they
/// must not block, allocate, or take locks held by thread context while
/// waiting on the device.
pub trait VirtioDriver: Send + Sync {
    /// Device type served by the driver.
    fn class(&self) -> DeviceClass;

    /// The underlying transport.
    fn transport(&self) -> &VirtioDevice;

    /// The device configuration changed.
    fn handle_device_config_change(&self);

    /// The device placed entries on the used ring of `queue_index`.
    fn handle_queue_update(&self, queue_index: u16);
}

/// Modern VirtIO PCI transport for one function.
pub struct VirtioDevice {
    function: PciFunction,
    class: DeviceClass,
    common: Arc<dyn RegisterWindow>,
    notify: Arc<dyn RegisterWindow>,
    notify_multiplier: u32,
    notify_len: usize,
    isr: Arc<dyn RegisterWindow>,
    device_cfg: Option<Arc<dyn RegisterWindow>>,
    device_cfg_len: usize,
    state: InitState,
    /// Set once the device is given up on after reaching `Live`.
    failed: AtomicBool,
    accepted_features: AtomicU64,
    queues: Vec<VirtQueue>,
    config_read_retries: u32,
}

impl VirtioDevice {
    /// Discover the capability regions of `function` and map them.
    ///
    /// Fails if the common, notification or ISR region is missing or too
    /// short. Bus mastering and memory decoding are enabled only once
    /// every region is mapped.
    pub fn probe(platform: &Platform, function: &PciFunction, config: &TransportConfig) -> Result<Self> {
        let class = DeviceClass::from_pci(function.id).ok_or(Error::UnsupportedDevice)?;
        let pci = &platform.pci;
        let addr = function.address;

        let mut vendor_caps = Vec::new();
        pci.for_each_capability(addr, |cap| {
            if cap.id == PCI_CAP_ID_VENDOR {
                vendor_caps.push(cap.offset as u16);
            }
        });

        let mut common = None;
        let mut notify = None;
        let mut isr = None;
        let mut device = None;

        for offset in vendor_caps {
            let raw_type = pci.read8(addr, offset + cap_layout::CFG_TYPE);
            let Some(cfg_type) = ConfigurationType::from_raw(raw_type) else {
                log::debug!("[VirtIO] {} ignoring capability type {}", addr, raw_type);
                continue;
            };
            let region = CapabilityRegion {
                cfg_type,
                bar: pci.read8(addr, offset + cap_layout::BAR),
                offset: pci.read32(addr, offset + cap_layout::OFFSET),
                length: pci.read32(addr, offset + cap_layout::LENGTH),
            };
            if region.bar > 5 {
                log::debug!("[VirtIO] {} capability {:?} has reserved BAR {}", addr, cfg_type, region.bar);
                continue;
            }
            // The first capability of each type is the preferred one.
            match cfg_type {
                ConfigurationType::Common if common.is_none() => common = Some(region),
                ConfigurationType::Notify if notify.is_none() => {
                    let multiplier = pci.read32(addr, offset + cap_layout::NOTIFY_MULTIPLIER);
                    notify = Some((region, multiplier));
                }
                ConfigurationType::Isr if isr.is_none() => isr = Some(region),
                ConfigurationType::Device if device.is_none() => device = Some(region),
                _ => {}
            }
        }

        let common = common.ok_or(Error::MissingCapability(ConfigurationType::Common))?;
        let (notify, notify_multiplier) =
            notify.ok_or(Error::MissingCapability(ConfigurationType::Notify))?;
        let isr = isr.ok_or(Error::MissingCapability(ConfigurationType::Isr))?;

        if (common.length as usize) < common_cfg::LEN {
            log::error!("[VirtIO] {} common config too short ({} bytes)", addr, common.length);
            return Err(Error::MissingCapability(ConfigurationType::Common));
        }
        if isr.length < 1 {
            log::error!("[VirtIO] {} ISR region is empty", addr);
            return Err(Error::MissingCapability(ConfigurationType::Isr));
        }
        if notify.length < 2 {
            log::error!("[VirtIO] {} notify region too short ({} bytes)", addr, notify.length);
            return Err(Error::MissingCapability(ConfigurationType::Notify));
        }

        let map = |region: &CapabilityRegion| -> Result<Arc<dyn RegisterWindow>> {
            let base = pci.bar_address(addr, region.bar)?;
            platform
                .mmio
                .map(base + region.offset as u64, region.length as usize)
                .ok_or(Error::MapFailed)
        };

        let device_cfg = match device {
            Some(ref region) => Some(map(region)?),
            None => None,
        };
        let device_cfg_len = device.map_or(0, |region| region.length as usize);
        let common_window = map(&common)?;
        let notify_window = map(&notify)?;
        let isr_window = map(&isr)?;

        log::info!(
            "[VirtIO] {} {} device: common BAR{}+{:#x}, notify BAR{}+{:#x} (x{}), isr BAR{}+{:#x}",
            addr,
            class,
            common.bar,
            common.offset,
            notify.bar,
            notify.offset,
            notify_multiplier,
            isr.bar,
            isr.offset
        );

        pci.enable_bus_master(addr);
        pci.enable_memory_space(addr);

        Ok(Self {
            function: *function,
            class,
            common: common_window,
            notify: notify_window,
            notify_multiplier,
            notify_len: notify.length as usize,
            isr: isr_window,
            device_cfg,
            device_cfg_len,
            state: InitState::Reset,
            failed: AtomicBool::new(false),
            accepted_features: AtomicU64::new(0),
            queues: Vec::new(),
            config_read_retries: config.config_read_retries.max(1),
        })
    }

    /// The PCI function behind the transport.
    pub fn function(&self) -> &PciFunction {
        &self.function
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Current initialization state.
    pub fn state(&self) -> InitState {
        if self.failed.load(Ordering::Acquire) {
            InitState::Failed
        } else {
            self.state
        }
    }

    /// Raw `device_status` register.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.common.read8(common_cfg::DEVICE_STATUS))
    }

    /// Features accepted during negotiation.
    pub fn accepted_features(&self) -> u64 {
        self.accepted_features.load(Ordering::Acquire)
    }

    /// Whether every bit of `feature` was negotiated.
    pub fn has_feature(&self, feature: u64) -> bool {
        self.accepted_features() & feature == feature
    }

    /// Length of the device-specific configuration window, 0 if absent.
    pub fn device_config_len(&self) -> usize {
        self.device_cfg_len
    }

    /// Queue by index, once set up.
    pub fn queue(&self, index: u16) -> Option<&VirtQueue> {
        self.queues.get(index as usize)
    }

    /// Number of queues set up.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Fail unless the device is live.
    pub fn ensure_live(&self) -> Result<()> {
        match self.state() {
            InitState::Live => Ok(()),
            InitState::Failed => Err(Error::DeviceFailed),
            _ => Err(Error::NotReady),
        }
    }

    /// Give up on the device: set FAILED and refuse further operations.
    pub fn mark_failed(&self, reason: &str) {
        log::error!("[VirtIO] {} marked failed: {}", self.function.address, reason);
        let status = self.status() | DeviceStatus::FAILED;
        self.common.write8(common_cfg::DEVICE_STATUS, status.bits());
        self.failed.store(true, Ordering::Release);
    }

    fn violation(&mut self, what: &'static str) -> Error {
        self.mark_failed(what);
        self.state = InitState::Failed;
        Error::ProtocolViolation(what)
    }

    /// Write zero to the status register and wait for the device to
    /// acknowledge. Drops all queues.
    pub fn reset_device(&mut self) {
        self.common.write8(common_cfg::DEVICE_STATUS, 0);

        let mut polls = 0;
        let mut acknowledged = true;
        while self.common.read8(common_cfg::DEVICE_STATUS) != 0 {
            polls += 1;
            if polls >= RESET_POLL_LIMIT {
                acknowledged = false;
                break;
            }
            spin_loop();
        }

        if !acknowledged {
            if self.queues.is_empty() {
                log::warn!("[VirtIO] {} did not acknowledge reset", self.function.address);
            } else {
                log::error!(
                    "[VirtIO] {} did not acknowledge reset, freeing {} queue(s) anyway",
                    self.function.address,
                    self.queues.len()
                );
            }
        }
        self.queues.clear();
        self.accepted_features.store(0, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        self.state = InitState::Reset;
    }

    /// Set one status bit, enforcing the initialization order.
    ///
    /// Out-of-order requests are a protocol violation: the device is
    /// marked failed and must be reset before another attempt.
    pub fn set_status_bit(&mut self, bit: DeviceStatus) -> Result<()> {
        if self.state() == InitState::Failed {
            return Err(Error::DeviceFailed);
        }

        if bit == DeviceStatus::FAILED {
            self.mark_failed("driver request");
            self.state = InitState::Failed;
            return Ok(());
        }

        let (required, next, violation) = if bit == DeviceStatus::ACKNOWLEDGE {
            (InitState::Reset, InitState::Acknowledged, "ACKNOWLEDGE after reset only")
        } else if bit == DeviceStatus::DRIVER {
            (InitState::Acknowledged, InitState::DriverLoaded, "DRIVER before ACKNOWLEDGE")
        } else if bit == DeviceStatus::FEATURES_OK {
            (InitState::DriverLoaded, InitState::FeaturesNegotiated, "FEATURES_OK before DRIVER")
        } else if bit == DeviceStatus::DRIVER_OK {
            (InitState::FeaturesNegotiated, InitState::Live, "DRIVER_OK before FEATURES_OK")
        } else {
            return Err(self.violation("unexpected status bit"));
        };

        if self.state != required {
            return Err(self.violation(violation));
        }

        let status = self.status() | bit;
        self.common.write8(common_cfg::DEVICE_STATUS, status.bits());
        self.state = next;
        log::trace!("[VirtIO] {} status {:?} -> {:?}", self.function.address, bit, next);
        Ok(())
    }

    /// Read the 64-bit feature set the device offers.
    pub fn device_features(&self) -> u64 {
        self.common.write32(common_cfg::DEVICE_FEATURE_SELECT, 0);
        let low = self.common.read32(common_cfg::DEVICE_FEATURE) as u64;
        self.common.write32(common_cfg::DEVICE_FEATURE_SELECT, 1);
        let high = self.common.read32(common_cfg::DEVICE_FEATURE) as u64;
        low | (high << 32)
    }

    /// Negotiate features.
    ///
    /// `propose` sees the offered set and returns the set to accept. A
    /// proposal that is not a subset of the offer is a driver bug and is
    /// rejected before any feature is written. Returns the accepted set.
    pub fn negotiate_features<F>(&mut self, propose: F) -> Result<u64>
    where
        F: FnOnce(u64) -> u64,
    {
        if self.state() == InitState::Failed {
            return Err(Error::DeviceFailed);
        }
        if self.state != InitState::DriverLoaded {
            return Err(self.violation("feature negotiation before DRIVER"));
        }

        let offered = self.device_features();
        let accepted = propose(offered);
        let missing = accepted & !offered;
        if missing != 0 {
            log::error!(
                "[VirtIO] {} driver requested unoffered features {:#x} (offered {:#x})",
                self.function.address,
                missing,
                offered
            );
            self.mark_failed("features not offered");
            self.state = InitState::Failed;
            return Err(Error::FeatureNotOffered { missing });
        }

        self.common.write32(common_cfg::DRIVER_FEATURE_SELECT, 0);
        self.common.write32(common_cfg::DRIVER_FEATURE, accepted as u32);
        self.common.write32(common_cfg::DRIVER_FEATURE_SELECT, 1);
        self.common.write32(common_cfg::DRIVER_FEATURE, (accepted >> 32) as u32);

        self.set_status_bit(DeviceStatus::FEATURES_OK)?;

        if !self.status().contains(DeviceStatus::FEATURES_OK) {
            log::warn!(
                "[VirtIO] {} refused features {:#x}",
                self.function.address,
                accepted
            );
            self.mark_failed("FEATURES_OK not accepted");
            self.state = InitState::Failed;
            return Err(Error::UnsupportedDevice);
        }

        self.accepted_features.store(accepted, Ordering::Release);
        log::debug!(
            "[VirtIO] {} features offered {:#x}, accepted {:#x}",
            self.function.address,
            offered,
            accepted
        );
        Ok(accepted)
    }

    /// Create and enable one queue per entry of `sizes`.
    ///
    /// Each requested size is clamped to the device maximum and rounded
    /// down to a power of two.
    pub fn setup_queues(&mut self, sizes: &[u16], allocator: &Arc<dyn PageAllocator>) -> Result<()> {
        if self.state() == InitState::Failed {
            return Err(Error::DeviceFailed);
        }
        if self.state != InitState::FeaturesNegotiated {
            return Err(self.violation("queue setup outside negotiation"));
        }

        self.common.write16(common_cfg::MSIX_CONFIG, NO_VECTOR);
        let available = self.common.read16(common_cfg::NUM_QUEUES);

        for (index, &requested) in sizes.iter().enumerate() {
            let index = index as u16;
            if index >= available {
                return Err(Error::QueueUnavailable(index));
            }

            self.common.write16(common_cfg::QUEUE_SELECT, index);
            let max = self.common.read16(common_cfg::QUEUE_SIZE);
            if max == 0 {
                return Err(Error::QueueUnavailable(index));
            }

            let wanted = requested.min(max);
            if wanted == 0 {
                return Err(Error::InvalidQueueSize(requested));
            }
            let size = 1u16 << (15 - wanted.leading_zeros());

            let notify_off = self.common.read16(common_cfg::QUEUE_NOTIFY_OFF);
            let notify_end = notify_off as u64 * self.notify_multiplier as u64 + 2;
            if notify_end > self.notify_len as u64 {
                log::error!(
                    "[VirtIO] {} queue {} notify offset {} outside notify region",
                    self.function.address,
                    index,
                    notify_off
                );
                return Err(Error::QueueUnavailable(index));
            }
            let queue = VirtQueue::new(index, size, notify_off, allocator)?;

            self.common.write16(common_cfg::QUEUE_SIZE, size);
            self.common.write16(common_cfg::QUEUE_MSIX_VECTOR, NO_VECTOR);
            self.common.write64(common_cfg::QUEUE_DESC, queue.descriptor_area());
            self.common.write64(common_cfg::QUEUE_DRIVER, queue.driver_area());
            self.common.write64(common_cfg::QUEUE_DEVICE, queue.device_area());
            self.common.write16(common_cfg::QUEUE_ENABLE, 1);

            log::debug!(
                "[VirtIO] {} queue {}: size {} (max {}), notify_off {}",
                self.function.address,
                index,
                size,
                max,
                notify_off
            );
            self.queues.push(queue);
        }

        Ok(())
    }

    /// Set DRIVER_OK. The device is live afterwards.
    pub fn finish_init(&mut self) -> Result<()> {
        self.set_status_bit(DeviceStatus::DRIVER_OK)?;
        log::info!("[VirtIO] {} {} device live", self.function.address, self.class);
        Ok(())
    }

    /// Run the whole handshake.
    ///
    /// `setup` runs after the queues exist and before DRIVER_OK, for
    /// device-specific preparation. Any failure resets the device, so a
    /// failed initialization leaves it absent rather than half-live.
    pub fn initialize<F, S, T>(
        &mut self,
        propose: F,
        queue_sizes: &[u16],
        allocator: &Arc<dyn PageAllocator>,
        setup: S,
    ) -> Result<T>
    where
        F: FnOnce(u64) -> u64,
        S: FnOnce(&VirtioDevice) -> Result<T>,
    {
        let result = self.handshake(propose, queue_sizes, allocator, setup);
        if let Err(err) = result {
            log::warn!("[VirtIO] {} initialization failed: {}", self.function.address, err);
            self.reset_device();
        }
        result
    }

    fn handshake<F, S, T>(
        &mut self,
        propose: F,
        queue_sizes: &[u16],
        allocator: &Arc<dyn PageAllocator>,
        setup: S,
    ) -> Result<T>
    where
        F: FnOnce(u64) -> u64,
        S: FnOnce(&VirtioDevice) -> Result<T>,
    {
        self.reset_device();
        self.set_status_bit(DeviceStatus::ACKNOWLEDGE)?;
        self.set_status_bit(DeviceStatus::DRIVER)?;
        self.negotiate_features(propose)?;
        self.setup_queues(queue_sizes, allocator)?;
        let prepared = setup(self)?;
        self.finish_init()?;
        Ok(prepared)
    }

    /// Read device-specific configuration consistently.
    ///
    /// `read` runs between two reads of the configuration generation and
    /// is retried until both agree, so a multi-register value is never
    /// torn by a concurrent device update. Offsets read by `read` must
    /// lie within [`device_config_len`](Self::device_config_len).
    pub fn read_config<R, F>(&self, read: F) -> Result<R>
    where
        F: Fn(&dyn RegisterWindow) -> R,
    {
        let window = self
            .device_cfg
            .as_deref()
            .ok_or(Error::MissingCapability(ConfigurationType::Device))?;

        for _ in 0..self.config_read_retries {
            let before = self.common.read8(common_cfg::CONFIG_GENERATION);
            let value = read(window);
            let after = self.common.read8(common_cfg::CONFIG_GENERATION);
            if before == after {
                return Ok(value);
            }
        }

        log::warn!(
            "[VirtIO] {} config generation did not settle after {} reads",
            self.function.address,
            self.config_read_retries
        );
        Err(Error::ConfigUnstable)
    }

    /// Write a 32-bit device-specific configuration register.
    pub fn write_config32(&self, offset: usize, value: u32) -> Result<()> {
        let window = self
            .device_cfg
            .as_deref()
            .ok_or(Error::MissingCapability(ConfigurationType::Device))?;
        if offset.checked_add(4).map_or(true, |end| end > self.device_cfg_len) {
            return Err(Error::BufferTooSmall);
        }
        window.write32(offset, value);
        Ok(())
    }

    /// Tell the device that `queue_index` has new available buffers.
    pub fn notify(&self, queue_index: u16) {
        let Some(queue) = self.queue(queue_index) else {
            return;
        };
        if !queue.device_wants_notify() {
            return;
        }
        let offset = queue.notify_offset() as usize * self.notify_multiplier as usize;
        self.notify.write16(offset, queue_index);
    }

    /// Build a descriptor chain over `segments` and publish it.
    ///
    /// Device-readable segments must precede device-writable ones.
    /// Returns the head descriptor; the caller notifies the device.
    pub fn submit_chain(&self, queue_index: u16, segments: &[Segment]) -> Result<u16> {
        self.ensure_live()?;
        let queue = self
            .queue(queue_index)
            .ok_or(Error::QueueUnavailable(queue_index))?;
        if segments.is_empty() {
            return Err(Error::BufferTooSmall);
        }
        debug_assert!(
            segments
                .windows(2)
                .all(|pair| !pair[0].device_writable || pair[1].device_writable),
            "readable segment after writable one"
        );

        let mut producer = queue.producer();
        if producer.free_count() < segments.len() {
            return Err(Error::WouldBlock);
        }

        let mut indices = Vec::with_capacity(segments.len());
        for _ in segments {
            match producer.alloc_descriptor() {
                Some(index) => indices.push(index),
                None => {
                    for index in indices {
                        producer.free_descriptor(index);
                    }
                    return Err(Error::WouldBlock);
                }
            }
        }

        for (position, segment) in segments.iter().enumerate() {
            let mut flags = 0;
            if segment.device_writable {
                flags |= desc_flags::WRITE;
            }
            let next = match indices.get(position + 1) {
                Some(&next) => {
                    flags |= desc_flags::NEXT;
                    next
                }
                None => 0,
            };
            producer.write_descriptor(
                indices[position],
                Descriptor {
                    addr: segment.addr,
                    len: segment.len,
                    flags,
                    next,
                },
            );
        }

        let head = indices[0];
        producer.make_available(head);
        Ok(head)
    }

    /// Return the descriptors of a completed chain to the free list.
    ///
    /// Returns how many descriptors were freed.
    pub fn reclaim_chain(&self, queue_index: u16, head: u16) -> usize {
        let Some(queue) = self.queue(queue_index) else {
            return 0;
        };
        let mut producer = queue.producer();
        let mut index = head;
        let mut freed = 0;

        loop {
            let desc = producer.read_descriptor(index);
            producer.free_descriptor(index);
            freed += 1;
            if desc.flags & desc_flags::NEXT == 0 || freed >= queue.size() as usize {
                break;
            }
            index = desc.next;
        }

        freed
    }

    /// Demultiplex an interrupt.
    ///
    /// Reads (and so clears) the ISR status. Returns `false` when the
    /// interrupt was not raised by this device.
    pub fn handle_interrupt(&self, driver: &dyn VirtioDriver) -> bool {
        let status = self.isr.read8(0);
        if status == 0 {
            return false;
        }

        #[cfg(feature = "debug-interrupts")]
        log::trace!("[VirtIO] {} ISR {:#04x}", self.function.address, status);

        if status & isr::QUEUE != 0 {
            for queue in &self.queues {
                if queue.has_pending() {
                    driver.handle_queue_update(queue.index());
                }
            }
        }

        if status & isr::CONFIG != 0 {
            if self.status().contains(DeviceStatus::NEEDS_RESET) {
                log::error!("[VirtIO] {} device needs reset", self.function.address);
                self.failed.store(true, Ordering::Release);
            }
            driver.handle_device_config_change();
        }

        true
    }
}

impl Drop for VirtioDevice {
    fn drop(&mut self) {
        // Stop the device before its ring memory is freed.
        self.reset_device();
    }
}

impl fmt::Debug for VirtioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioDevice")
            .field("address", &self.function.address)
            .field("class", &self.class)
            .field("state", &self.state())
            .field("features", &self.accepted_features())
            .field("queues", &self.queues.len())
            .finish()
    }
}
