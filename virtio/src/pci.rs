//! PCI (Peripheral Component Interconnect) bus access.
//!
//! This module provides configuration space access, bus enumeration and
//! Base Address Register (BAR) decoding.
//!
//! # PCI Configuration Space
//!
//! Devices expose a 256-byte (PCIe: 4 KB) configuration space. Raw
//! dword access goes through a [`ConfigAccess`] implementation:
//! [`PortIoAccess`] uses Configuration Mechanism #1 (ports 0xCF8/0xCFC);
//! an ECAM mapper can implement the same trait for extended space.
//!
//! # Bus Topology
//!
//! - Segment: PCIe host bridge domain (0 for port I/O)
//! - Bus (0-255)
//! - Device/slot (0-31)
//! - Function (0-7)

use core::fmt;
use spin::Mutex;

use crate::config::VIRTIO_VENDOR_ID;
use crate::error::{Error, Result};

/// Configuration space register offsets.
pub mod regs {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const COMMAND: u16 = 0x04;
    pub const STATUS: u16 = 0x06;
    pub const CLASS_REVISION: u16 = 0x08;
    pub const HEADER_TYPE: u16 = 0x0E;
    pub const BAR0: u16 = 0x10;
    pub const SECONDARY_BUS: u16 = 0x19;
    pub const CAPABILITIES_POINTER: u16 = 0x34;
    pub const INTERRUPT_LINE: u16 = 0x3C;
    pub const INTERRUPT_PIN: u16 = 0x3D;
}

/// Command register bits.
pub mod command {
    pub const IO_SPACE: u16 = 0x01;
    pub const MEMORY_SPACE: u16 = 0x02;
    pub const BUS_MASTER: u16 = 0x04;
}

/// Status register bit: capability list present.
const STATUS_CAPABILITIES: u16 = 0x10;

/// Vendor ID read from an empty slot.
const ABSENT_VENDOR: u16 = 0xFFFF;

/// Upper bound on capability list entries (48 dwords fit in 192 bytes).
const MAX_CAPABILITIES: usize = 48;

/// PCI function address (Segment:Bus:Device.Function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Create a new address on segment 0.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self::with_segment(0, bus, device, function)
    }

    /// Create a new address on an explicit segment.
    pub const fn with_segment(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32, "Device must be 0-31");
        debug_assert!(function < 8, "Function must be 0-7");
        Self { segment, bus, device, function }
    }

    /// Convert to a Mechanism #1 configuration address.
    fn to_config_address(&self, offset: u16) -> u32 {
        debug_assert!(offset & 0x3 == 0, "Offset must be 4-byte aligned");

        (1 << 31) // Enable bit
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// Vendor/device pair used to match drivers to functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

impl PciDeviceId {
    /// Whether this is a VirtIO function (transitional or modern ID).
    pub fn is_virtio(&self) -> bool {
        self.vendor_id == VIRTIO_VENDOR_ID && (0x1000..=0x107F).contains(&self.device_id)
    }
}

impl fmt::Display for PciDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.device_id)
    }
}

/// PCI device header types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderType {
    /// Standard device (Type 0).
    Standard = 0x00,
    /// PCI-to-PCI bridge (Type 1).
    PciBridge = 0x01,
    /// CardBus bridge (Type 2).
    CardBusBridge = 0x02,
    /// Unknown header type.
    Unknown = 0xFF,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0x7F {
            0x00 => HeaderType::Standard,
            0x01 => HeaderType::PciBridge,
            0x02 => HeaderType::CardBusBridge,
            _ => HeaderType::Unknown,
        }
    }
}

/// A present function discovered during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciFunction {
    pub address: PciAddress,
    pub id: PciDeviceId,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: HeaderType,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
}

impl fmt::Display for PciFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} class={:02x}:{:02x}:{:02x} {}",
            self.address,
            self.id,
            self.class,
            self.subclass,
            self.prog_if,
            if self.id.is_virtio() { "(VirtIO)" } else { "" }
        )
    }
}

/// A capability list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Capability ID.
    pub id: u8,
    /// Offset of the capability header in configuration space.
    pub offset: u8,
}

/// Decoded Base Address Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    /// I/O port window.
    Io { port: u32 },
    /// Memory window.
    Memory { address: u64, is_64bit: bool, prefetchable: bool },
}

impl Bar {
    /// Base address of the window.
    pub fn address(&self) -> u64 {
        match *self {
            Bar::Io { port } => port as u64,
            Bar::Memory { address, .. } => address,
        }
    }
}

/// Raw 32-bit configuration space access.
pub trait ConfigAccess: Send + Sync {
    /// Read the aligned dword at `offset`.
    fn read32(&self, address: PciAddress, offset: u16) -> u32;
    /// Write the aligned dword at `offset`.
    fn write32(&self, address: PciAddress, offset: u16, value: u32);
}

/// Configuration Mechanism #1 via I/O ports 0xCF8/0xCFC.
#[cfg(target_arch = "x86_64")]
pub struct PortIoAccess {
    lock: Mutex<()>,
}

#[cfg(target_arch = "x86_64")]
impl PortIoAccess {
    /// PCI configuration space I/O ports.
    const CONFIG_ADDRESS: u16 = 0xCF8;
    const CONFIG_DATA: u16 = 0xCFC;

    /// # Safety
    ///
    /// The caller must own the configuration ports (ring 0, no other
    /// user of 0xCF8/0xCFC outside this instance).
    pub const unsafe fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigAccess for PortIoAccess {
    fn read32(&self, address: PciAddress, offset: u16) -> u32 {
        debug_assert!(address.segment == 0 && offset < 0x100);
        use x86_64::instructions::port::Port;

        let _guard = self.lock.lock();
        unsafe {
            let mut addr_port: Port<u32> = Port::new(Self::CONFIG_ADDRESS);
            let mut data_port: Port<u32> = Port::new(Self::CONFIG_DATA);
            addr_port.write(address.to_config_address(offset));
            data_port.read()
        }
    }

    fn write32(&self, address: PciAddress, offset: u16, value: u32) {
        debug_assert!(address.segment == 0 && offset < 0x100);
        use x86_64::instructions::port::Port;

        let _guard = self.lock.lock();
        unsafe {
            let mut addr_port: Port<u32> = Port::new(Self::CONFIG_ADDRESS);
            let mut data_port: Port<u32> = Port::new(Self::CONFIG_DATA);
            addr_port.write(address.to_config_address(offset));
            data_port.write(value);
        }
    }
}

/// PCI bus front end over a [`ConfigAccess`].
pub struct PciBus {
    access: alloc::sync::Arc<dyn ConfigAccess>,
    /// Serializes BAR sizing, which temporarily clobbers the BAR.
    probe_lock: Mutex<()>,
}

impl PciBus {
    pub fn new(access: alloc::sync::Arc<dyn ConfigAccess>) -> Self {
        Self {
            access,
            probe_lock: Mutex::new(()),
        }
    }

    /// Read a 32-bit value from configuration space.
    pub fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        self.access.read32(addr, offset & !0x3)
    }

    /// Read a 16-bit value from configuration space.
    pub fn read16(&self, addr: PciAddress, offset: u16) -> u16 {
        let value = self.read32(addr, offset);
        ((value >> ((offset & 0x2) * 8)) & 0xFFFF) as u16
    }

    /// Read an 8-bit value from configuration space.
    pub fn read8(&self, addr: PciAddress, offset: u16) -> u8 {
        let value = self.read32(addr, offset);
        ((value >> ((offset & 0x3) * 8)) & 0xFF) as u8
    }

    /// Write a 32-bit value to configuration space.
    pub fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        self.access.write32(addr, offset & !0x3, value);
    }

    /// Write a 16-bit value to configuration space.
    pub fn write16(&self, addr: PciAddress, offset: u16, value: u16) {
        let aligned_offset = offset & !0x3;
        let shift = (offset & 0x2) * 8;

        let mut current = self.read32(addr, aligned_offset);
        current &= !(0xFFFF << shift);
        current |= (value as u32) << shift;

        self.write32(addr, aligned_offset, current);
    }

    /// Write an 8-bit value to configuration space.
    pub fn write8(&self, addr: PciAddress, offset: u16, value: u8) {
        let aligned_offset = offset & !0x3;
        let shift = (offset & 0x3) * 8;

        let mut current = self.read32(addr, aligned_offset);
        current &= !(0xFF << shift);
        current |= (value as u32) << shift;

        self.write32(addr, aligned_offset, current);
    }

    /// Check if a function exists at the given address.
    fn function_exists(&self, addr: PciAddress) -> bool {
        self.read16(addr, regs::VENDOR_ID) != ABSENT_VENDOR
    }

    /// Check if a device is multi-function.
    fn is_multifunction(&self, addr: PciAddress) -> bool {
        (self.read8(addr, regs::HEADER_TYPE) & 0x80) != 0
    }

    /// Read function information from configuration space.
    pub fn read_function(&self, addr: PciAddress) -> Option<PciFunction> {
        let vendor_id = self.read16(addr, regs::VENDOR_ID);
        if vendor_id == ABSENT_VENDOR {
            return None;
        }

        let class_reg = self.read32(addr, regs::CLASS_REVISION);

        Some(PciFunction {
            address: addr,
            id: PciDeviceId {
                vendor_id,
                device_id: self.read16(addr, regs::DEVICE_ID),
            },
            class: (class_reg >> 24) as u8,
            subclass: (class_reg >> 16) as u8,
            prog_if: (class_reg >> 8) as u8,
            revision: class_reg as u8,
            header_type: HeaderType::from(self.read8(addr, regs::HEADER_TYPE)),
            interrupt_line: self.read8(addr, regs::INTERRUPT_LINE),
            interrupt_pin: self.read8(addr, regs::INTERRUPT_PIN),
        })
    }

    /// Visit every present function on every reachable bus of `segment`.
    ///
    /// Bridges are followed into their secondary bus; each bus is
    /// scanned at most once even if bridges are misprogrammed.
    pub fn enumerate_segment<F: FnMut(&PciFunction)>(&self, segment: u16, mut visit: F) {
        let mut scanned = [false; 256];

        // Check if multiple PCI host controllers exist
        let host_addr = PciAddress::with_segment(segment, 0, 0, 0);
        if !self.function_exists(host_addr) {
            return;
        }
        if self.is_multifunction(host_addr) {
            for function in 0..8 {
                let addr = PciAddress::with_segment(segment, 0, 0, function);
                if self.function_exists(addr) {
                    self.scan_bus(segment, function, &mut scanned, &mut visit);
                }
            }
        } else {
            self.scan_bus(segment, 0, &mut scanned, &mut visit);
        }
    }

    /// Visit every present function on segment 0.
    pub fn enumerate<F: FnMut(&PciFunction)>(&self, visit: F) {
        self.enumerate_segment(0, visit);
    }

    fn scan_bus<F: FnMut(&PciFunction)>(
        &self,
        segment: u16,
        bus: u8,
        scanned: &mut [bool; 256],
        visit: &mut F,
    ) {
        if scanned[bus as usize] {
            log::warn!("[PCI] bus {:02x} reached twice, skipping", bus);
            return;
        }
        scanned[bus as usize] = true;

        for device in 0..32 {
            let addr = PciAddress::with_segment(segment, bus, device, 0);
            if !self.function_exists(addr) {
                continue;
            }

            let functions = if self.is_multifunction(addr) { 8 } else { 1 };
            for function in 0..functions {
                let func_addr = PciAddress::with_segment(segment, bus, device, function);
                let Some(func) = self.read_function(func_addr) else {
                    continue;
                };

                log::debug!("[PCI] {}", func);
                visit(&func);

                // Check for PCI-to-PCI bridge
                if func.header_type == HeaderType::PciBridge {
                    let secondary_bus = self.read8(func_addr, regs::SECONDARY_BUS);
                    if secondary_bus != 0 {
                        self.scan_bus(segment, secondary_bus, scanned, visit);
                    }
                }
            }
        }
    }

    fn bar_offset(addr: PciAddress, index: u8) -> Result<u16> {
        if index >= 6 {
            log::error!("[PCI] {} BAR{} out of range", addr, index);
            return Err(Error::InvalidBar(index));
        }
        Ok(regs::BAR0 + index as u16 * 4)
    }

    /// Decode the address programmed into BAR `index`.
    pub fn bar(&self, addr: PciAddress, index: u8) -> Result<Bar> {
        let offset = Self::bar_offset(addr, index)?;
        let raw = self.read32(addr, offset);

        if raw & 0x1 != 0 {
            return Ok(Bar::Io { port: raw & !0x3 });
        }

        let is_64bit = ((raw >> 1) & 0x3) == 0x2;
        let prefetchable = raw & 0x8 != 0;
        let mut address = (raw & !0xF) as u64;
        if is_64bit {
            if index == 5 {
                return Err(Error::InvalidBar(index));
            }
            address |= (self.read32(addr, offset + 4) as u64) << 32;
        }
        Ok(Bar::Memory { address, is_64bit, prefetchable })
    }

    /// Base address of BAR `index`.
    pub fn bar_address(&self, addr: PciAddress, index: u8) -> Result<u64> {
        self.bar(addr, index).map(|bar| bar.address())
    }

    /// Size in bytes of BAR `index` (0 if unimplemented).
    ///
    /// Writes all-ones to the BAR, reads back the decoded size mask and
    /// restores the original value, with I/O and memory decode disabled
    /// for the duration.
    pub fn bar_size(&self, addr: PciAddress, index: u8) -> Result<u64> {
        let offset = Self::bar_offset(addr, index)?;
        let _probe = self.probe_lock.lock();

        let original = self.read32(addr, offset);
        let is_io = original & 0x1 != 0;
        let is_64bit = !is_io && ((original >> 1) & 0x3) == 0x2;
        if is_64bit && index == 5 {
            return Err(Error::InvalidBar(index));
        }

        let cmd = self.read16(addr, regs::COMMAND);
        self.write16(
            addr,
            regs::COMMAND,
            cmd & !(command::IO_SPACE | command::MEMORY_SPACE),
        );

        self.write32(addr, offset, 0xFFFF_FFFF);
        let low_mask = self.read32(addr, offset);
        self.write32(addr, offset, original);

        let mut mask = if is_io {
            (low_mask & !0x3) as u64 | 0xFFFF_FFFF_0000_0000
        } else {
            (low_mask & !0xF) as u64 | 0xFFFF_FFFF_0000_0000
        };

        if is_64bit {
            let original_high = self.read32(addr, offset + 4);
            self.write32(addr, offset + 4, 0xFFFF_FFFF);
            let high_mask = self.read32(addr, offset + 4);
            self.write32(addr, offset + 4, original_high);
            mask = (mask & 0xFFFF_FFFF) | ((high_mask as u64) << 32);
        }

        self.write16(addr, regs::COMMAND, cmd);

        if low_mask == 0 || (mask & !0xF) == 0 {
            return Ok(0);
        }
        let size = (!mask).wrapping_add(1);
        Ok(if is_io { size & 0xFFFF } else { size })
    }

    /// Walk the standard capability list.
    pub fn for_each_capability<F: FnMut(Capability)>(&self, addr: PciAddress, mut visit: F) {
        let status = self.read16(addr, regs::STATUS);
        if (status & STATUS_CAPABILITIES) == 0 {
            return;
        }

        let mut cap_offset = self.read8(addr, regs::CAPABILITIES_POINTER) & !0x3;
        let mut seen = 0;
        while cap_offset != 0 && cap_offset != 0xFF {
            if seen == MAX_CAPABILITIES {
                log::warn!("[PCI] {} capability list does not terminate", addr);
                break;
            }
            seen += 1;

            let header = self.read16(addr, cap_offset as u16);
            visit(Capability {
                id: header as u8,
                offset: cap_offset,
            });
            cap_offset = ((header >> 8) as u8) & !0x3;
        }
    }

    /// Enable bus mastering for a device.
    pub fn enable_bus_master(&self, addr: PciAddress) {
        let cmd = self.read16(addr, regs::COMMAND);
        self.write16(addr, regs::COMMAND, cmd | command::BUS_MASTER);
    }

    /// Enable memory space access for a device.
    pub fn enable_memory_space(&self, addr: PciAddress) {
        let cmd = self.read16(addr, regs::COMMAND);
        self.write16(addr, regs::COMMAND, cmd | command::MEMORY_SPACE);
    }
}
