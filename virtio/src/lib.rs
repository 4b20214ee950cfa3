//! KPIO paravirtualized device transport.
//!
//! This crate is the glue between kernel drivers and the virtual hardware
//! a hypervisor exposes over PCI using the VirtIO 1.x split-queue
//! protocol.
//!
//! # Architecture
//!
//! - `pci`: configuration space access, enumeration, BAR probing
//! - `dma`: slab pools over physically contiguous pages
//! - `queue`: split virtqueue memory (descriptors, available, used rings)
//! - `device`: modern PCI transport, status handshake, feature
//!   negotiation, interrupt demultiplexing
//! - `gpu`: VirtIO GPU driver (2D resources, scanouts, cursor)
//! - `registry`: boot-time discovery and interrupt wiring
//!
//! Hardware collaborators (page allocator, MMIO mapping, interrupt
//! controller) are reached through the traits in [`hal`], bundled in a
//! [`hal::Platform`] that is passed by reference.
//!
//! # References
//!
//! - Virtual I/O Device (VIRTIO) Version 1.1
//! - PCI Local Bus Specification 3.0

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod dma;
pub mod error;
pub mod gpu;
pub mod hal;
pub mod pci;
pub mod queue;
pub mod registry;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::TransportConfig;
pub use error::{Error, GpuError, Result};
pub use hal::Platform;
pub use registry::DeviceRegistry;
