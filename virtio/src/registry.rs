//! Boot-time device discovery.
//!
//! Walks the PCI bus once, brings up every VirtIO device we have a driver
//! for, and routes its legacy interrupt line to the transport.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::config::TransportConfig;
use crate::device::{DeviceClass, VirtioDriver};
use crate::error::{Error, Result};
use crate::gpu::GpuDevice;
use crate::hal::Platform;
use crate::pci::PciFunction;

/// Interrupt line value meaning "not connected".
const IRQ_UNROUTED: u8 = 0xFF;

/// Live VirtIO devices.
pub struct DeviceRegistry {
    gpus: Vec<Arc<GpuDevice>>,
    unclaimed: Vec<(PciFunction, DeviceClass)>,
}

impl DeviceRegistry {
    /// Enumerate the bus and initialize every supported device.
    ///
    /// Devices that fail to initialize are logged, left reset, and
    /// omitted.
    pub fn probe(platform: &Platform, config: &TransportConfig) -> Self {
        let mut candidates = Vec::new();
        platform.pci.enumerate(|function| {
            if function.id.is_virtio() {
                candidates.push(*function);
            }
        });

        let mut registry = Self {
            gpus: Vec::new(),
            unclaimed: Vec::new(),
        };

        for function in candidates {
            let Some(class) = DeviceClass::from_pci(function.id) else {
                continue;
            };
            match class {
                DeviceClass::Gpu => match Self::bring_up_gpu(platform, &function, *config) {
                    Ok(gpu) => registry.gpus.push(gpu),
                    Err(err) => {
                        log::warn!("[VirtIO] {} GPU unavailable: {}", function.address, err)
                    }
                },
                other => {
                    log::info!("[VirtIO] {} {} device: no driver", function.address, other);
                    registry.unclaimed.push((function, other));
                }
            }
        }

        log::info!(
            "[VirtIO] {} device(s) live, {} without driver",
            registry.len(),
            registry.unclaimed.len()
        );
        registry
    }

    fn bring_up_gpu(platform: &Platform, function: &PciFunction, config: TransportConfig) -> Result<Arc<GpuDevice>> {
        let gpu = Arc::new(GpuDevice::initialize(platform, function, config)?);
        let driver: Arc<dyn VirtioDriver> = gpu.clone();
        // Dropping `gpu` on failure resets the device.
        wire_interrupt(platform, function, Arc::downgrade(&driver))?;
        Ok(gpu)
    }

    /// Initialized GPUs.
    pub fn gpus(&self) -> &[Arc<GpuDevice>] {
        &self.gpus
    }

    /// VirtIO functions found without a driver.
    pub fn unclaimed(&self) -> &[(PciFunction, DeviceClass)] {
        &self.unclaimed
    }

    /// Number of live devices.
    pub fn len(&self) -> usize {
        self.gpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gpus.is_empty()
    }
}

/// Route the function's INTx line to `driver`'s transport.
fn wire_interrupt(platform: &Platform, function: &PciFunction, driver: Weak<dyn VirtioDriver>) -> Result<()> {
    let irq = function.interrupt_line;
    if function.interrupt_pin == 0 || irq == IRQ_UNROUTED {
        log::error!("[VirtIO] {} has no interrupt line", function.address);
        return Err(Error::UnsupportedDevice);
    }

    let handler = Arc::new(move || {
        if let Some(driver) = driver.upgrade() {
            driver.transport().handle_interrupt(&*driver);
        }
    });

    if !platform.interrupts.register_handler(irq, handler) {
        log::error!("[VirtIO] {} IRQ {} could not be registered", function.address, irq);
        return Err(Error::UnsupportedDevice);
    }
    log::debug!("[VirtIO] {} on IRQ {}", function.address, irq);
    Ok(())
}
