//! rusb-backed base station access
//!
//! Finds the base station by vendor/product ID, takes it over from the
//! kernel HID driver, and exposes it as a [`UsbChannel`].

use crate::timing::pause;
use common::usb_types::{
    BASE_INTERFACE, RESPONSE_ENDPOINT, SET_REPORT_INDEX, SET_REPORT_REQUEST,
    SET_REPORT_REQUEST_TYPE, SET_REPORT_VALUE,
};
use common::{DeviceOpener, DeviceSelector, Error, Result, UsbChannel};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for SET_REPORT control writes
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens the physical base station through libusb
pub struct RusbOpener {
    context: Context,
    settle: Duration,
}

impl RusbOpener {
    /// `settle` is waited after configuring the device
    pub fn new(settle: Duration) -> Result<Self> {
        let context = Context::new()?;
        Ok(Self { context, settle })
    }

    fn find(&self, selector: DeviceSelector) -> Result<Device<Context>> {
        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device {:03}:{:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if descriptor.vendor_id() == selector.vendor_id
                && descriptor.product_id() == selector.product_id
            {
                debug!(
                    "Found base station {} on bus {:03} device {:03}",
                    selector,
                    device.bus_number(),
                    device.address()
                );
                return Ok(device);
            }
        }

        Err(Error::DeviceNotFound {
            vendor_id: selector.vendor_id,
            product_id: selector.product_id,
        })
    }
}

impl DeviceOpener for RusbOpener {
    fn open(&mut self, selector: DeviceSelector) -> Result<Box<dyn UsbChannel>> {
        let device = self.find(selector)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open base station {}: {}", selector, e);
            Error::from(e)
        })?;

        let mut detached = false;
        match handle.kernel_driver_active(BASE_INTERFACE) {
            Ok(true) => {
                warn!("The iClicker base seems to be in use by another driver, forcing reattach");
                handle.detach_kernel_driver(BASE_INTERFACE)?;
                detached = true;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    BASE_INTERFACE, e
                );
            }
        }

        let config = device.config_descriptor(0)?;
        handle.set_active_configuration(config.number())?;

        let read_kind = response_transfer_type(&device);
        handle.claim_interface(BASE_INTERFACE)?;
        debug!(
            "Claimed interface {}, replies on {:#04x} via {:?} transfers",
            BASE_INTERFACE, RESPONSE_ENDPOINT, read_kind
        );

        pause(self.settle);
        info!("Opened iClicker base {}", selector);

        Ok(Box::new(RusbChannel {
            handle,
            read_kind,
            detached,
        }))
    }
}

/// Transfer type of the reply endpoint, from the active configuration
fn response_transfer_type(device: &Device<Context>) -> TransferType {
    let found = device.active_config_descriptor().ok().and_then(|config| {
        config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .flat_map(|alt| alt.endpoint_descriptors())
            .find(|ep| ep.address() == RESPONSE_ENDPOINT)
            .map(|ep| ep.transfer_type())
    });

    match found {
        Some(kind @ (TransferType::Interrupt | TransferType::Bulk)) => kind,
        other => {
            warn!(
                "Endpoint {:#04x} has transfer type {:?}, assuming interrupt",
                RESPONSE_ENDPOINT, other
            );
            TransferType::Interrupt
        }
    }
}

/// An open, claimed base station
pub struct RusbChannel {
    handle: DeviceHandle<Context>,
    read_kind: TransferType,
    detached: bool,
}

impl UsbChannel for RusbChannel {
    fn control_write(&mut self, data: &[u8]) -> std::result::Result<usize, rusb::Error> {
        self.handle
            .write_control(
                SET_REPORT_REQUEST_TYPE,
                SET_REPORT_REQUEST,
                SET_REPORT_VALUE,
                SET_REPORT_INDEX,
                data,
                CONTROL_TIMEOUT,
            )
            .inspect_err(|e| warn!("Control write failed: {}", e))
    }

    fn read_response(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error> {
        match self.read_kind {
            TransferType::Bulk => self.handle.read_bulk(RESPONSE_ENDPOINT, buf, timeout),
            _ => self.handle.read_interrupt(RESPONSE_ENDPOINT, buf, timeout),
        }
    }
}

impl Drop for RusbChannel {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(BASE_INTERFACE) {
            debug!("Failed to release interface {}: {}", BASE_INTERFACE, e);
        }

        // Hand the device back to the kernel driver we took it from
        if self.detached {
            if let Err(e) = self.handle.attach_kernel_driver(BASE_INTERFACE) {
                debug!("Could not reattach kernel driver: {}", e);
            }
        }
        debug!("Closed iClicker base");
    }
}
