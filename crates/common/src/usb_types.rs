//! USB seams shared by the bridge and its tests
//!
//! The base station is a HID device: commands go out as SET_REPORT control
//! transfers and replies come back on IN endpoint `0x83`. [`UsbChannel`]
//! captures exactly those two primitives so the device stack above it can
//! run against a real `rusb` handle or a simulated device.

use std::fmt;
use std::time::Duration;

/// iClicker base station vendor ID
pub const ICLICKER_VENDOR_ID: u16 = 0x1881;

/// iClicker base station product ID
pub const ICLICKER_PRODUCT_ID: u16 = 0x0150;

/// bmRequestType for HID SET_REPORT (host to device, class, interface)
pub const SET_REPORT_REQUEST_TYPE: u8 = 0x21;

/// bRequest for HID SET_REPORT
pub const SET_REPORT_REQUEST: u8 = 0x09;

/// wValue: output report, ID 0
pub const SET_REPORT_VALUE: u16 = 0x0200;

/// wIndex: interface 0
pub const SET_REPORT_INDEX: u16 = 0x0000;

/// IN endpoint the base station streams replies on
pub const RESPONSE_ENDPOINT: u8 = 0x83;

/// Interface the bridge claims
pub const BASE_INTERFACE: u8 = 0;

/// Vendor/product pair identifying the device to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            vendor_id: ICLICKER_VENDOR_ID,
            product_id: ICLICKER_PRODUCT_ID,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// An opened base station channel
///
/// Errors are raw `rusb` errors; the transport above decides which of them
/// (only [`rusb::Error::Timeout`] on reads) mean "nothing to report".
pub trait UsbChannel: Send {
    /// Send one report with HID SET_REPORT
    fn control_write(&mut self, data: &[u8]) -> Result<usize, rusb::Error>;

    /// Read one report from [`RESPONSE_ENDPOINT`]
    fn read_response(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, rusb::Error>;
}

/// Locates and opens a base station
pub trait DeviceOpener: Send {
    /// Open the first device matching `selector`
    ///
    /// Returns [`Error::DeviceNotFound`](crate::Error::DeviceNotFound) when
    /// nothing matches.
    fn open(&mut self, selector: DeviceSelector) -> crate::Result<Box<dyn UsbChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selector_is_iclicker() {
        let selector = DeviceSelector::default();
        assert_eq!(selector.vendor_id, 0x1881);
        assert_eq!(selector.product_id, 0x0150);
        assert_eq!(selector.to_string(), "1881:0150");
    }

    #[test]
    fn test_response_endpoint_is_in() {
        // Bit 7 = 1 means IN endpoint
        assert!((RESPONSE_ENDPOINT & 0x80) != 0);
        // SET_REPORT goes host to device
        assert!((SET_REPORT_REQUEST_TYPE & 0x80) == 0);
    }
}
