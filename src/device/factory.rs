/*
 *  device/factory.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device factory - creates devices from configuration type strings
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use log::debug;

use crate::device::buffer::BufferPolicy;
use crate::device::drivers::apa102::Apa102Family;
use crate::device::drivers::fadecandy::FadecandyFamily;
use crate::device::engine::TransferConfig;
use crate::device::error::DeviceError;
use crate::device::spi::{SharedBridge, SpiDevice};
use crate::device::traits::{Device, PixelFamily};
use crate::device::usb::{UsbDevice, UsbHandle};

/// Type alias for boxed device trait objects
pub type BoxedDevice = Box<dyn Device>;

/// Families reachable over a raw USB handle
pub const USB_TYPES: &[&str] = &["fadecandy"];

/// Families reachable over an SPI bridge port
pub const SPI_TYPES: &[&str] = &["apa102spi"];

/// Creates devices from a configuration `type` plus a raw handle
pub struct DeviceFactory;

impl DeviceFactory {
    /// Hardware-family strategy for a configuration `type`
    pub fn family(type_string: &str) -> Result<Box<dyn PixelFamily>, DeviceError> {
        match type_string {
            "fadecandy" => Ok(Box::new(FadecandyFamily::new())),
            "apa102spi" => Ok(Box::new(Apa102Family::new())),
            other => Err(DeviceError::UnsupportedType(other.to_string())),
        }
    }

    pub fn create_usb(
        type_string: &str,
        handle: Box<dyn UsbHandle>,
        policy: BufferPolicy,
        config: TransferConfig,
    ) -> Result<BoxedDevice, DeviceError> {
        if !USB_TYPES.contains(&type_string) {
            return Err(DeviceError::UnsupportedType(type_string.to_string()));
        }
        debug!("creating USB device of type {} ({})", type_string, policy);
        Ok(Box::new(UsbDevice::new(handle, Self::family(type_string)?, policy, config)))
    }

    pub fn create_spi(
        type_string: &str,
        bridge: SharedBridge,
        port: u32,
        policy: BufferPolicy,
        config: TransferConfig,
    ) -> Result<BoxedDevice, DeviceError> {
        if !SPI_TYPES.contains(&type_string) {
            return Err(DeviceError::UnsupportedType(type_string.to_string()));
        }
        debug!("creating SPI device of type {} on port {} ({})", type_string, port, policy);
        Ok(Box::new(SpiDevice::new(bridge, port, Self::family(type_string)?, policy, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::drivers::sim::{SimBridge, SimUsbHandle};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_family_lookup() {
        assert_eq!(DeviceFactory::family("fadecandy").unwrap().type_string(), "fadecandy");
        assert_eq!(DeviceFactory::family("apa102spi").unwrap().type_string(), "apa102spi");
        assert!(matches!(
            DeviceFactory::family("ws2801"),
            Err(DeviceError::UnsupportedType(t)) if t == "ws2801"
        ));
    }

    #[test]
    fn test_transport_must_fit_family() {
        let handle = Box::new(SimUsbHandle::fadecandy("FC1"));
        assert!(DeviceFactory::create_usb("apa102spi", handle, BufferPolicy::CopyOnSubmit, TransferConfig::default()).is_err());

        let bridge: SharedBridge = Arc::new(Mutex::new(SimBridge::new(None, 4)));
        let device = DeviceFactory::create_spi("apa102spi", bridge, 3, BufferPolicy::CopyOnSubmit, TransferConfig::default()).unwrap();
        assert_eq!(device.type_string(), "apa102spi");
        assert!(device.name().ends_with("(Port 3)"));
    }
}
