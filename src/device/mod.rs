/*
 *  device/mod.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device abstraction and the asynchronous transfer engine
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

// Core trait definitions
pub mod traits;
pub mod error;
pub mod factory;

// Transfer pipeline
pub mod buffer;
pub mod engine;

// Transports
pub mod pixel_device;
pub mod usb;
pub mod spi;
pub mod arena;

// Configuration and color
pub mod matching;
pub mod color;

pub mod drivers;

// Re-exports for convenience
pub use traits::{Device, DeviceStatus, PixelFamily, Transport, WriteAck};
pub use error::{ArenaError, BufferError, DeviceError};
pub use factory::{BoxedDevice, DeviceFactory};
pub use buffer::{BufferPolicy, BufferState, TransferBuffer};
pub use engine::{CompletionSink, StageOutcome, TransferConfig, TransferEngine, TransferOutcome, TransferStats};
pub use pixel_device::{ConfigState, PixelDevice};
pub use usb::{DeviceDescriptor, UsbDevice, UsbError, UsbHandle, UsbTransport};
pub use spi::{SharedBridge, SpiBridge, SpiDevice, SpiError, SpiTransport};
pub use arena::{HandleArena, HandleId};
pub use matching::{Binding, ConfigMatcher, DeviceIdentity, DeviceSettings, MapEntry};
pub use color::ColorLut;
