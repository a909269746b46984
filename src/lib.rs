/*
 *  lib.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Hardware-facing half of an Open Pixel Control server: device
 *  abstraction, USB/SPI transfer engine and configuration binding
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

pub mod config;
pub mod device;
pub mod opc;
pub mod pacer;

pub use device::{
    BufferPolicy, ColorLut, ConfigMatcher, Device, DeviceError, DeviceStatus, SpiDevice,
    UsbDevice, WriteAck,
};
pub use opc::{DeviceSpecificCommand, Message, ProtocolFrame};
