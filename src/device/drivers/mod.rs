/*
 *  device/drivers/mod.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Hardware families and hardware stacks
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

// Hardware families
pub mod apa102;
pub mod fadecandy;

// Simulated stack for the runner and tests
pub mod sim;

// Real USB handles
#[cfg(feature = "usb-nusb")]
pub mod nusb_handle;

pub use apa102::Apa102Family;
pub use fadecandy::FadecandyFamily;
pub use sim::{SimBridge, SimUsbHandle};
