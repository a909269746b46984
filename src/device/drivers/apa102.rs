/*
 *  device/drivers/apa102.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  APA102 / DotStar strips on an SPI bridge port
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

use serde_json::{json, Map, Value};

use crate::device::color::ColorLut;
use crate::device::error::DeviceError;
use crate::device::matching::{DeviceSettings, MapEntry};
use crate::device::traits::PixelFamily;
use crate::opc::{DeviceSpecificCommand, ProtocolFrame};

pub const MAX_PIXELS: usize = 1024;
pub const MAX_BRIGHTNESS: u8 = 31;
const START_FRAME: usize = 4;
const LED_FRAME: usize = 4;
const LED_HEADER: u8 = 0xE0;

/// Clock pulses the strip needs to shift the last pixel through
fn end_frame_len(pixels: usize) -> usize {
    pixels.div_ceil(16).max(4)
}

pub struct Apa102Family {
    pixel_count: usize,
    map: Vec<MapEntry>,
    brightness: u8,
}

impl Apa102Family {
    /// A strip of unknown length drives nothing until configured
    pub fn new() -> Self {
        Self { pixel_count: 0, map: Vec::new(), brightness: MAX_BRIGHTNESS }
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    fn check_brightness(value: u8) -> Result<u8, DeviceError> {
        if value > MAX_BRIGHTNESS {
            Err(DeviceError::MalformedConfig(format!("brightness {} out of range 0..={}", value, MAX_BRIGHTNESS)))
        } else {
            Ok(value)
        }
    }

    fn led_offset(index: usize) -> usize {
        START_FRAME + index * LED_FRAME
    }
}

impl Default for Apa102Family {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelFamily for Apa102Family {
    fn type_string(&self) -> &'static str {
        "apa102spi"
    }

    fn display_name(&self) -> &'static str {
        "APA102 SPI"
    }

    fn max_transfer_len(&self) -> usize {
        START_FRAME + MAX_PIXELS * LED_FRAME + end_frame_len(MAX_PIXELS)
    }

    fn blank_image(&self) -> Vec<u8> {
        let n = self.pixel_count;
        let mut image = vec![0u8; START_FRAME + n * LED_FRAME];
        for led in image[START_FRAME..].chunks_exact_mut(LED_FRAME) {
            led[0] = LED_HEADER | self.brightness;
        }
        image.resize(image.len() + end_frame_len(n), 0xFF);
        image
    }

    fn pixel_count(&self) -> usize {
        self.pixel_count
    }

    fn configure(&mut self, settings: &DeviceSettings) -> Result<(), DeviceError> {
        let pixel_count = settings.pixel_count.unwrap_or(0);
        if pixel_count > MAX_PIXELS {
            return Err(DeviceError::MalformedConfig(format!(
                "pixelCount {} exceeds {} for one SPI port",
                pixel_count, MAX_PIXELS
            )));
        }
        let brightness = Self::check_brightness(settings.brightness.unwrap_or(MAX_BRIGHTNESS))?;
        let map = settings.routed_map(pixel_count)?;

        self.pixel_count = pixel_count;
        self.brightness = brightness;
        self.map = map;
        Ok(())
    }

    /// Color correction happens here; the strip has no LUT of its own
    fn render(&self, frame: &ProtocolFrame, lut: &ColorLut, image: &mut [u8]) -> bool {
        let mut consumed = false;
        for entry in self.map.iter().filter(|e| e.channel() == frame.channel) {
            consumed = true;
            for k in 0..entry.count() {
                let src = (entry.first_opc_pixel() + k) * 3;
                let Some(rgb) = frame.payload.get(src..src + 3) else { break };
                let at = Self::led_offset(entry.first_output_pixel() + k);
                image[at] = LED_HEADER | self.brightness;
                image[at + 1] = lut.lookup8(2, rgb[2]);
                image[at + 2] = lut.lookup8(1, rgb[1]);
                image[at + 3] = lut.lookup8(0, rgb[0]);
            }
        }
        consumed
    }

    fn command(&mut self, cmd: &DeviceSpecificCommand, image: &mut [u8]) -> Result<Option<Vec<u8>>, DeviceError> {
        if cmd.kind() != Some("device_options") {
            return Ok(None);
        }
        let Some(value) = cmd.document.get("brightness") else {
            return Ok(None);
        };
        let brightness = value
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| DeviceError::MalformedConfig(format!("brightness must be an integer, got {}", value)))?;
        self.brightness = Self::check_brightness(brightness)?;

        for index in 0..self.pixel_count {
            image[Self::led_offset(index)] = LED_HEADER | self.brightness;
        }
        Ok(Some(image.to_vec()))
    }

    fn describe(&self, out: &mut Map<String, Value>) {
        out.insert("brightness".into(), json!(self.brightness));
        out.insert("map".into(), json!(self.map));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strip(pixels: usize) -> Apa102Family {
        let mut family = Apa102Family::new();
        let settings = DeviceSettings { pixel_count: Some(pixels), ..Default::default() };
        family.configure(&settings).unwrap();
        family
    }

    #[test]
    fn test_frame_layout() {
        let image = strip(3).blank_image();
        assert_eq!(image.len(), 4 + 12 + 4);
        assert_eq!(&image[..4], &[0, 0, 0, 0]);
        assert_eq!(image[4], 0xFF);
        assert_eq!(&image[16..], &[0xFF; 4]);
    }

    #[test]
    fn test_end_frame_grows_with_length() {
        assert_eq!(end_frame_len(10), 4);
        assert_eq!(end_frame_len(100), 7);
        let image = strip(100).blank_image();
        assert_eq!(image.len(), 4 + 400 + 7);
    }

    #[test]
    fn test_render_is_bgr_through_lut() {
        let family = strip(2);
        let mut image = family.blank_image();
        let lut = ColorLut::from_tables(vec![0, 65535], vec![0, 65535], vec![0, 0]).unwrap();
        assert!(family.render(&ProtocolFrame::pixels(0, vec![10, 20, 30, 255, 0, 0]), &lut, &mut image));

        assert_eq!(&image[4..8], &[0xFF, 0, 20, 10]);
        assert_eq!(&image[8..12], &[0xFF, 0, 0, 255]);
    }

    #[test]
    fn test_brightness_command_rewrites_headers() {
        let mut family = strip(2);
        let mut image = family.blank_image();
        let cmd = DeviceSpecificCommand::new(json!({"type": "device_options", "brightness": 4}));
        let out = family.command(&cmd, &mut image).unwrap().unwrap();
        assert_eq!(out[4], 0xE4);
        assert_eq!(out[8], 0xE4);
        assert_eq!(family.brightness(), 4);

        let bad = DeviceSpecificCommand::new(json!({"type": "device_options", "brightness": 40}));
        assert!(family.command(&bad, &mut image).is_err());
        assert_eq!(family.brightness(), 4);
    }

    #[test]
    fn test_unconfigured_strip_is_empty() {
        let family = Apa102Family::new();
        assert_eq!(family.pixel_count(), 0);
        assert!(!family.render(&ProtocolFrame::pixels(0, vec![1, 2, 3]), &ColorLut::identity(), &mut family.blank_image()));
    }
}
