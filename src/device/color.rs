/*
 *  device/color.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Color-correction lookup tables
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

use serde_json::Value;

use crate::device::error::DeviceError;

/// Entries per channel in the default table (matches the Fadecandy firmware)
pub const LUT_ENTRIES: usize = 257;

const MIN_ENTRIES: usize = 2;
const MAX_ENTRIES: usize = 1024;

/// Already-computed 16-bit lookup table, one curve per color channel.
///
/// Curve math lives with whoever parses the color description; devices only
/// consume the resulting table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorLut {
    channels: [Vec<u16>; 3],
}

impl ColorLut {
    /// Linear ramp, 0..=0xFFFF
    pub fn identity() -> Self {
        let ramp: Vec<u16> = (0..LUT_ENTRIES)
            .map(|i| ((i * 0xFFFF) / (LUT_ENTRIES - 1)) as u16)
            .collect();
        Self { channels: [ramp.clone(), ramp.clone(), ramp] }
    }

    pub fn from_tables(r: Vec<u16>, g: Vec<u16>, b: Vec<u16>) -> Result<Self, DeviceError> {
        for (name, table) in [("r", &r), ("g", &g), ("b", &b)] {
            if !(MIN_ENTRIES..=MAX_ENTRIES).contains(&table.len()) {
                return Err(DeviceError::MalformedConfig(format!(
                    "color table '{}' has {} entries (need {}..={})",
                    name, table.len(), MIN_ENTRIES, MAX_ENTRIES
                )));
            }
        }
        Ok(Self { channels: [r, g, b] })
    }

    /// Accepts `{"r": [..], "g": [..], "b": [..]}` of integers in 0..=65535
    pub fn from_json(doc: &Value) -> Result<Self, DeviceError> {
        let channel = |key: &str| -> Result<Vec<u16>, DeviceError> {
            let entries = doc
                .get(key)
                .and_then(Value::as_array)
                .ok_or_else(|| DeviceError::MalformedConfig(format!("color table '{}' must be an array", key)))?;
            entries
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|n| u16::try_from(n).ok())
                        .ok_or_else(|| DeviceError::MalformedConfig(format!("color table '{}' entry {} out of range", key, v)))
                })
                .collect()
        };
        Self::from_tables(channel("r")?, channel("g")?, channel("b")?)
    }

    pub fn entries(&self, channel: usize) -> &[u16] {
        &self.channels[channel.min(2)]
    }

    /// 16-bit output for an 8-bit input, linearly interpolated between entries
    pub fn lookup(&self, channel: usize, value: u8) -> u16 {
        let table = self.entries(channel);
        let last = table.len() - 1;
        let pos = value as usize * last;
        let index = pos / 255;
        let frac = (pos % 255) as u32;
        if index >= last {
            return table[last];
        }
        let a = table[index] as u32;
        let b = table[index + 1] as u32;
        ((a * (255 - frac) + b * frac) / 255) as u16
    }

    /// Same as [`lookup`](Self::lookup), reduced to 8 bits
    pub fn lookup8(&self, channel: usize, value: u8) -> u8 {
        (self.lookup(channel, value) >> 8) as u8
    }

    /// One channel stretched or squeezed to exactly `count` entries
    pub fn resampled(&self, channel: usize, count: usize) -> Vec<u16> {
        let table = self.entries(channel);
        if table.len() == count {
            return table.to_vec();
        }
        let last = table.len() - 1;
        let span = count.saturating_sub(1).max(1);
        (0..count)
            .map(|i| {
                let pos = i * last;
                let index = pos / span;
                let frac = (pos % span) as u64;
                if index >= last {
                    return table[last];
                }
                let a = table[index] as u64;
                let b = table[index + 1] as u64;
                ((a * (span as u64 - frac) + b * frac) / span as u64) as u16
            })
            .collect()
    }
}

impl Default for ColorLut {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_endpoints() {
        let lut = ColorLut::identity();
        assert_eq!(lut.lookup(0, 0), 0);
        assert_eq!(lut.lookup(1, 255), 0xFFFF);
        assert_eq!(lut.lookup8(2, 128), 128);
    }

    #[test]
    fn test_short_table_interpolates() {
        let lut = ColorLut::from_tables(vec![0, 1000], vec![0, 1000], vec![1000, 0]).unwrap();
        assert_eq!(lut.lookup(0, 0), 0);
        assert_eq!(lut.lookup(0, 255), 1000);
        assert_eq!(lut.lookup(2, 255), 0);
        let mid = lut.lookup(0, 127);
        assert!(mid > 490 && mid < 500, "{}", mid);
    }

    #[test]
    fn test_resampled_keeps_endpoints() {
        let lut = ColorLut::from_tables(vec![0, 100, 200], vec![0, 1], vec![5, 5]).unwrap();
        let r = lut.resampled(0, LUT_ENTRIES);
        assert_eq!(r.len(), LUT_ENTRIES);
        assert_eq!(r[0], 0);
        assert_eq!(r[128], 100);
        assert_eq!(r[LUT_ENTRIES - 1], 200);
        assert_eq!(lut.resampled(2, 4), vec![5, 5, 5, 5]);
        assert_eq!(ColorLut::identity().resampled(1, LUT_ENTRIES), ColorLut::identity().entries(1));
    }

    #[test]
    fn test_from_json() {
        let lut = ColorLut::from_json(&json!({"r": [0, 65535], "g": [0, 32768], "b": [0, 0]})).unwrap();
        assert_eq!(lut.lookup8(0, 255), 255);
        assert_eq!(lut.lookup8(1, 255), 128);
        assert_eq!(lut.lookup8(2, 255), 0);
    }

    #[test]
    fn test_from_json_rejects_bad_tables() {
        assert!(ColorLut::from_json(&json!({"r": [0, 1], "g": [0, 1]})).is_err());
        assert!(ColorLut::from_json(&json!({"r": [0, 70000], "g": [0, 1], "b": [0, 1]})).is_err());
        assert!(ColorLut::from_json(&json!({"r": [0], "g": [0, 1], "b": [0, 1]})).is_err());
        assert!(ColorLut::from_json(&json!({"r": "linear", "g": [0, 1], "b": [0, 1]})).is_err());
    }
}
