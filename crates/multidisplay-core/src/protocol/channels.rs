//! Sensor channel table
//!
//! Every channel carried in a data sample is described here: wire width,
//! scale/offset conversion to a physical value, unit and valid range.
//! The decoder, encoder, capture file header and CSV export all read this
//! table; no conversion constants live anywhere else.

use serde::{Deserialize, Serialize};

/// Raw wire representation of a channel (big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Unsigned 8-bit
    U8,
    /// Unsigned 16-bit
    U16,
    /// Signed 16-bit
    I16,
}

impl ChannelKind {
    /// Width on the wire in bytes
    pub const fn width(self) -> usize {
        match self {
            ChannelKind::U8 => 1,
            ChannelKind::U16 | ChannelKind::I16 => 2,
        }
    }

    /// Smallest representable raw value
    pub const fn raw_min(self) -> i32 {
        match self {
            ChannelKind::U8 | ChannelKind::U16 => 0,
            ChannelKind::I16 => i16::MIN as i32,
        }
    }

    /// Largest representable raw value
    pub const fn raw_max(self) -> i32 {
        match self {
            ChannelKind::U8 => u8::MAX as i32,
            ChannelKind::U16 => u16::MAX as i32,
            ChannelKind::I16 => i16::MAX as i32,
        }
    }
}

/// Definition of one sensor channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelDef {
    /// Stable identifier written into capture file headers
    pub id: u8,
    /// Short name used for lookups and CSV headers
    pub name: &'static str,
    /// Physical unit
    pub unit: &'static str,
    /// Wire representation
    pub kind: ChannelKind,
    /// physical = raw * scale + offset
    pub scale: f64,
    /// physical = raw * scale + offset
    pub offset: f64,
    /// Lowest valid physical value
    pub min: f64,
    /// Highest valid physical value
    pub max: f64,
    /// Decimal places used when rendering
    pub digits: usize,
}

impl ChannelDef {
    /// Convert a raw wire value to its physical value
    pub fn to_physical(&self, raw: i32) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    /// Convert a physical value to the nearest raw wire value, saturating at
    /// the limits of the wire type
    pub fn to_raw(&self, value: f64) -> i32 {
        let raw = ((value - self.offset) / self.scale).round();
        (raw as i64).clamp(self.kind.raw_min() as i64, self.kind.raw_max() as i64) as i32
    }

    /// Whether a physical value lies inside the declared valid range
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

macro_rules! channel {
    ($id:expr, $name:expr, $unit:expr, $kind:ident, $scale:expr, $offset:expr, $min:expr, $max:expr, $digits:expr) => {
        ChannelDef {
            id: $id,
            name: $name,
            unit: $unit,
            kind: ChannelKind::$kind,
            scale: $scale,
            offset: $offset,
            min: $min,
            max: $max,
            digits: $digits,
        }
    };
}

/// Channels of a data sample, in wire order
pub const CHANNELS: &[ChannelDef] = &[
    channel!(0, "rpm", "1/min", U16, 1.0, 0.0, 0.0, 12000.0, 0),
    channel!(1, "boost", "bar", I16, 0.001, 0.0, -1.0, 4.0, 3),
    channel!(2, "throttle", "%", U16, 0.1, 0.0, 0.0, 100.0, 1),
    channel!(3, "lambda", "lambda", U16, 0.001, 0.0, 0.0, 4.0, 3),
    channel!(4, "lmm", "V", U16, 0.001, 0.0, 0.0, 5.0, 3),
    channel!(5, "case_temp", "°C", I16, 0.1, 0.0, -40.0, 150.0, 1),
    channel!(6, "egt0", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(7, "egt1", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(8, "egt2", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(9, "egt3", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(10, "egt4", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(11, "egt5", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(12, "egt6", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(13, "egt7", "°C", I16, 0.25, 0.0, -50.0, 1400.0, 0),
    channel!(14, "battery", "V", U16, 0.01, 0.0, 0.0, 20.0, 2),
    channel!(15, "vdo_pres", "bar", U16, 0.01, 0.0, 0.0, 10.0, 2),
    channel!(16, "vdo_temp", "°C", I16, 0.1, 0.0, -40.0, 200.0, 1),
    channel!(17, "speed", "km/h", U16, 0.1, 0.0, 0.0, 400.0, 1),
    channel!(18, "gear", "", U8, 1.0, 0.0, 0.0, 8.0, 0),
    channel!(19, "n75_duty", "", U8, 1.0, 0.0, 0.0, 255.0, 0),
    channel!(20, "n75_setpoint", "bar", I16, 0.001, 0.0, -1.0, 4.0, 3),
    channel!(21, "knock", "V", U16, 0.001, 0.0, 0.0, 5.0, 3),
    channel!(22, "df_map", "", U8, 1.0, 0.0, 0.0, 255.0, 0),
];

/// Number of channels in a data sample
pub const CHANNEL_COUNT: usize = CHANNELS.len();

/// Number of thermocouple inputs carried on the wire
pub const EGT_CHANNELS: usize = 8;

/// Index of the first thermocouple channel
pub const FIRST_EGT_INDEX: usize = 6;

/// Index of the Digifant MAP sensor raw channel
pub const DF_MAP_INDEX: usize = 22;

/// Size of a data sample body on the wire: timestamp + channels
pub fn sample_body_len() -> usize {
    4 + CHANNELS.iter().map(|c| c.kind.width()).sum::<usize>()
}

/// Find a channel index by name
pub fn channel_index(name: &str) -> Option<usize> {
    CHANNELS.iter().position(|c| c.name == name)
}

/// MAP sensor fitted to a Digifant ECU.
///
/// Converts the raw 8-bit ADC reading of the `df_map` channel to absolute kPa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapSensor {
    /// 100 kPa (stock, naturally aspirated)
    Kpa100,
    /// 200 kPa
    #[default]
    Kpa200,
    /// 250 kPa
    Kpa250,
    /// 400 kPa
    Kpa400,
}

impl MapSensor {
    /// Full scale pressure in kPa
    pub fn full_scale_kpa(self) -> f64 {
        match self {
            MapSensor::Kpa100 => 100.0,
            MapSensor::Kpa200 => 200.0,
            MapSensor::Kpa250 => 250.0,
            MapSensor::Kpa400 => 400.0,
        }
    }

    /// Sensor name as stored in settings (the full scale value)
    pub fn name(self) -> u32 {
        self.full_scale_kpa() as u32
    }

    /// Look up a sensor by its settings name, falling back to the 200 kPa part
    pub fn from_name(name: u32) -> Self {
        match name {
            100 => MapSensor::Kpa100,
            250 => MapSensor::Kpa250,
            400 => MapSensor::Kpa400,
            _ => MapSensor::Kpa200,
        }
    }

    /// Convert a raw ADC reading to absolute pressure in kPa
    pub fn to_kpa(self, raw: f64) -> f64 {
        raw.clamp(0.0, 255.0) / 255.0 * self.full_scale_kpa()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_match_positions() {
        for (i, c) in CHANNELS.iter().enumerate() {
            assert_eq!(c.id as usize, i, "channel {} out of order", c.name);
        }
    }

    #[test]
    fn test_body_len() {
        // timestamp + 3 x U8 + 20 x 16-bit
        assert_eq!(sample_body_len(), 4 + 3 + 20 * 2);
    }

    #[test]
    fn test_raw_physical_conversion() {
        let boost = &CHANNELS[channel_index("boost").unwrap()];
        assert_eq!(boost.to_raw(1.25), 1250);
        assert_eq!(boost.to_raw(boost.to_physical(-345)), -345);

        let gear = &CHANNELS[channel_index("gear").unwrap()];
        assert_eq!(gear.to_raw(300.0), 255);
    }

    #[test]
    fn test_map_sensor_transfer() {
        assert_eq!(MapSensor::Kpa200.to_kpa(255.0), 200.0);
        assert_eq!(MapSensor::Kpa400.to_kpa(0.0), 0.0);
        assert_eq!(MapSensor::from_name(250), MapSensor::Kpa250);
        assert_eq!(MapSensor::from_name(17), MapSensor::Kpa200);
        assert_eq!(MapSensor::default().name(), 200);
    }
}
