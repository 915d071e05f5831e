//! Record decoding
//!
//! Turns validated frame payloads into typed records and back. The first
//! payload byte selects the record type; all multi-byte fields are big-endian.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::channels::{
    channel_index, sample_body_len, ChannelKind, MapSensor, CHANNELS, DF_MAP_INDEX,
    FIRST_EGT_INDEX,
};
use super::{DecodeError, Frame};

/// Record opcodes (first payload byte)
pub mod opcode {
    /// Periodic sensor sample
    pub const DATA_SAMPLE: u8 = 0x01;
    /// Command acknowledgement
    pub const ACK: u8 = 0x02;
    /// Calibration map contents
    pub const MAP_RESPONSE: u8 = 0x03;
    /// PID controller settings
    pub const SETTINGS_RESPONSE: u8 = 0x04;
}

/// Largest number of points on a map axis
pub const MAX_MAP_AXIS: usize = 16;

/// Number of PID controller channels on the unit
pub const PID_CHANNELS: u8 = 4;

/// Settings flag: PID control enabled
pub const FLAG_PID_ENABLED: u8 = 0x01;
/// Settings flag: lambda correction enabled
pub const FLAG_LAMBDA_CORRECTION: u8 = 0x02;

/// Fixed-point factor for PID coefficients on the wire
const COEFFICIENT_SCALE: f64 = 1000.0;

/// Length of a settings response body: channel, 8 coefficients, flags
const SETTINGS_BODY_LEN: usize = 1 + 8 * 4 + 1;

/// One time-stamped set of sensor readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    /// Milliseconds since the unit started streaming
    pub timestamp_ms: u32,
    /// Physical channel values, in [`CHANNELS`] order
    pub values: Vec<f64>,
}

impl DataSample {
    /// Create a sample from physical values
    pub fn new(timestamp_ms: u32, values: Vec<f64>) -> Self {
        Self {
            timestamp_ms,
            values,
        }
    }

    /// Create a sample from raw wire values. Missing channels read as raw zero.
    pub fn from_raw(timestamp_ms: u32, raw: &[i32]) -> Self {
        let values = CHANNELS
            .iter()
            .enumerate()
            .map(|(i, def)| def.to_physical(raw.get(i).copied().unwrap_or(0)))
            .collect();
        Self::new(timestamp_ms, values)
    }

    /// Timestamp as a duration
    pub fn timestamp(&self) -> Duration {
        Duration::from_millis(self.timestamp_ms as u64)
    }

    /// Value of the channel at `index`
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }

    /// Value of a channel by name
    pub fn value(&self, name: &str) -> Option<f64> {
        channel_index(name).and_then(|i| self.get(i))
    }

    /// Engine speed
    pub fn rpm(&self) -> f64 {
        self.get(0).unwrap_or_default()
    }

    /// Relative boost pressure in bar
    pub fn boost(&self) -> f64 {
        self.get(1).unwrap_or_default()
    }

    /// Wideband lambda
    pub fn lambda(&self) -> f64 {
        self.get(3).unwrap_or_default()
    }

    /// Exhaust gas temperature of thermocouple `n`
    pub fn egt(&self, n: usize) -> Option<f64> {
        if n >= super::channels::EGT_CHANNELS {
            return None;
        }
        self.get(FIRST_EGT_INDEX + n)
    }

    /// Hottest of the first `connected` thermocouples
    pub fn max_egt(&self, connected: usize) -> Option<f64> {
        (0..connected.min(super::channels::EGT_CHANNELS))
            .filter_map(|n| self.egt(n))
            .reduce(f64::max)
    }

    /// Check that every channel survives encoding and decoding.
    ///
    /// Values are compared after quantization to the wire type, which is what
    /// a decoder sees. Missing channels encode as raw zero.
    pub fn check_range(&self) -> Result<(), DecodeError> {
        for (i, def) in CHANNELS.iter().enumerate() {
            let value = self.get(i).unwrap_or(def.offset);
            if !def.in_range(def.to_physical(def.to_raw(value))) {
                return Err(DecodeError::OutOfRange {
                    field: def.name,
                    value,
                });
            }
        }
        Ok(())
    }

    /// Digifant manifold pressure in kPa for the fitted sensor
    pub fn df_map_kpa(&self, sensor: MapSensor) -> f64 {
        sensor.to_kpa(self.get(DF_MAP_INDEX).unwrap_or_default())
    }
}

/// Contents of a calibration map (e.g. N75 duty cycle or boost setpoint)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapResponse {
    /// Map identifier
    pub map_id: u8,
    /// X axis breakpoints
    pub axis_x: Vec<i16>,
    /// Y axis breakpoints
    pub axis_y: Vec<i16>,
    /// Cell values, row-major (`axis_y.len()` rows of `axis_x.len()` cells)
    pub values: Vec<i16>,
}

impl MapResponse {
    /// Cell at column `x`, row `y`
    pub fn cell(&self, x: usize, y: usize) -> Option<i16> {
        if x >= self.axis_x.len() {
            return None;
        }
        self.values.get(y * self.axis_x.len() + x).copied()
    }

    /// Check axis lengths and cell count against what the wire format carries
    pub fn check_shape(&self) -> Result<(), DecodeError> {
        for (field, len) in [
            ("map axis_x length", self.axis_x.len()),
            ("map axis_y length", self.axis_y.len()),
        ] {
            if len == 0 || len > MAX_MAP_AXIS {
                return Err(DecodeError::OutOfRange {
                    field,
                    value: len as f64,
                });
            }
        }
        let cells = self.axis_x.len() * self.axis_y.len();
        if self.values.len() != cells {
            return Err(DecodeError::Truncated {
                opcode: opcode::MAP_RESPONSE,
                expected: cells,
                actual: self.values.len(),
            });
        }
        Ok(())
    }
}

/// Boost PID controller settings of one channel
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidSettings {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Proportional gain of the aggressive set
    pub aggressive_kp: f64,
    /// Integral gain of the aggressive set
    pub aggressive_ki: f64,
    /// Derivative gain of the aggressive set
    pub aggressive_kd: f64,
    /// Control error above which the aggressive set is used
    pub aggressive_threshold: f64,
    /// Boost reduction per unit of lean lambda
    pub lambda_correction_factor: f64,
    /// PID control active
    pub enabled: bool,
    /// Lambda correction active
    pub lambda_correction: bool,
}

impl PidSettings {
    fn coefficients(&self) -> [f64; 8] {
        [
            self.kp,
            self.ki,
            self.kd,
            self.aggressive_kp,
            self.aggressive_ki,
            self.aggressive_kd,
            self.aggressive_threshold,
            self.lambda_correction_factor,
        ]
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.enabled {
            flags |= FLAG_PID_ENABLED;
        }
        if self.lambda_correction {
            flags |= FLAG_LAMBDA_CORRECTION;
        }
        flags
    }

    /// Append the wire form (coefficients + flags) to `out`
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for c in self.coefficients() {
            let mut buf = [0u8; 4];
            BigEndian::write_i32(&mut buf, (c * COEFFICIENT_SCALE).round() as i32);
            out.extend_from_slice(&buf);
        }
        out.push(self.flags());
    }
}

/// A decoded protocol record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// Periodic sensor sample
    DataSample(DataSample),
    /// Acknowledgement of the command with this opcode
    Ack(u8),
    /// Calibration map contents
    MapResponse(MapResponse),
    /// PID settings of one controller channel
    SettingsResponse {
        /// Controller channel
        channel: u8,
        /// Its settings
        settings: PidSettings,
    },
}

impl Record {
    /// Opcode this record is sent with
    pub fn opcode(&self) -> u8 {
        match self {
            Record::DataSample(_) => opcode::DATA_SAMPLE,
            Record::Ack(_) => opcode::ACK,
            Record::MapResponse(_) => opcode::MAP_RESPONSE,
            Record::SettingsResponse { .. } => opcode::SETTINGS_RESPONSE,
        }
    }
}

/// Decode a validated frame into a record
pub fn decode(frame: &Frame) -> Result<Record, DecodeError> {
    decode_payload(&frame.payload)
}

/// Decode a raw payload (opcode + body) into a record
pub fn decode_payload(payload: &[u8]) -> Result<Record, DecodeError> {
    let Some((&op, body)) = payload.split_first() else {
        return Err(DecodeError::Truncated {
            opcode: 0,
            expected: 1,
            actual: 0,
        });
    };

    match op {
        opcode::DATA_SAMPLE => decode_sample(body).map(Record::DataSample),
        opcode::ACK => {
            expect_len(op, body, 1)?;
            Ok(Record::Ack(body[0]))
        }
        opcode::MAP_RESPONSE => decode_map(body).map(Record::MapResponse),
        opcode::SETTINGS_RESPONSE => decode_settings(body),
        other => Err(DecodeError::UnknownType(other)),
    }
}

/// Encode a record into a payload (opcode + body).
///
/// Map responses must pass [`MapResponse::check_shape`].
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut out = vec![record.opcode()];
    match record {
        Record::DataSample(sample) => encode_sample(sample, &mut out),
        Record::Ack(code) => out.push(*code),
        Record::MapResponse(map) => {
            debug_assert!(map.check_shape().is_ok(), "malformed map {:?}", map);
            out.push(map.map_id);
            out.push(map.axis_x.len() as u8);
            out.push(map.axis_y.len() as u8);
            write_i16s(&map.axis_x, &mut out);
            write_i16s(&map.axis_y, &mut out);
            write_i16s(&map.values, &mut out);
        }
        Record::SettingsResponse { channel, settings } => {
            out.push(*channel);
            settings.write_to(&mut out);
        }
    }
    out
}

fn expect_len(op: u8, body: &[u8], len: usize) -> Result<(), DecodeError> {
    if body.len() != len {
        return Err(DecodeError::Truncated {
            opcode: op,
            expected: len + 1,
            actual: body.len() + 1,
        });
    }
    Ok(())
}

fn decode_sample(body: &[u8]) -> Result<DataSample, DecodeError> {
    expect_len(opcode::DATA_SAMPLE, body, sample_body_len())?;

    let timestamp_ms = BigEndian::read_u32(&body[0..4]);
    let mut offset = 4;
    let mut values = Vec::with_capacity(CHANNELS.len());

    for def in CHANNELS {
        let raw = match def.kind {
            ChannelKind::U8 => body[offset] as i32,
            ChannelKind::U16 => BigEndian::read_u16(&body[offset..offset + 2]) as i32,
            ChannelKind::I16 => BigEndian::read_i16(&body[offset..offset + 2]) as i32,
        };
        offset += def.kind.width();

        let value = def.to_physical(raw);
        if !def.in_range(value) {
            return Err(DecodeError::OutOfRange {
                field: def.name,
                value,
            });
        }
        values.push(value);
    }

    Ok(DataSample::new(timestamp_ms, values))
}

fn encode_sample(sample: &DataSample, out: &mut Vec<u8>) {
    let mut ts = [0u8; 4];
    BigEndian::write_u32(&mut ts, sample.timestamp_ms);
    out.extend_from_slice(&ts);

    for (i, def) in CHANNELS.iter().enumerate() {
        let raw = def.to_raw(sample.get(i).unwrap_or(def.offset));
        match def.kind {
            ChannelKind::U8 => out.push(raw as u8),
            ChannelKind::U16 => {
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, raw as u16);
                out.extend_from_slice(&buf);
            }
            ChannelKind::I16 => {
                let mut buf = [0u8; 2];
                BigEndian::write_i16(&mut buf, raw as i16);
                out.extend_from_slice(&buf);
            }
        }
    }
}

fn decode_map(body: &[u8]) -> Result<MapResponse, DecodeError> {
    if body.len() < 3 {
        return Err(DecodeError::Truncated {
            opcode: opcode::MAP_RESPONSE,
            expected: 4,
            actual: body.len() + 1,
        });
    }

    let map_id = body[0];
    let x_len = body[1] as usize;
    let y_len = body[2] as usize;

    for (field, len) in [("map axis_x length", x_len), ("map axis_y length", y_len)] {
        if len == 0 || len > MAX_MAP_AXIS {
            return Err(DecodeError::OutOfRange {
                field,
                value: len as f64,
            });
        }
    }

    let cells = x_len + y_len + x_len * y_len;
    expect_len(opcode::MAP_RESPONSE, body, 3 + cells * 2)?;

    let data = &body[3..];
    let axis_x = read_i16s(&data[..x_len * 2]);
    let axis_y = read_i16s(&data[x_len * 2..(x_len + y_len) * 2]);
    let values = read_i16s(&data[(x_len + y_len) * 2..]);

    Ok(MapResponse {
        map_id,
        axis_x,
        axis_y,
        values,
    })
}

fn decode_settings(body: &[u8]) -> Result<Record, DecodeError> {
    expect_len(opcode::SETTINGS_RESPONSE, body, SETTINGS_BODY_LEN)?;

    let channel = body[0];
    if channel >= PID_CHANNELS {
        return Err(DecodeError::OutOfRange {
            field: "pid channel",
            value: channel as f64,
        });
    }

    let mut c = [0f64; 8];
    for (i, slot) in c.iter_mut().enumerate() {
        let at = 1 + i * 4;
        *slot = BigEndian::read_i32(&body[at..at + 4]) as f64 / COEFFICIENT_SCALE;
    }

    let flags = body[SETTINGS_BODY_LEN - 1];
    if flags & !(FLAG_PID_ENABLED | FLAG_LAMBDA_CORRECTION) != 0 {
        return Err(DecodeError::OutOfRange {
            field: "pid flags",
            value: flags as f64,
        });
    }

    Ok(Record::SettingsResponse {
        channel,
        settings: PidSettings {
            kp: c[0],
            ki: c[1],
            kd: c[2],
            aggressive_kp: c[3],
            aggressive_ki: c[4],
            aggressive_kd: c[5],
            aggressive_threshold: c[6],
            lambda_correction_factor: c[7],
            enabled: flags & FLAG_PID_ENABLED != 0,
            lambda_correction: flags & FLAG_LAMBDA_CORRECTION != 0,
        },
    })
}

pub(crate) fn write_i16s(values: &[i16], out: &mut Vec<u8>) {
    for v in values {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, *v);
        out.extend_from_slice(&buf);
    }
}

fn read_i16s(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2).map(BigEndian::read_i16).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            decode_payload(&[0x7F, 0x00]),
            Err(DecodeError::UnknownType(0x7F))
        );
    }

    #[test]
    fn test_truncated_ack() {
        assert!(matches!(
            decode_payload(&[opcode::ACK]),
            Err(DecodeError::Truncated { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_sample_out_of_range() {
        // rpm raw 60000 is beyond the 12000 limit
        let mut raw = vec![0i32; CHANNELS.len()];
        raw[0] = 60000;
        let payload = encode_record(&Record::DataSample(DataSample::from_raw(10, &raw)));

        assert!(matches!(
            decode_payload(&payload),
            Err(DecodeError::OutOfRange { field: "rpm", .. })
        ));
    }

    #[test]
    fn test_sample_accessors() {
        let mut raw = vec![0i32; CHANNELS.len()];
        raw[0] = 3500;
        raw[1] = 850;
        raw[FIRST_EGT_INDEX] = 3200;
        raw[FIRST_EGT_INDEX + 1] = 3600;
        raw[FIRST_EGT_INDEX + 5] = 4000;
        let sample = DataSample::from_raw(1234, &raw);

        assert_eq!(sample.rpm(), 3500.0);
        assert_eq!(sample.value("rpm"), Some(3500.0));
        assert_eq!(sample.egt(1), Some(900.0));
        assert_eq!(sample.max_egt(5), Some(900.0));
        assert_eq!(sample.max_egt(8), Some(1000.0));
        assert_eq!(sample.timestamp(), Duration::from_millis(1234));
    }

    #[test]
    fn test_check_range_uses_wire_values() {
        let mut sample = DataSample::from_raw(0, &[]);
        assert_eq!(sample.check_range(), Ok(()));

        sample.values[0] = 12000.4;
        assert_eq!(sample.check_range(), Ok(()));

        sample.values[0] = 20000.0;
        assert_eq!(
            sample.check_range(),
            Err(DecodeError::OutOfRange {
                field: "rpm",
                value: 20000.0
            })
        );

        // Short samples encode missing channels as raw zero
        assert_eq!(DataSample::new(0, vec![]).check_range(), Ok(()));
    }

    #[test]
    fn test_map_shape() {
        let mut map = MapResponse {
            map_id: 1,
            axis_x: vec![0; MAX_MAP_AXIS],
            axis_y: vec![0],
            values: vec![0; MAX_MAP_AXIS],
        };
        assert_eq!(map.check_shape(), Ok(()));

        map.values.pop();
        assert!(matches!(map.check_shape(), Err(DecodeError::Truncated { .. })));

        map.axis_x = vec![0; 300];
        assert!(matches!(
            map.check_shape(),
            Err(DecodeError::OutOfRange { field: "map axis_x length", .. })
        ));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "malformed map")]
    fn test_encoding_malformed_map_panics_in_debug() {
        encode_record(&Record::MapResponse(MapResponse {
            map_id: 1,
            axis_x: vec![0; 2],
            axis_y: vec![0; 2],
            values: vec![0; 3],
        }));
    }

    #[test]
    fn test_map_cell_lookup() {
        let map = MapResponse {
            map_id: 1,
            axis_x: vec![1000, 2000, 3000],
            axis_y: vec![1, 2],
            values: vec![10, 20, 30, 40, 50, 60],
        };
        assert_eq!(map.cell(1, 1), Some(50));
        assert_eq!(map.cell(3, 0), None);
    }

    #[test]
    fn test_settings_flags_out_of_range() {
        let mut payload = encode_record(&Record::SettingsResponse {
            channel: 0,
            settings: PidSettings::default(),
        });
        *payload.last_mut().unwrap() = 0x80;
        assert!(matches!(
            decode_payload(&payload),
            Err(DecodeError::OutOfRange { field: "pid flags", .. })
        ));
    }
}
