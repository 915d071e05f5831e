//! Log file formats
//!
//! `.mdv2` captures are the native format: a short header describing the
//! channel table followed by the same frames the unit sends on the wire.
//! CSV is export-only.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Local, Utc};
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::protocol::{
    decode, encode_frame, encode_record, ChannelDef, DataSample, DecodeError, FrameCodec,
    ProtocolError, Record, CHANNELS,
};

/// Magic bytes at the start of a capture file
pub const CAPTURE_MAGIC: &[u8; 4] = b"MDV2";

/// Current capture format version
pub const CAPTURE_VERSION: u16 = 2;

/// Capture file extension
pub const CAPTURE_EXTENSION: &str = "mdv2";

/// Fixed part of the header: magic, version, created, channel count
const FIXED_HEADER_LEN: usize = 4 + 2 + 8 + 2;

/// Capture file errors. Loading never touches the current data on error.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// File does not start with the capture magic
    #[error("Not a capture file")]
    BadMagic,

    /// Written by a newer or older format revision
    #[error("Unsupported capture version {0}")]
    UnsupportedVersion(u16),

    /// File ends inside the header
    #[error("Capture header truncated")]
    TruncatedHeader,

    /// Channel table differs from the one this build decodes
    #[error("Capture channel table incompatible: {0}")]
    IncompatibleChannels(String),

    /// Frame encoding failed while saving
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A sample holds values the wire format cannot carry
    #[error("Sample {index} cannot be stored: {source}")]
    Unrepresentable {
        /// Position in the data set
        index: usize,
        /// Offending channel
        source: DecodeError,
    },
}

/// Recoverable problems found while loading a capture
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureWarning {
    /// The file ends inside a record
    #[error("Capture ends with an incomplete record ({bytes} bytes ignored)")]
    TruncatedTail {
        /// Trailing bytes dropped
        bytes: usize,
    },

    /// Frames in the body failed validation and were skipped
    #[error("Skipped {frames} corrupt frames ({bytes} bytes)")]
    CorruptFrames {
        /// Invalid frames
        frames: u64,
        /// Bytes discarded while resynchronizing
        bytes: u64,
    },

    /// A frame was intact but its record did not decode
    #[error("Skipped record {index}: {reason}")]
    SkippedRecord {
        /// Frame index in the body
        index: usize,
        /// Decoder message
        reason: String,
    },
}

/// Outcome of a successful load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Samples now in the store
    pub samples: usize,
    /// Problems that did not prevent the load
    pub warnings: Vec<CaptureWarning>,
}

/// Supported log file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Native binary capture (.mdv2)
    Capture,
    /// Comma-separated values
    Csv,
}

impl LogFormat {
    /// Detect format from file extension
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            CAPTURE_EXTENSION => Some(LogFormat::Capture),
            "csv" => Some(LogFormat::Csv),
            _ => None,
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Capture => CAPTURE_EXTENSION,
            LogFormat::Csv => "csv",
        }
    }
}

/// Capture file header
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureHeader {
    /// Format revision
    pub version: u16,
    /// When the capture was written
    pub created: DateTime<Utc>,
    /// `(id, name)` pairs in sample order
    pub channels: Vec<(u8, String)>,
}

impl CaptureHeader {
    /// Header describing the built-in channel table
    pub fn current() -> Self {
        Self {
            version: CAPTURE_VERSION,
            created: Utc::now(),
            channels: CHANNELS
                .iter()
                .map(|c: &ChannelDef| (c.id, c.name.to_string()))
                .collect(),
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(CAPTURE_MAGIC)?;
        w.write_u16::<BigEndian>(self.version)?;
        w.write_i64::<BigEndian>(self.created.timestamp_millis())?;
        w.write_u16::<BigEndian>(self.channels.len() as u16)?;
        for (id, name) in &self.channels {
            let name = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
            w.write_u8(*id)?;
            w.write_u8(name.len() as u8)?;
            w.write_all(name)?;
        }
        Ok(())
    }

    /// Parse a header, returning it and its encoded length
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CaptureError> {
        if data.len() < CAPTURE_MAGIC.len() || &data[..4] != CAPTURE_MAGIC {
            return Err(CaptureError::BadMagic);
        }
        if data.len() < FIXED_HEADER_LEN {
            return Err(CaptureError::TruncatedHeader);
        }

        let mut cursor = Cursor::new(&data[4..]);
        let truncated = |_: io::Error| CaptureError::TruncatedHeader;

        let version = cursor.read_u16::<BigEndian>().map_err(truncated)?;
        if version != CAPTURE_VERSION {
            return Err(CaptureError::UnsupportedVersion(version));
        }
        let created_ms = cursor.read_i64::<BigEndian>().map_err(truncated)?;
        let count = cursor.read_u16::<BigEndian>().map_err(truncated)?;

        let mut channels = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = cursor.read_u8().map_err(truncated)?;
            let len = cursor.read_u8().map_err(truncated)? as usize;
            let mut name = vec![0u8; len];
            cursor.read_exact(&mut name).map_err(truncated)?;
            channels.push((id, String::from_utf8_lossy(&name).into_owned()));
        }

        let header = Self {
            version,
            created: DateTime::from_timestamp_millis(created_ms).unwrap_or_default(),
            channels,
        };
        Ok((header, 4 + cursor.position() as usize))
    }

    /// Check the channel table matches the one this build decodes
    pub fn check_compatible(&self) -> Result<(), CaptureError> {
        if self.channels.len() != CHANNELS.len() {
            return Err(CaptureError::IncompatibleChannels(format!(
                "expected {} channels, found {}",
                CHANNELS.len(),
                self.channels.len()
            )));
        }
        for ((id, name), def) in self.channels.iter().zip(CHANNELS) {
            if *id != def.id || name != def.name {
                return Err(CaptureError::IncompatibleChannels(format!(
                    "channel {} is '{}', expected '{}'",
                    id, name, def.name
                )));
            }
        }
        Ok(())
    }
}

/// A parsed capture file
#[derive(Debug, Clone)]
pub struct Capture {
    /// Validated header
    pub header: CaptureHeader,
    /// Samples that decoded cleanly, in file order
    pub samples: Vec<DataSample>,
    /// Problems skipped over while reading
    pub warnings: Vec<CaptureWarning>,
}

impl Capture {
    /// Summary of this capture as a load report
    pub fn report(&self) -> LoadReport {
        LoadReport {
            samples: self.samples.len(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Parse a capture from memory
pub fn parse_capture(data: &[u8]) -> Result<Capture, CaptureError> {
    let (header, offset) = CaptureHeader::parse(data)?;
    header.check_compatible()?;

    let mut codec = FrameCodec::with_limit(usize::MAX);
    let mut frames = codec.feed(&data[offset..])?;
    let (tail, discarded) = codec.finish();
    frames.extend(tail);

    let mut warnings = Vec::new();
    let stats = codec.stats();
    if stats.errors() > 0 {
        warnings.push(CaptureWarning::CorruptFrames {
            frames: stats.errors(),
            bytes: stats.discarded_bytes,
        });
    }
    if discarded > 0 {
        warnings.push(CaptureWarning::TruncatedTail { bytes: discarded });
    }

    let mut samples = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        match decode(frame) {
            Ok(Record::DataSample(sample)) => samples.push(sample),
            Ok(other) => warnings.push(CaptureWarning::SkippedRecord {
                index,
                reason: format!("unexpected record type 0x{:02X}", other.opcode()),
            }),
            Err(e) => warnings.push(CaptureWarning::SkippedRecord {
                index,
                reason: e.to_string(),
            }),
        }
    }

    for w in &warnings {
        warn!("Capture: {}", w);
    }

    Ok(Capture {
        header,
        samples,
        warnings,
    })
}

/// Read a capture file
pub fn read_capture(path: &Path) -> Result<Capture, CaptureError> {
    let data = fs::read(path)?;
    parse_capture(&data)
}

/// Encode samples as a capture into `w`
pub fn encode_capture<W: Write>(w: &mut W, samples: &[Arc<DataSample>]) -> Result<(), CaptureError> {
    // Every sample must load back
    for (index, sample) in samples.iter().enumerate() {
        sample
            .check_range()
            .map_err(|source| CaptureError::Unrepresentable { index, source })?;
    }

    CaptureHeader::current().write_to(w)?;
    for sample in samples {
        let payload = encode_record(&Record::DataSample(DataSample::clone(sample)));
        w.write_all(&encode_frame(&payload)?)?;
    }
    Ok(())
}

/// Write a capture file. The file is written next to `path` and renamed
/// into place, so a failed save never leaves a partial capture behind.
pub fn write_capture(path: &Path, samples: &[Arc<DataSample>]) -> Result<(), CaptureError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = File::create(&tmp).map_err(CaptureError::from).and_then(|file| {
        let mut writer = BufWriter::new(file);
        encode_capture(&mut writer, samples)?;
        writer.flush()?;
        Ok(())
    });

    match result {
        Ok(()) => Ok(fs::rename(&tmp, path)?),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Write samples to a CSV file
pub fn write_csv<P: AsRef<Path>>(path: P, samples: &[Arc<DataSample>]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    // Write header
    write!(writer, "Time")?;
    for channel in CHANNELS {
        write!(writer, ",{}", channel.name)?;
    }
    writeln!(writer)?;

    // Write data rows
    for sample in samples {
        write!(writer, "{:.3}", sample.timestamp().as_secs_f64())?;
        for (value, def) in sample.values.iter().zip(CHANNELS) {
            write!(writer, ",{:.*}", def.digits, value)?;
        }
        writeln!(writer)?;
    }

    writer.flush()?;
    Ok(())
}

/// Default capture path: `<dir>/YYYY-MM-DDTHHMM.mdv2`.
///
/// Without `dir` the user's documents directory is used, falling back to
/// the working directory.
pub fn default_capture_path(dir: Option<&Path>, now: DateTime<Local>) -> PathBuf {
    let dir = dir
        .map(Path::to_path_buf)
        .or_else(dirs::document_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!("{}.{}", now.format("%Y-%m-%dT%H%M"), CAPTURE_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            LogFormat::from_extension(Path::new("run.MDV2")),
            Some(LogFormat::Capture)
        );
        assert_eq!(
            LogFormat::from_extension(Path::new("log.csv")),
            Some(LogFormat::Csv)
        );
        assert_eq!(LogFormat::from_extension(Path::new("log.txt")), None);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = CaptureHeader::current();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();

        let (parsed, len) = CaptureHeader::parse(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(parsed.channels, header.channels);
        assert_eq!(
            parsed.created.timestamp_millis(),
            header.created.timestamp_millis()
        );
        parsed.check_compatible().unwrap();
    }

    #[test]
    fn test_header_rejects() {
        assert!(matches!(
            CaptureHeader::parse(b"MDV1xxxxxxxxxxxxxxxx"),
            Err(CaptureError::BadMagic)
        ));

        let mut buf = Vec::new();
        CaptureHeader::current().write_to(&mut buf).unwrap();
        buf[5] = 3;
        assert!(matches!(
            CaptureHeader::parse(&buf),
            Err(CaptureError::UnsupportedVersion(3))
        ));

        let mut buf = Vec::new();
        CaptureHeader::current().write_to(&mut buf).unwrap();
        assert!(matches!(
            CaptureHeader::parse(&buf[..buf.len() - 2]),
            Err(CaptureError::TruncatedHeader)
        ));
    }

    #[test]
    fn test_incompatible_channels() {
        let mut header = CaptureHeader::current();
        header.channels[1].1 = "map".into();
        assert!(matches!(
            header.check_compatible(),
            Err(CaptureError::IncompatibleChannels(_))
        ));
    }

    #[test]
    fn test_default_capture_path() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 59).unwrap();
        let path = default_capture_path(Some(Path::new("/tmp/logs")), now);
        assert_eq!(path, PathBuf::from("/tmp/logs/2024-03-09T1405.mdv2"));
    }
}
