//! Where extracted bytes go.
//!
//! Video and audio substreams are delivered as bare payload bytes in stream order, with no
//! re-framing.  Subtitle substreams carry their own timing, so each subtitle chunk is preceded
//! by a fixed-layout [`SubtitleRecord`]; downstream subtitle tooling parses that record, making
//! its byte layout a compatibility contract.

use std::io;
use std::io::Write;

/// Timing record written ahead of every subtitle payload chunk.
///
/// Wire layout, all integers little-endian:
///
/// | offset | size | field |
/// |--------|------|-------------------------------------------|
/// | 0      | 8    | marker `b"SUBTITLE"`                      |
/// | 8      | 4    | format version (`0x0003_0001`)            |
/// | 12     | 4    | record length after the marker (24)       |
/// | 16     | 8    | corrected presentation time, 90 kHz ticks |
/// | 24     | 4    | discontinuity counter at emission         |
/// | 28     | 4    | payload length in bytes                   |
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SubtitleRecord {
    /// presentation time in 90 kHz ticks, corrected for chapter discontinuities
    pub pts_ticks: u64,
    /// how many PTS discontinuities preceded this chunk
    pub discontinuities: u32,
    /// length of the payload that follows, in bytes
    pub payload_length: u32,
}

impl SubtitleRecord {
    /// The 8 bytes introducing every record.
    pub const MARKER: [u8; 8] = *b"SUBTITLE";
    /// Layout version of the record.
    pub const VERSION: u32 = 0x0003_0001;
    /// Size of the record following the marker.
    pub const RECORD_LEN: u32 = 24;
    /// Total encoded size including the marker.
    pub const ENCODED_LEN: usize = 32;

    /// Serialise the record, marker included.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&Self::MARKER);
        buf[8..12].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&Self::RECORD_LEN.to_le_bytes());
        buf[16..24].copy_from_slice(&self.pts_ticks.to_le_bytes());
        buf[24..28].copy_from_slice(&self.discontinuities.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_length.to_le_bytes());
        w.write_all(&buf)
    }
}

/// Receiver for the demuxed substream.
///
/// A chunk is written completely before the demuxer parses further input, so a blocking sink
/// naturally applies back-pressure to the whole session.
pub trait ChunkSink {
    /// A chunk of video or audio payload bytes.
    fn payload(&mut self, data: &[u8]) -> io::Result<()>;

    /// A subtitle payload chunk with its timing record.
    fn subtitle_chunk(&mut self, record: &SubtitleRecord, data: &[u8]) -> io::Result<()>;
}

/// A [`ChunkSink`] writing to any [`Write`] destination: payload bytes pass through unchanged,
/// subtitle chunks get their record prepended.
pub struct WriteSink<W: Write> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    /// Wrap the given writer.
    pub fn new(inner: W) -> WriteSink<W> {
        WriteSink { inner }
    }

    /// Recover the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ChunkSink for WriteSink<W> {
    fn payload(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }

    fn subtitle_chunk(&mut self, record: &SubtitleRecord, data: &[u8]) -> io::Result<()> {
        record.write_to(&mut self.inner)?;
        self.inner.write_all(data)
    }
}
