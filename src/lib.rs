//! Demultiplexing of MPEG-1/2 _Program Stream_ and _Transport Stream_ multiplexes, extracting a
//! single selected elementary substream (video, MPEG audio, AC-3, DTS, LPCM or DVD subtitle
//! data) as a clean byte stream, together with recovered PTS/DTS timing.
//!
//! # Design principals
//!
//!  * *Untrusted input*.  The scan loops resynchronise on damaged start codes where the format
//!    allows it, and fail fast where it does not (pack headers, TS sync bytes).
//!  * *Avoid copying* where practical.  Parsers borrow slices of the session's scan buffer;
//!    bytes are only staged in side buffers where a header genuinely straddles a refill or
//!    Transport Stream packet boundary.
//!  * *Explicit sessions*.  All mutable state (scan buffer, reassembly state, timeline) lives in
//!    a session object owned by the caller; there are no process-wide statics, and multiple
//!    sessions may run concurrently in one process.
//!  * *Blocking, caller-driven I/O*.  A session pulls from a [`std::io::Read`] and pushes to a
//!    [`sink::ChunkSink`]; it performs no internal threading.
//!
//! # Example
//!
//! ```
//! use mpeg2ps_demux::session::DemuxSession;
//! use mpeg2ps_demux::sink::WriteSink;
//! use mpeg2ps_demux::substream::{CodecId, Desired, Selection};
//! use mpeg2ps_demux::ContainerKind;
//!
//! # fn main() -> Result<(), mpeg2ps_demux::DemuxError> {
//! let src: &[u8] = &[];  // normally a File
//! let mut sink = WriteSink::new(Vec::new());
//! let selection = Selection {
//!     desired: Desired::Audio,
//!     track: 0,
//!     codec_hint: Some(CodecId::Ac3),
//! };
//! let stats = DemuxSession::new(ContainerKind::ProgramStream, selection)
//!     .run(&mut &src[..], &mut sink)?;
//! assert_eq!(stats.bytes_emitted, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible, missing_docs)]

pub mod buffer;
pub mod lpcm;
pub mod pack;
pub mod pes;
pub mod ps;
pub mod session;
pub mod sink;
pub mod startcode;
pub mod substream;
pub mod timeline;
pub mod ts;

use std::io;

/// The multiplex layout of the source data, as determined by the caller (normally by a
/// content-probing step outside this crate).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ContainerKind {
    /// An MPEG-1/2 Program Stream (`.mpg`, `.vob`): PES packets delimited by start codes,
    /// without fixed packet size.
    ProgramStream,
    /// An MPEG-2 Transport Stream of fixed 188-byte packets; only packets carrying the given
    /// _Packet Identifier_ are demultiplexed.
    TransportStream {
        /// PID of the sub-stream to extract, `0x0000..=0x1fff`.
        pid: u16,
    },
    /// No multiplexing at all: the source is already an elementary stream and is copied to the
    /// sink unmodified.
    Raw,
}

/// Error terminating a demux session.
///
/// Only conditions that make the current stream *position* unrecoverable appear here; a merely
/// malformed packet is logged and skipped, and running out of input is a clean end of session,
/// not an error.
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    /// Reading the source or writing the sink failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A `0xba` start code was not followed by a recognisable MPEG-1 or MPEG-2 pack header.
    #[error("malformed pack header at offset {offset:#x}: leading byte {leading_byte:#04x}")]
    MalformedPackHeader {
        /// absolute source offset of the byte following the pack start code
        offset: u64,
        /// the unrecognised byte found there
        leading_byte: u8,
    },
    /// A Transport Stream record did not begin with the `0x47` sync byte.  TS packet boundaries
    /// are not self-describing, so no resynchronisation is attempted.
    #[error("bad transport stream sync byte {actual:#04x} at offset {offset:#x}")]
    BadSyncByte {
        /// absolute source offset of the offending record
        offset: u64,
        /// the byte found where `0x47` was required
        actual: u8,
    },
    /// An LPCM substream declared a sample quantization this crate cannot unpack.
    #[error("unsupported LPCM quantization code {0}")]
    UnsupportedQuantization(u8),
    /// An LPCM substream's frame layout was internally inconsistent.
    #[error("unsupported LPCM layout: first access unit at {access_unit_offset} in a {payload_len} byte payload")]
    UnsupportedLayout {
        /// the claimed offset of the first access unit
        access_unit_offset: u16,
        /// the actual payload size it should fall within
        payload_len: usize,
    },
}

/// Counters accumulated over a demux session, returned on success.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemuxStats {
    /// payload bytes delivered to the sink (excluding subtitle record framing)
    pub bytes_emitted: u64,
    /// number of payload chunks delivered to the sink
    pub chunks: u64,
    /// PES packets inspected, whether or not they were selected for output
    pub pes_packets: u64,
    /// timestamp discontinuities detected on the video timeline
    pub discontinuities: u32,
}
