//! The Transport Stream demultiplexer: fixed 188-byte packets, PID filtering, and PES packet
//! reassembly.
//!
//! A PES packet is usually split across many TS packets, and even its *header* can straddle a
//! packet boundary, so the session keeps explicit reassembly state between packets of the
//! filtered PID: header bytes accumulate in a small side buffer until
//! [`crate::pes::PesHeader::parse()`] succeeds, after which payload bytes stream straight to the
//! sink until the packet's declared length is exhausted.  "Need more data" here means "wait for
//! the next TS packet of this PID", not "refill the same buffer" as in the Program Stream path.

use crate::lpcm;
use crate::pes::{PesHeader, PesHeaderError, Timestamp};
use crate::ps::deliver;
use crate::sink::{ChunkSink, SubtitleRecord};
use crate::substream::{route, RouteDecision, Selection, SubstreamId};
use crate::timeline::TimestampTracker;
use crate::{DemuxError, DemuxStats};
use fixedbitset::FixedBitSet;
use log::{debug, warn};
use std::io;
use std::io::Read;
use std::mem;

const PACKET_SIZE: usize = 188;

/// A borrowed view of one fixed-size Transport Stream packet.
pub struct TsPacket<'buf> {
    buf: &'buf [u8; PACKET_SIZE],
}

impl<'buf> TsPacket<'buf> {
    /// The value `0x47`, which must appear in the first byte of every TS packet.
    pub const SYNC_BYTE: u8 = 0x47;

    /// The fixed 188 byte size of a TS packet.
    pub const SIZE: usize = PACKET_SIZE;

    /// True if the given value is the required synchronisation byte.
    #[inline]
    pub fn is_sync_byte(b: u8) -> bool {
        b == Self::SYNC_BYTE
    }

    /// Wrap a packet-sized buffer.  The caller is expected to have checked the sync byte
    /// already; the accessors do not depend on it.
    pub fn new(buf: &'buf [u8; PACKET_SIZE]) -> TsPacket<'buf> {
        TsPacket { buf }
    }

    /// Set when an upstream processor detected an uncorrectable bit error in this packet.
    pub fn transport_error_indicator(&self) -> bool {
        self.buf[1] & 0b1000_0000 != 0
    }

    /// True if this packet's payload holds the start of a new PES packet.
    pub fn payload_unit_start_indicator(&self) -> bool {
        self.buf[1] & 0b0100_0000 != 0
    }

    /// The 13-bit Packet Identifier naming the sub-stream this packet belongs to.
    pub fn pid(&self) -> u16 {
        u16::from(self.buf[1] & 0b0001_1111) << 8 | u16::from(self.buf[2])
    }

    /// True if the packet carries an adaptation field before any payload.
    pub fn has_adaptation_field(&self) -> bool {
        self.buf[3] & 0b0010_0000 != 0
    }

    /// True if the packet carries payload bytes.
    pub fn has_payload(&self) -> bool {
        self.buf[3] & 0b0001_0000 != 0
    }

    /// The 4-bit counter used to detect lost packets; increments (mod 16) per payload-carrying
    /// packet of a PID.
    pub fn continuity_counter(&self) -> u8 {
        self.buf[3] & 0b0000_1111
    }

    /// The payload bytes, after any adaptation field.  `None` if the packet carries no payload,
    /// or if the adaptation field length is malformed and leaves no room for one.
    pub fn payload(&self) -> Option<&'buf [u8]> {
        if !self.has_payload() {
            return None;
        }
        let offset = if self.has_adaptation_field() {
            5 + usize::from(self.buf[4])
        } else {
            4
        };
        if offset >= Self::SIZE {
            warn!("adaptation field length {} leaves no payload", self.buf[4]);
            return None;
        }
        Some(&self.buf[offset..])
    }
}

// largest possible MPEG-2 PES header: 9 fixed bytes plus 255 of header data
const MAX_PENDING_HEADER: usize = 264;

/// Cross-packet PES reassembly state for the filtered PID.
enum Reassembly {
    /// between PES packets, waiting for a payload unit start
    Idle,
    /// abandoning the current PES packet; discard payload until the next unit start
    IgnoreRest,
    /// accumulating PES header bytes
    Header { pending: Vec<u8> },
    /// header complete on a private stream 1 packet, but its sub-stream id byte has not
    /// arrived yet
    AwaitSubId {
        pts: Option<Timestamp>,
        remaining: Option<usize>,
    },
    /// streaming selected payload bytes straight through
    Stream { remaining: Option<usize> },
    /// dropping the sub-multiplex prefix bytes, then streaming
    DropThenStream {
        drop: usize,
        remaining: Option<usize>,
    },
    /// accumulating the 7-byte LPCM prefix so the sample format can be read
    LpcmPrefix {
        got: Vec<u8>,
        remaining: Option<usize>,
        total: Option<usize>,
    },
    /// de-interleaving LPCM sample data
    LpcmStream {
        quantization: lpcm::Quantization,
        remaining: Option<usize>,
    },
    /// buffering a whole subtitle payload so its record can be written up front
    Subtitle {
        buf: Vec<u8>,
        remaining: usize,
        pts_ticks: u64,
    },
    /// unselected packet; consume and discard its payload
    Skip { remaining: Option<usize> },
}

/// bytes of `payload` belonging to the current PES packet, and the remaining count after them
fn split_remaining(remaining: Option<usize>, payload: &[u8]) -> (usize, Option<usize>) {
    match remaining {
        None => (payload.len(), None),
        Some(r) => {
            let take = r.min(payload.len());
            if take < payload.len() {
                debug!("{} bytes beyond the PES packet length ignored", payload.len() - take);
            }
            (take, Some(r - take))
        }
    }
}

fn done(remaining: Option<usize>) -> bool {
    remaining == Some(0)
}

/// One Transport Stream demux session.
pub struct TsDemuxer {
    pid: u16,
    selection: Selection,
    timeline: TimestampTracker,
    lpcm: lpcm::Deinterleaver,
    lpcm_out: Vec<u8>,
    state: Reassembly,
    last_continuity: Option<u8>,
    seen_pids: FixedBitSet,
    last_subtitle_ticks: u64,
    stats: DemuxStats,
    position: u64,
}

impl TsDemuxer {
    /// Create a session extracting `selection` from the sub-stream with the given PID.
    pub fn new(pid: u16, selection: Selection) -> TsDemuxer {
        TsDemuxer {
            pid: pid & 0x1fff,
            selection,
            timeline: TimestampTracker::new(),
            lpcm: lpcm::Deinterleaver::new(),
            lpcm_out: Vec::new(),
            state: Reassembly::Idle,
            last_continuity: None,
            seen_pids: FixedBitSet::with_capacity(0x2000),
            last_subtitle_ticks: 0,
            stats: DemuxStats::default(),
            position: 0,
        }
    }

    /// Demultiplex `src` to `sink` until end of input.
    pub fn run<R: Read, S: ChunkSink>(
        mut self,
        src: &mut R,
        sink: &mut S,
    ) -> Result<DemuxStats, DemuxError> {
        let mut buf = [0u8; PACKET_SIZE];
        loop {
            match read_record(src, &mut buf)? {
                RecordRead::Eof => {
                    if let Reassembly::Subtitle { remaining, .. } = &self.state {
                        warn!("end of input inside a subtitle packet ({} bytes short)", remaining);
                    }
                    self.stats.discontinuities = self.timeline.discontinuity_count();
                    return Ok(self.stats.clone());
                }
                RecordRead::Short(n) => {
                    debug!("end of stream ({} byte partial record)", n);
                    self.stats.discontinuities = self.timeline.discontinuity_count();
                    return Ok(self.stats.clone());
                }
                RecordRead::Full => {}
            }
            self.consume(&buf, sink)?;
            self.position += TsPacket::SIZE as u64;
        }
    }

    fn consume<S: ChunkSink>(
        &mut self,
        buf: &[u8; PACKET_SIZE],
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        if !TsPacket::is_sync_byte(buf[0]) {
            return Err(DemuxError::BadSyncByte {
                offset: self.position,
                actual: buf[0],
            });
        }
        let pk = TsPacket::new(buf);
        let pid = pk.pid();
        if pid != self.pid {
            if !self.seen_pids.contains(usize::from(pid)) {
                debug!("ignoring pid {:#06x}", pid);
                self.seen_pids.insert(usize::from(pid));
            }
            return Ok(());
        }
        if !self.is_continuous(&pk) {
            warn!("continuity counter gap on pid {:#06x}; dropping current PES packet", pid);
            if !matches!(self.state, Reassembly::Idle) {
                self.state = Reassembly::IgnoreRest;
            }
        }
        self.last_continuity = Some(pk.continuity_counter());
        let payload = match pk.payload() {
            Some(p) => p,
            None => return Ok(()),
        };
        if pk.payload_unit_start_indicator() {
            self.begin_packet(payload, sink)
        } else {
            self.continue_packet(payload, sink)
        }
    }

    // the counter only increases when the packet has a payload,
    fn is_continuous(&self, pk: &TsPacket<'_>) -> bool {
        match self.last_continuity {
            None => true,
            Some(last) => {
                if pk.has_payload() {
                    (last + 1) & 0xf == pk.continuity_counter()
                } else {
                    last == pk.continuity_counter()
                }
            }
        }
    }

    fn begin_packet<S: ChunkSink>(
        &mut self,
        payload: &[u8],
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        match &self.state {
            Reassembly::Idle | Reassembly::IgnoreRest => {}
            Reassembly::Header { .. } => warn!("new PES packet while a header was incomplete"),
            Reassembly::Subtitle { remaining, .. } => {
                warn!("subtitle packet truncated {} bytes short - dropped", remaining)
            }
            Reassembly::Stream { remaining: Some(r) }
            | Reassembly::DropThenStream { remaining: Some(r), .. }
            | Reassembly::LpcmStream { remaining: Some(r), .. }
                if *r > 0 =>
            {
                warn!("PES packet truncated {} bytes short", r)
            }
            _ => {}
        }
        self.state = Reassembly::Header {
            pending: payload.to_vec(),
        };
        self.advance_header(sink)
    }

    fn continue_packet<S: ChunkSink>(
        &mut self,
        payload: &[u8],
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        let state = mem::replace(&mut self.state, Reassembly::IgnoreRest);
        self.state = match state {
            Reassembly::Idle => {
                warn!("payload without a preceding payload_unit_start - ignored");
                Reassembly::Idle
            }
            Reassembly::IgnoreRest => Reassembly::IgnoreRest,
            Reassembly::Header { mut pending } => {
                if pending.len() + payload.len() > MAX_PENDING_HEADER + TsPacket::SIZE {
                    warn!("PES header never completed within {} bytes - dropped", pending.len());
                    Reassembly::IgnoreRest
                } else {
                    pending.extend_from_slice(payload);
                    self.state = Reassembly::Header { pending };
                    self.advance_header(sink)?;
                    return Ok(());
                }
            }
            Reassembly::AwaitSubId { pts, remaining } => {
                let (take, rem) = split_remaining(remaining, payload);
                self.dispatch(0xbd, pts, remaining, &payload[..take], rem, sink)?
            }
            Reassembly::Stream { remaining } => {
                let (take, rem) = split_remaining(remaining, payload);
                if take > 0 {
                    deliver(&mut self.stats, sink, &payload[..take])?;
                }
                if done(rem) {
                    Reassembly::Idle
                } else {
                    Reassembly::Stream { remaining: rem }
                }
            }
            Reassembly::DropThenStream { drop, remaining } => {
                let (take, rem) = split_remaining(remaining, payload);
                let used = &payload[..take];
                let dropped = drop.min(used.len());
                if used.len() > dropped {
                    deliver(&mut self.stats, sink, &used[dropped..])?;
                }
                if done(rem) {
                    Reassembly::Idle
                } else if dropped < drop {
                    Reassembly::DropThenStream {
                        drop: drop - dropped,
                        remaining: rem,
                    }
                } else {
                    Reassembly::Stream { remaining: rem }
                }
            }
            Reassembly::LpcmPrefix {
                mut got,
                remaining,
                total,
            } => {
                let (take, rem) = split_remaining(remaining, payload);
                let used = &payload[..take];
                let need = 7 - got.len();
                if used.len() < need {
                    got.extend_from_slice(used);
                    if done(rem) {
                        warn!("LPCM packet ended inside its headers - dropped");
                        Reassembly::Idle
                    } else {
                        Reassembly::LpcmPrefix {
                            got,
                            remaining: rem,
                            total,
                        }
                    }
                } else {
                    got.extend_from_slice(&used[..need]);
                    let quantization = self.check_lpcm_prefix(&got, total)?;
                    self.emit_lpcm(quantization, &used[need..], sink)?;
                    if done(rem) {
                        Reassembly::Idle
                    } else {
                        Reassembly::LpcmStream {
                            quantization,
                            remaining: rem,
                        }
                    }
                }
            }
            Reassembly::LpcmStream {
                quantization,
                remaining,
            } => {
                let (take, rem) = split_remaining(remaining, payload);
                self.emit_lpcm(quantization, &payload[..take], sink)?;
                if done(rem) {
                    Reassembly::Idle
                } else {
                    Reassembly::LpcmStream {
                        quantization,
                        remaining: rem,
                    }
                }
            }
            Reassembly::Subtitle {
                mut buf,
                remaining,
                pts_ticks,
            } => {
                let take = remaining.min(payload.len());
                buf.extend_from_slice(&payload[..take]);
                let remaining = remaining - take;
                if remaining == 0 {
                    self.emit_subtitle(pts_ticks, &buf, sink)?;
                    Reassembly::Idle
                } else {
                    Reassembly::Subtitle {
                        buf,
                        remaining,
                        pts_ticks,
                    }
                }
            }
            Reassembly::Skip { remaining } => {
                let (_, rem) = split_remaining(remaining, payload);
                if done(rem) {
                    Reassembly::Idle
                } else {
                    Reassembly::Skip { remaining: rem }
                }
            }
        };
        Ok(())
    }

    /// Try to complete the header held in `Reassembly::Header`; on success, route the packet
    /// and move to the appropriate payload state.
    fn advance_header<S: ChunkSink>(&mut self, sink: &mut S) -> Result<(), DemuxError> {
        let pending = match mem::replace(&mut self.state, Reassembly::IgnoreRest) {
            Reassembly::Header { pending } => pending,
            other => {
                self.state = other;
                return Ok(());
            }
        };
        if pending.len() >= 3 && pending[..3] != [0, 0, 1] {
            warn!("payload_unit_start without a PES start code - ignored");
            self.state = Reassembly::IgnoreRest;
            return Ok(());
        }
        self.state = match PesHeader::parse(&pending) {
            Err(PesHeaderError::NotEnoughData { .. }) => {
                if pending.len() > MAX_PENDING_HEADER {
                    warn!("PES header overran the {} byte bound - dropped", MAX_PENDING_HEADER);
                    Reassembly::IgnoreRest
                } else {
                    Reassembly::Header { pending }
                }
            }
            Err(PesHeaderError::TooMuchStuffing) => {
                warn!("too much stuffing");
                Reassembly::IgnoreRest
            }
            Err(PesHeaderError::UnparseableTimestampFlags { flags }) => {
                warn!(
                    "unparseable MPEG-1 timestamp flags {:#04x} - skipping packet",
                    flags
                );
                Reassembly::IgnoreRest
            }
            Ok(header) => {
                self.stats.pes_packets += 1;
                let stream_id = pending[3];
                if (0xe0..=0xef).contains(&stream_id) {
                    if let Some(pts) = header.pts {
                        self.timeline.observe_video_pts(pts);
                    }
                }
                let total = if header.packet_length == 0 {
                    None
                } else {
                    let total = 6 + usize::from(header.packet_length);
                    if total < header.payload_offset {
                        warn!("PES header overruns its declared packet length - dropped");
                        self.state = Reassembly::IgnoreRest;
                        return Ok(());
                    }
                    Some(total - header.payload_offset)
                };
                let first = &pending[header.payload_offset.min(pending.len())..];
                let (take, rem) = split_remaining(total, first);
                self.dispatch(stream_id, header.pts, total, &first[..take], rem, sink)?
            }
        };
        Ok(())
    }

    /// Decide what to do with a PES packet whose header (and possibly first payload bytes,
    /// `first`) are in hand.  `total` is the full payload length, `remaining` the length still
    /// to come after `first`.
    fn dispatch<S: ChunkSink>(
        &mut self,
        stream_id: u8,
        pts: Option<Timestamp>,
        total: Option<usize>,
        first: &[u8],
        remaining: Option<usize>,
        sink: &mut S,
    ) -> Result<Reassembly, DemuxError> {
        if stream_id == 0xbd && first.is_empty() {
            if done(remaining) {
                return Ok(Reassembly::Idle);
            }
            return Ok(Reassembly::AwaitSubId { pts, remaining });
        }
        let sub = if stream_id == 0xbd {
            first.first().copied()
        } else {
            None
        };
        let kind = match route(stream_id, sub, &self.selection) {
            RouteDecision::Discard => {
                return Ok(if done(remaining) {
                    Reassembly::Idle
                } else {
                    Reassembly::Skip { remaining }
                })
            }
            RouteDecision::Emit(kind) => kind,
        };
        Ok(match kind {
            SubstreamId::Video | SubstreamId::MpegAudio(_) => {
                if !first.is_empty() {
                    deliver(&mut self.stats, sink, first)?;
                }
                if done(remaining) {
                    Reassembly::Idle
                } else {
                    Reassembly::Stream { remaining }
                }
            }
            SubstreamId::Ac3(_) | SubstreamId::Dts(_) => {
                let drop = kind.payload_prefix_len();
                let dropped = drop.min(first.len());
                if first.len() > dropped {
                    deliver(&mut self.stats, sink, &first[dropped..])?;
                }
                if done(remaining) {
                    Reassembly::Idle
                } else if dropped < drop {
                    Reassembly::DropThenStream {
                        drop: drop - dropped,
                        remaining,
                    }
                } else {
                    Reassembly::Stream { remaining }
                }
            }
            SubstreamId::Lpcm(_) => {
                if first.len() < 7 {
                    if done(remaining) {
                        warn!("LPCM packet ended inside its headers - dropped");
                        Reassembly::Idle
                    } else {
                        Reassembly::LpcmPrefix {
                            got: first.to_vec(),
                            remaining,
                            total,
                        }
                    }
                } else {
                    let quantization = self.check_lpcm_prefix(&first[..7], total)?;
                    self.emit_lpcm(quantization, &first[7..], sink)?;
                    if done(remaining) {
                        Reassembly::Idle
                    } else {
                        Reassembly::LpcmStream {
                            quantization,
                            remaining,
                        }
                    }
                }
            }
            SubstreamId::Subtitle(_) => {
                if let Some(pts) = pts {
                    self.last_subtitle_ticks = self.timeline.stamp_ticks(pts);
                }
                let pts_ticks = self.last_subtitle_ticks;
                match total {
                    None => {
                        warn!("unbounded subtitle PES packet is not representable - dropped");
                        Reassembly::IgnoreRest
                    }
                    Some(total) => {
                        let mut buf = Vec::with_capacity(total);
                        buf.extend_from_slice(first);
                        if buf.len() == total {
                            self.emit_subtitle(pts_ticks, &buf, sink)?;
                            Reassembly::Idle
                        } else {
                            Reassembly::Subtitle {
                                remaining: total - buf.len(),
                                buf,
                                pts_ticks,
                            }
                        }
                    }
                }
            }
            SubstreamId::PrivateUnknown(_) | SubstreamId::SystemRecord(_) => {
                if done(remaining) {
                    Reassembly::Idle
                } else {
                    Reassembly::Skip { remaining }
                }
            }
        })
    }

    /// Validate the 7-byte LPCM prefix (sub id, frame count, access unit pointer, format
    /// header), returning the sample quantization.
    fn check_lpcm_prefix(
        &self,
        prefix: &[u8],
        total: Option<usize>,
    ) -> Result<lpcm::Quantization, DemuxError> {
        let access_unit_offset = u16::from(prefix[2]) << 8 | u16::from(prefix[3]);
        if let Some(total) = total {
            if access_unit_offset != 0 && 3 + usize::from(access_unit_offset) > total {
                return Err(DemuxError::UnsupportedLayout {
                    access_unit_offset,
                    payload_len: total,
                });
            }
        }
        lpcm::Quantization::from_format_byte(prefix[5])
    }

    fn emit_lpcm<S: ChunkSink>(
        &mut self,
        quantization: lpcm::Quantization,
        data: &[u8],
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        if data.is_empty() {
            return Ok(());
        }
        self.lpcm_out.clear();
        self.lpcm.push(quantization, data, &mut self.lpcm_out);
        if !self.lpcm_out.is_empty() {
            deliver(&mut self.stats, sink, &self.lpcm_out)?;
        }
        Ok(())
    }

    fn emit_subtitle<S: ChunkSink>(
        &mut self,
        pts_ticks: u64,
        payload: &[u8],
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        let record = SubtitleRecord {
            pts_ticks,
            discontinuities: self.timeline.discontinuity_count(),
            payload_length: payload.len() as u32,
        };
        sink.subtitle_chunk(&record, payload)?;
        self.stats.chunks += 1;
        self.stats.bytes_emitted += payload.len() as u64;
        Ok(())
    }
}

enum RecordRead {
    Full,
    Short(usize),
    Eof,
}

/// Read exactly one 188-byte record, tolerating short reads from pipes.
fn read_record<R: Read>(src: &mut R, buf: &mut [u8; PACKET_SIZE]) -> io::Result<RecordRead> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    RecordRead::Eof
                } else {
                    RecordRead::Short(filled)
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(RecordRead::Full)
}
