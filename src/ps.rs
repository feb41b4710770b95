//! The Program Stream demultiplexer: a scan loop over start-code delimited packets.
//!
//! The loop never parses a PES packet until the packet is completely buffered (packets are
//! bounded by their 16-bit length field, so they always fit the scan buffer), which keeps all
//! header parsing on contiguous slices.  When any step would need bytes beyond the buffered
//! window, the loop suspends, refills the buffer preserving the unconsumed tail, and re-enters
//! at the same logical position.

use crate::buffer::ByteCursor;
use crate::lpcm;
use crate::pack;
use crate::pack::PackHeaderError;
use crate::pes::{PesHeader, PesHeaderError};
use crate::sink::{ChunkSink, SubtitleRecord};
use crate::startcode::{ScanOutcome, StartCodeScanner};
use crate::substream::{route, RouteDecision, Selection, SubstreamId};
use crate::timeline::TimestampTracker;
use crate::{DemuxError, DemuxStats};
use log::{debug, warn};
use std::io;
use std::io::Read;

/// stream ids that carry a parseable PES header: private stream 1, MPEG audio, video
fn is_pes_stream_id(id: u8) -> bool {
    id == 0xbd || (0xc0..=0xef).contains(&id)
}

enum Step {
    Advanced,
    NeedMoreData,
    ProgramEnd,
}

/// Routing and delivery state shared by every emitted packet: the selection, the video
/// timeline, LPCM unpacking state, and the session counters.
struct PacketEmitter {
    selection: Selection,
    timeline: TimestampTracker,
    lpcm: lpcm::Deinterleaver,
    lpcm_out: Vec<u8>,
    last_subtitle_ticks: u64,
    stats: DemuxStats,
}

pub(crate) fn deliver<S: ChunkSink>(
    stats: &mut DemuxStats,
    sink: &mut S,
    data: &[u8],
) -> io::Result<()> {
    sink.payload(data)?;
    stats.chunks += 1;
    stats.bytes_emitted += data.len() as u64;
    Ok(())
}

impl PacketEmitter {
    fn new(selection: Selection) -> PacketEmitter {
        PacketEmitter {
            selection,
            timeline: TimestampTracker::new(),
            lpcm: lpcm::Deinterleaver::new(),
            lpcm_out: Vec::new(),
            last_subtitle_ticks: 0,
            stats: DemuxStats::default(),
        }
    }

    fn count_pes_packet(&mut self) {
        self.stats.pes_packets += 1;
    }

    fn finish(&mut self) -> DemuxStats {
        self.stats.discontinuities = self.timeline.discontinuity_count();
        self.stats.clone()
    }

    /// Route one complete PES packet and deliver its payload if selected.  `pkt` spans from the
    /// start code to the end of the packet.
    fn emit<S: ChunkSink>(
        &mut self,
        stream_id: u8,
        pkt: &[u8],
        header: &PesHeader,
        sink: &mut S,
    ) -> Result<(), DemuxError> {
        let payload = &pkt[header.payload_offset.min(pkt.len())..];
        // the video timeline is tracked whether or not video is the selected substream, since
        // audio and subtitle chunks are stamped relative to it,
        if (0xe0..=0xef).contains(&stream_id) {
            if let Some(pts) = header.pts {
                self.timeline.observe_video_pts(pts);
            }
        }
        let sub_stream_id = if stream_id == 0xbd {
            payload.first().copied()
        } else {
            None
        };
        let kind = match route(stream_id, sub_stream_id, &self.selection) {
            RouteDecision::Discard => return Ok(()),
            RouteDecision::Emit(kind) => kind,
        };
        match kind {
            SubstreamId::Video | SubstreamId::MpegAudio(_) => {
                if !payload.is_empty() {
                    deliver(&mut self.stats, sink, payload)?;
                }
            }
            SubstreamId::Ac3(_) | SubstreamId::Dts(_) => {
                let data = payload.get(kind.payload_prefix_len()..).unwrap_or(&[]);
                if !data.is_empty() {
                    deliver(&mut self.stats, sink, data)?;
                }
            }
            SubstreamId::Lpcm(_) => self.emit_lpcm(payload, sink)?,
            SubstreamId::Subtitle(_) => {
                if let Some(pts) = header.pts {
                    self.last_subtitle_ticks = self.timeline.stamp_ticks(pts);
                }
                let record = SubtitleRecord {
                    pts_ticks: self.last_subtitle_ticks,
                    discontinuities: self.timeline.discontinuity_count(),
                    payload_length: payload.len() as u32,
                };
                sink.subtitle_chunk(&record, payload)?;
                self.stats.chunks += 1;
                self.stats.bytes_emitted += payload.len() as u64;
            }
            SubstreamId::PrivateUnknown(_) | SubstreamId::SystemRecord(_) => {}
        }
        Ok(())
    }

    /// LPCM payload: sub id, frame count, 16-bit first-access-unit pointer, then the 3-byte
    /// sample format header, then big-endian sample groups.
    fn emit_lpcm<S: ChunkSink>(&mut self, payload: &[u8], sink: &mut S) -> Result<(), DemuxError> {
        if payload.len() < 7 {
            warn!("LPCM packet too short for its headers: {} bytes", payload.len());
            return Ok(());
        }
        let access_unit_offset = u16::from(payload[2]) << 8 | u16::from(payload[3]);
        // the pointer counts from the byte after its own field; a target outside the packet is
        // undecodable
        if access_unit_offset != 0 && 3 + usize::from(access_unit_offset) > payload.len() {
            return Err(DemuxError::UnsupportedLayout {
                access_unit_offset,
                payload_len: payload.len(),
            });
        }
        let quantization = lpcm::Quantization::from_format_byte(payload[5])?;
        self.lpcm_out.clear();
        self.lpcm.push(quantization, &payload[7..], &mut self.lpcm_out);
        if !self.lpcm_out.is_empty() {
            deliver(&mut self.stats, sink, &self.lpcm_out)?;
        }
        Ok(())
    }
}

/// One Program Stream demux session.
pub struct PsDemuxer {
    cursor: ByteCursor,
    scanner: StartCodeScanner,
    emitter: PacketEmitter,
}

impl PsDemuxer {
    /// Create a session extracting the given selection.
    pub fn new(selection: Selection) -> PsDemuxer {
        PsDemuxer {
            cursor: ByteCursor::new(),
            scanner: StartCodeScanner::new(),
            emitter: PacketEmitter::new(selection),
        }
    }

    /// Demultiplex `src` to `sink` until the program end code or end of input.
    pub fn run<R: Read, S: ChunkSink>(
        mut self,
        src: &mut R,
        sink: &mut S,
    ) -> Result<DemuxStats, DemuxError> {
        loop {
            match self.step(sink)? {
                Step::Advanced => {}
                Step::ProgramEnd => {
                    debug!("program end code");
                    return Ok(self.emitter.finish());
                }
                Step::NeedMoreData => {
                    if self.cursor.refill(src)? == 0 {
                        let tail = self.cursor.window().len();
                        if tail > 0 {
                            debug!("end of input with {} unparsed trailing bytes", tail);
                        }
                        return Ok(self.emitter.finish());
                    }
                }
            }
        }
    }

    fn step<S: ChunkSink>(&mut self, sink: &mut S) -> Result<Step, DemuxError> {
        let code = match self.scanner.scan(self.cursor.window(), self.cursor.position()) {
            ScanOutcome::NeedMoreData { retain_from } => {
                self.cursor.advance(retain_from);
                return Ok(Step::NeedMoreData);
            }
            ScanOutcome::Found(code) => code,
        };
        self.cursor.advance(code.offset);
        let window = self.cursor.window();
        match code.stream_id {
            0xb9 => Ok(Step::ProgramEnd),
            0xba => match pack::pack_header_len(&window[4..]) {
                Ok(len) => {
                    if 4 + len > window.len() {
                        return Ok(Step::NeedMoreData);
                    }
                    self.cursor.advance(4 + len);
                    Ok(Step::Advanced)
                }
                Err(PackHeaderError::NotEnoughData { .. }) => Ok(Step::NeedMoreData),
                Err(PackHeaderError::Malformed { leading_byte }) => {
                    Err(DemuxError::MalformedPackHeader {
                        offset: self.cursor.position() + 4,
                        leading_byte,
                    })
                }
            },
            id if is_pes_stream_id(id) => {
                if window.len() < 6 {
                    return Ok(Step::NeedMoreData);
                }
                let packet_length = usize::from(window[4]) << 8 | usize::from(window[5]);
                let total = 6 + packet_length;
                if total > window.len() {
                    return Ok(Step::NeedMoreData);
                }
                let pkt = &window[..total];
                self.emitter.count_pes_packet();
                match PesHeader::parse(pkt) {
                    Ok(header) => self.emitter.emit(id, pkt, &header, sink)?,
                    Err(PesHeaderError::TooMuchStuffing) => {
                        warn!("too much stuffing");
                    }
                    Err(PesHeaderError::UnparseableTimestampFlags { flags }) => {
                        warn!(
                            "unparseable MPEG-1 timestamp flags {:#04x} - skipping packet",
                            flags
                        );
                    }
                    Err(PesHeaderError::NotEnoughData { requested, .. }) => {
                        warn!(
                            "PES header needs {} bytes but its packet only has {} - skipping",
                            requested, total
                        );
                    }
                }
                self.cursor.advance(total);
                Ok(Step::Advanced)
            }
            id => {
                if id < 0xb9 {
                    warn!("broken stream - skipping data (stream id {:#04x})", id);
                }
                if window.len() < 6 {
                    return Ok(Step::NeedMoreData);
                }
                let skip = 6 + (usize::from(window[4]) << 8 | usize::from(window[5]));
                if skip > window.len() {
                    return Ok(Step::NeedMoreData);
                }
                self.cursor.advance(skip);
                Ok(Step::Advanced)
            }
        }
    }
}
