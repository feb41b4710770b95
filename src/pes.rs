//! Parsing of _Packetised Elementary Stream_ headers, in both the MPEG-2 dialect (explicit
//! header-data-length) and the MPEG-1 dialect (stuffing bytes, optional STD buffer field, and a
//! marker nibble selecting the timestamp block).
//!
//! [`PesHeader::parse()`] never consumes bytes: it either fully describes the header found at
//! the start of the given slice, or reports exactly how many bytes it would have needed, so a
//! caller can suspend, gather more data, and retry without any byte being lost or double-read.

use log::warn;

/// Detail about the formatting problem which prevented a [`Timestamp`] value being parsed.
#[derive(PartialEq, Eq, Debug)]
pub enum TimestampError {
    /// A 'marker-bit' within the timestamp did not have the expected value `1`.
    MarkerBitNotSet {
        /// the bit-index of the bit which should have been 1, but was found to be 0
        bit_number: u8,
    },
}

/// A 33-bit elementary stream timestamp, counting ticks of a 90 kHz clock, used for the PTS and
/// DTS values appearing in PES headers.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Timestamp {
    val: u64,
}
impl Timestamp {
    /// The largest representable value before the timestamp wraps back around to zero.
    pub const MAX: Timestamp = Timestamp { val: (1 << 33) - 1 };

    /// The 90 kHz timebase in which PTS and DTS values are measured.
    pub const TIMEBASE: u64 = 90_000;

    /// Parse a timestamp from the 5 bytes at the start of the given slice: a 4-bit prefix
    /// (ignored; it doubles as the flags nibble in the MPEG-1 dialect), then 3 + 15 + 15 value
    /// bits, each group followed by a marker bit.
    ///
    /// Panics if fewer than 5 bytes are given.
    pub fn from_bytes(buf: &[u8]) -> Result<Timestamp, TimestampError> {
        Timestamp::check_marker_bit(buf, 7)?;
        Timestamp::check_marker_bit(buf, 23)?;
        Timestamp::check_marker_bit(buf, 39)?;
        Ok(Timestamp {
            val: (u64::from(buf[0] & 0b0000_1110) << 29)
                | u64::from(buf[1]) << 22
                | (u64::from(buf[2] & 0b1111_1110) << 14)
                | u64::from(buf[3]) << 7
                | u64::from(buf[4]) >> 1,
        })
    }

    fn check_marker_bit(buf: &[u8], bit_number: u8) -> Result<(), TimestampError> {
        let byte_index = bit_number / 8;
        let bit_index = bit_number % 8;
        let bit_mask = 1 << (7 - bit_index);
        if buf[byte_index as usize] & bit_mask != 0 {
            Ok(())
        } else {
            Err(TimestampError::MarkerBitNotSet { bit_number })
        }
    }

    /// Panics if the given val is greater than 2^33-1.
    pub fn from_u64(val: u64) -> Timestamp {
        assert!(val <= Self::MAX.val);
        Timestamp { val }
    }

    /// Produces the timestamp's tick count (only the low 33 bits are used).
    pub fn value(self) -> u64 {
        self.val
    }
}

/// Which header dialect a PES packet uses.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MpegVersion {
    /// ISO/IEC 11172-1 system stream packet header
    Mpeg1,
    /// ISO/IEC 13818-1 PES packet header
    Mpeg2,
}

/// Problems parsing a PES header.
#[derive(Debug, PartialEq, Eq)]
pub enum PesHeaderError {
    /// The slice ends before the header does.  `requested` counts from the start of the packet
    /// (the first start code byte), so a suspended caller knows how much to accumulate.
    NotEnoughData {
        /// total bytes needed from the packet start
        requested: usize,
        /// bytes actually present
        available: usize,
    },
    /// An MPEG-1 header carried more than 16 stuffing bytes; the packet is unparseable and
    /// should be skipped (not a session-fatal condition).
    TooMuchStuffing,
    /// The MPEG-1 flags nibble matched none of the defined timestamp layouts; the packet should
    /// be skipped.
    UnparseableTimestampFlags {
        /// the offending flags byte
        flags: u8,
    },
}

const FIXED_HEADER_SIZE: usize = 6;
const TIMESTAMP_SIZE: usize = 5;
// 16 stuffing bytes is the historical tolerance; real streams use far fewer
const MAX_MPEG1_STUFFING: usize = 16;

/// A parsed PES packet header.
///
/// `payload_offset` is measured from the first byte of the packet's start code, and the
/// invariant `dts.is_some() => pts.is_some()` always holds (the bitstream cannot encode a DTS
/// without a PTS).
#[derive(Debug, PartialEq, Eq)]
pub struct PesHeader {
    /// which dialect the header used
    pub version: MpegVersion,
    /// the PES_packet_length field: number of bytes following it (`0` meaning 'unbounded' is
    /// only legal for video in Transport Streams)
    pub packet_length: u16,
    /// bytes of optional header data between the fixed header and the payload
    pub header_data_length: u8,
    /// offset of the first payload byte from the start of the packet
    pub payload_offset: usize,
    /// Presentation Time Stamp, if present
    pub pts: Option<Timestamp>,
    /// Decode Time Stamp, if present
    pub dts: Option<Timestamp>,
}

fn need(pkt: &[u8], requested: usize) -> Result<(), PesHeaderError> {
    if pkt.len() < requested {
        Err(PesHeaderError::NotEnoughData {
            requested,
            available: pkt.len(),
        })
    } else {
        Ok(())
    }
}

fn timestamp_at(pkt: &[u8], offset: usize) -> Option<Timestamp> {
    match Timestamp::from_bytes(&pkt[offset..offset + TIMESTAMP_SIZE]) {
        Ok(ts) => Some(ts),
        Err(e) => {
            warn!("ignoring timestamp with bad marker bits: {:?}", e);
            None
        }
    }
}

impl PesHeader {
    /// Parse the PES header at the start of `pkt`, which must begin with the 4-byte start code.
    /// `pkt` need not contain the whole packet, but parsing fails with
    /// [`PesHeaderError::NotEnoughData`] if it ends inside the header.
    ///
    /// The caller is responsible for only invoking this for stream ids that carry a parseable
    /// PES header (`0xbd`, `0xc0..=0xdf`, `0xe0..=0xef`).
    pub fn parse(pkt: &[u8]) -> Result<PesHeader, PesHeaderError> {
        need(pkt, FIXED_HEADER_SIZE + 1)?;
        debug_assert_eq!(&pkt[..3], &[0, 0, 1]);
        let packet_length = u16::from(pkt[4]) << 8 | u16::from(pkt[5]);
        if pkt[FIXED_HEADER_SIZE] & 0xc0 == 0x80 {
            Self::parse_mpeg2(pkt, packet_length)
        } else {
            Self::parse_mpeg1(pkt, packet_length)
        }
    }

    fn parse_mpeg2(pkt: &[u8], packet_length: u16) -> Result<PesHeader, PesHeaderError> {
        need(pkt, 9)?;
        let header_data_length = pkt[8];
        let payload_offset = 9 + usize::from(header_data_length);
        need(pkt, payload_offset)?;
        let flags = pkt[7] >> 6;
        let (pts, dts) = match flags {
            0b10 if usize::from(header_data_length) >= TIMESTAMP_SIZE => {
                (timestamp_at(pkt, 9), None)
            }
            0b11 if usize::from(header_data_length) >= TIMESTAMP_SIZE * 2 => {
                let pts = timestamp_at(pkt, 9);
                // DTS without PTS cannot be represented,
                let dts = pts.and_then(|_| timestamp_at(pkt, 9 + TIMESTAMP_SIZE));
                (pts, dts)
            }
            0b10 | 0b11 => {
                warn!(
                    "PES_header_data_length {} too small for PTS_DTS_flags {:#b}",
                    header_data_length, flags
                );
                (None, None)
            }
            0b01 => {
                warn!("invalid PTS_DTS_flags 0b01");
                (None, None)
            }
            _ => (None, None),
        };
        Ok(PesHeader {
            version: MpegVersion::Mpeg2,
            packet_length,
            header_data_length,
            payload_offset,
            pts,
            dts,
        })
    }

    fn parse_mpeg1(pkt: &[u8], packet_length: u16) -> Result<PesHeader, PesHeaderError> {
        let mut i = FIXED_HEADER_SIZE;
        loop {
            need(pkt, i + 1)?;
            if pkt[i] != 0xff {
                break;
            }
            i += 1;
            if i > FIXED_HEADER_SIZE + MAX_MPEG1_STUFFING {
                return Err(PesHeaderError::TooMuchStuffing);
            }
        }
        if pkt[i] & 0xc0 == 0x40 {
            // STD buffer scale/size field
            i += 2;
            need(pkt, i + 1)?;
        }
        let flags = pkt[i];
        let (pts, dts, payload_offset) = match flags >> 4 {
            0b0010 => {
                need(pkt, i + TIMESTAMP_SIZE)?;
                (timestamp_at(pkt, i), None, i + TIMESTAMP_SIZE)
            }
            0b0011 => {
                need(pkt, i + TIMESTAMP_SIZE * 2)?;
                let pts = timestamp_at(pkt, i);
                let dts = pts.and_then(|_| timestamp_at(pkt, i + TIMESTAMP_SIZE));
                (pts, dts, i + TIMESTAMP_SIZE * 2)
            }
            // '0000 1111' terminator byte carries no timestamps
            0b0000 => (None, None, i + 1),
            _ => return Err(PesHeaderError::UnparseableTimestampFlags { flags }),
        };
        Ok(PesHeader {
            version: MpegVersion::Mpeg1,
            packet_length,
            header_data_length: (payload_offset - FIXED_HEADER_SIZE) as u8,
            payload_offset,
            pts,
            dts,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use bitstream_io::{BigEndian, BitWrite, BitWriter, BE};
    use std::io;

    fn make_test_data<F>(builder: F) -> Vec<u8>
    where
        F: Fn(&mut BitWriter<Vec<u8>, BE>) -> Result<(), io::Error>,
    {
        let data: Vec<u8> = Vec::new();
        let mut w = BitWriter::endian(data, BigEndian);
        builder(&mut w).unwrap();
        w.into_writer()
    }

    /// `ts` is a 33-bit timestamp value
    fn write_ts(w: &mut BitWriter<Vec<u8>, BE>, ts: u64, prefix: u8) -> Result<(), io::Error> {
        assert!(ts < 1u64 << 33);
        w.write(4, prefix & 0b1111)?;
        w.write(3, (ts >> 30) & 0b111)?;
        w.write(1, 1)?; // marker_bit
        w.write(15, (ts >> 15) & 0x7fff)?;
        w.write(1, 1)?; // marker_bit
        w.write(15, ts & 0x7fff)?;
        w.write(1, 1) // marker_bit
    }

    fn mpeg2_packet(pts: u64, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let ts_len = if dts.is_some() { 10 } else { 5 };
        let packet_length = 3 + ts_len + payload.len();
        make_test_data(|w| {
            w.write(24, 1)?; // packet_start_code_prefix
            w.write(8, 0xe0)?; // stream_id
            w.write(16, packet_length as u16)?; // PES_packet_length
            w.write(2, 0b10)?; // check-bits
            w.write(6, 0)?; // scrambling, priority, alignment, copyright, original
            w.write(2, if dts.is_some() { 0b11 } else { 0b10 })?; // PTS_DTS_flags
            w.write(6, 0)?; // remaining flags
            w.write(8, ts_len as u8)?; // PES_header_data_length
            write_ts(w, pts, if dts.is_some() { 0b0011 } else { 0b0010 })?;
            if let Some(dts) = dts {
                write_ts(w, dts, 0b0001)?;
            }
            for &b in payload {
                w.write(8, b)?;
            }
            Ok(())
        })
    }

    #[test]
    fn mpeg2_pts_only() {
        let pkt = mpeg2_packet(123456789, None, b"payload!");
        let header = PesHeader::parse(&pkt).unwrap();
        assert_eq!(header.version, MpegVersion::Mpeg2);
        assert_eq!(header.packet_length as usize, pkt.len() - 6);
        assert_eq!(header.payload_offset, 14);
        assert_eq!(&pkt[header.payload_offset..], b"payload!");
        assert_eq!(header.pts, Some(Timestamp::from_u64(123456789)));
        assert_eq!(header.dts, None);
    }

    #[test]
    fn mpeg2_pts_and_dts() {
        let pkt = mpeg2_packet(90_000, Some(87_000), b"x");
        let header = PesHeader::parse(&pkt).unwrap();
        assert_eq!(header.pts, Some(Timestamp::from_u64(90_000)));
        assert_eq!(header.dts, Some(Timestamp::from_u64(87_000)));
        assert_eq!(header.payload_offset, 19);
    }

    #[test]
    fn pts_bit_packing_round_trip() {
        // alternating patterns, boundary values, and a walk of single set bits
        let mut values = vec![
            0,
            1,
            0b1_0101_0101_0101_0101_0101_0101_0101_0101,
            0b0_1010_1010_1010_1010_1010_1010_1010_1010,
            (1 << 33) - 1,
            90_000,
        ];
        values.extend((0..33).map(|b| 1u64 << b));
        for v in values {
            let bytes = make_test_data(|w| write_ts(w, v, 0b0010));
            let ts = Timestamp::from_bytes(&bytes).unwrap();
            assert_eq!(ts.value(), v, "mismatch for {:#b}", v);
        }
    }

    #[test]
    fn timestamp_bad_marker() {
        let mut bytes = make_test_data(|w| write_ts(w, 1234, 0b0010));
        bytes[0] &= 0b1111_1110; // clear the first marker bit
        assert_matches!(
            Timestamp::from_bytes(&bytes),
            Err(TimestampError::MarkerBitNotSet { bit_number: 7 })
        );
    }

    fn mpeg1_packet(stuffing: usize, std_buffer: bool, flags: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0, 0, 1, 0xc0];
        let len = stuffing + if std_buffer { 2 } else { 0 } + flags.len() + payload.len();
        pkt.push((len >> 8) as u8);
        pkt.push(len as u8);
        pkt.extend(std::iter::repeat(0xff).take(stuffing));
        if std_buffer {
            pkt.extend_from_slice(&[0x40 | 0x01, 0x23]);
        }
        pkt.extend_from_slice(flags);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn mpeg1_no_timestamps() {
        let pkt = mpeg1_packet(3, false, &[0x0f], b"data");
        let header = PesHeader::parse(&pkt).unwrap();
        assert_eq!(header.version, MpegVersion::Mpeg1);
        assert_eq!(header.payload_offset, 6 + 3 + 1);
        assert_eq!(&pkt[header.payload_offset..], b"data");
        assert_eq!(header.pts, None);
        assert_eq!(header.dts, None);
    }

    #[test]
    fn mpeg1_std_buffer_and_pts() {
        let ts = make_test_data(|w| write_ts(w, 0x1_2345_6789 & ((1 << 33) - 1), 0b0010));
        let pkt = mpeg1_packet(16, true, &ts, b"data");
        let header = PesHeader::parse(&pkt).unwrap();
        assert_eq!(header.payload_offset, 6 + 16 + 2 + 5);
        assert_eq!(
            header.pts,
            Some(Timestamp::from_u64(0x1_2345_6789 & ((1 << 33) - 1)))
        );
        assert_eq!(header.dts, None);
    }

    #[test]
    fn mpeg1_pts_and_dts() {
        let mut flags = make_test_data(|w| write_ts(w, 45_000, 0b0011));
        flags.extend(make_test_data(|w| write_ts(w, 42_000, 0b0001)));
        let pkt = mpeg1_packet(0, false, &flags, b"");
        let header = PesHeader::parse(&pkt).unwrap();
        assert_eq!(header.pts, Some(Timestamp::from_u64(45_000)));
        assert_eq!(header.dts, Some(Timestamp::from_u64(42_000)));
    }

    #[test]
    fn mpeg1_too_much_stuffing() {
        let pkt = mpeg1_packet(17, false, &[0x0f], b"");
        assert_matches!(PesHeader::parse(&pkt), Err(PesHeaderError::TooMuchStuffing));
        // exactly 16 stuffing bytes is still tolerated,
        let pkt = mpeg1_packet(16, false, &[0x0f], b"");
        assert!(PesHeader::parse(&pkt).is_ok());
    }

    #[test]
    fn mpeg1_unparseable_flags() {
        // top nibble 0b0001 selects none of the defined timestamp layouts
        let pkt = mpeg1_packet(1, false, &[0x1f], b"");
        assert_matches!(
            PesHeader::parse(&pkt),
            Err(PesHeaderError::UnparseableTimestampFlags { flags: 0x1f })
        );
    }

    #[test]
    fn suspension_reports_requested_bytes() {
        // the header proper is 14 bytes; every shorter prefix must ask for more (never for more
        // than the header needs), and the 14-byte prefix must parse outright
        let pkt = mpeg2_packet(10, None, b"abc");
        for end in 0..14 {
            match PesHeader::parse(&pkt[..end]) {
                Err(PesHeaderError::NotEnoughData {
                    requested,
                    available,
                }) => {
                    assert_eq!(available, end);
                    assert!(requested > available);
                    assert!(requested <= 14);
                }
                other => panic!("expected NotEnoughData with {} bytes, got {:?}", end, other),
            }
        }
        assert!(PesHeader::parse(&pkt[..14]).is_ok());
    }
}
