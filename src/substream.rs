//! Classification of `(stream_id, sub_stream_id)` pairs and the decision whether a packet's
//! payload is emitted for the caller's selection.
//!
//! Private stream 1 (`0xbd`) is a sub-multiplex: AC-3, DTS, LPCM and subtitle packets all share
//! the outer stream id and are told apart only by their first payload byte.  The ranges here
//! are the DVD-Video assignments.

/// The compressed formats an audio track selection can refer to.
///
/// A Program Stream can carry the same track number in several sub-multiplexes at once, so
/// "audio track 0" is ambiguous without this hint from the caller's probing step.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CodecId {
    /// MPEG-1 layer II/III audio, carried in stream ids `0xc0..=0xdf`
    MpegAudio,
    /// AC-3 ("Dolby Digital"), carried in private stream 1, sub ids `0x80..=0x87`
    Ac3,
    /// DTS, carried in private stream 1, sub ids `0x88..=0x8f`
    Dts,
    /// Linear PCM, carried in private stream 1, sub ids `0xa0..=0xbf`
    Lpcm,
}

/// Which class of substream the caller wants extracted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Desired {
    /// the (single) video stream
    Video,
    /// one audio track, per `track` and `codec_hint`
    Audio,
    /// one subtitle track
    Subtitle,
}

/// The caller's description of the one substream to extract.
#[derive(Debug, Clone, Copy)]
pub struct Selection {
    /// class of substream wanted
    pub desired: Desired,
    /// track number within that class (ignored for video)
    pub track: u8,
    /// disambiguates which audio sub-multiplex `track` refers to; `None` defaults to MPEG audio
    pub codec_hint: Option<CodecId>,
}

/// System-level records that structure the multiplex but carry no substream payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SystemRecordKind {
    /// `0xb9`, terminates the program stream
    ProgramEnd,
    /// `0xba` pack header
    PackHeader,
    /// `0xbb` system header
    SystemHeader,
    /// `0xbe` padding stream
    Padding,
    /// any other non-payload stream id (PSM, ECM/EMM, private stream 2, directory, ...)
    Other(u8),
}

/// The logical kind of one multiplexed packet, derived purely from `(stream_id, sub_stream_id)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SubstreamId {
    /// stream ids `0xe0..=0xef`
    Video,
    /// stream ids `0xc0..=0xdf`; track is the low 5 bits
    MpegAudio(u8),
    /// private stream 1, sub ids `0x80..=0x87`; track is the low 3 bits
    Ac3(u8),
    /// private stream 1, sub ids `0x88..=0x8f`; track is the low 3 bits
    Dts(u8),
    /// private stream 1, sub ids `0xa0..=0xbf`; track is the low 5 bits
    Lpcm(u8),
    /// private stream 1, sub ids `0x20..=0x3f`; track is the low 5 bits
    Subtitle(u8),
    /// a private stream 1 sub id outside all known ranges
    PrivateUnknown(u8),
    /// a record belonging to the multiplex itself rather than any substream
    SystemRecord(SystemRecordKind),
}

impl SubstreamId {
    /// Classify a packet.  `sub_stream_id` is the first payload byte, and is only consulted for
    /// private stream 1; `None` there (an empty payload) classifies as `PrivateUnknown`.
    pub fn classify(stream_id: u8, sub_stream_id: Option<u8>) -> SubstreamId {
        match stream_id {
            0xe0..=0xef => SubstreamId::Video,
            0xc0..=0xdf => SubstreamId::MpegAudio(stream_id & 0x1f),
            0xbd => match sub_stream_id {
                Some(sub @ 0x20..=0x3f) => SubstreamId::Subtitle(sub & 0x1f),
                Some(sub @ 0x80..=0x87) => SubstreamId::Ac3(sub & 0x07),
                Some(sub @ 0x88..=0x8f) => SubstreamId::Dts(sub & 0x07),
                Some(sub @ 0xa0..=0xbf) => SubstreamId::Lpcm(sub & 0x1f),
                Some(sub) => SubstreamId::PrivateUnknown(sub),
                None => SubstreamId::PrivateUnknown(0),
            },
            0xb9 => SubstreamId::SystemRecord(SystemRecordKind::ProgramEnd),
            0xba => SubstreamId::SystemRecord(SystemRecordKind::PackHeader),
            0xbb => SubstreamId::SystemRecord(SystemRecordKind::SystemHeader),
            0xbe => SubstreamId::SystemRecord(SystemRecordKind::Padding),
            other => SubstreamId::SystemRecord(SystemRecordKind::Other(other)),
        }
    }

    /// Number of payload bytes preceding the actual substream data.
    ///
    /// AC-3 and DTS payloads start with the sub id plus a frame count and a 16-bit first-access-
    /// unit pointer; LPCM additionally carries a 3-byte sample format header.  Subtitle data by
    /// contrast is emitted *including* its sub id byte, which downstream subtitle decoders
    /// expect to see.
    pub fn payload_prefix_len(&self) -> usize {
        match self {
            SubstreamId::Ac3(_) | SubstreamId::Dts(_) => 4,
            SubstreamId::Lpcm(_) => 7,
            _ => 0,
        }
    }
}

/// Whether a packet's payload should reach the output.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteDecision {
    /// deliver the payload, which is of the given kind
    Emit(SubstreamId),
    /// not the selected substream; skip the payload
    Discard,
}

/// Decide whether the packet classified as `(stream_id, sub_stream_id)` matches `selection`.
///
/// This is a pure function of its arguments; the byte copying for an `Emit` decision is the
/// caller's job.
pub fn route(stream_id: u8, sub_stream_id: Option<u8>, selection: &Selection) -> RouteDecision {
    let id = SubstreamId::classify(stream_id, sub_stream_id);
    let wanted = match (id, selection.desired) {
        (SubstreamId::Video, Desired::Video) => true,
        (SubstreamId::MpegAudio(track), Desired::Audio) => {
            matches!(selection.codec_hint, None | Some(CodecId::MpegAudio))
                && track == selection.track
        }
        (SubstreamId::Ac3(track), Desired::Audio) => {
            selection.codec_hint == Some(CodecId::Ac3) && track == selection.track
        }
        (SubstreamId::Dts(track), Desired::Audio) => {
            selection.codec_hint == Some(CodecId::Dts) && track == selection.track
        }
        (SubstreamId::Lpcm(track), Desired::Audio) => {
            selection.codec_hint == Some(CodecId::Lpcm) && track == selection.track
        }
        (SubstreamId::Subtitle(track), Desired::Subtitle) => track == selection.track,
        _ => false,
    };
    if wanted {
        RouteDecision::Emit(id)
    } else {
        RouteDecision::Discard
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn selection(desired: Desired, track: u8, codec_hint: Option<CodecId>) -> Selection {
        Selection {
            desired,
            track,
            codec_hint,
        }
    }

    #[test]
    fn every_id_pair_classifies() {
        // the whole (stream_id, sub_stream_id) square is covered: no panics, and every private
        // stream 1 sub id lands in a decided category,
        for stream_id in 0x00..=0xffu8 {
            for sub in 0x00..=0xffu8 {
                let id = SubstreamId::classify(stream_id, Some(sub));
                match stream_id {
                    0xe0..=0xef => assert_eq!(id, SubstreamId::Video),
                    0xc0..=0xdf => assert_eq!(id, SubstreamId::MpegAudio(stream_id - 0xc0)),
                    0xbd => match sub {
                        0x20..=0x3f => assert_eq!(id, SubstreamId::Subtitle(sub - 0x20)),
                        0x80..=0x87 => assert_eq!(id, SubstreamId::Ac3(sub - 0x80)),
                        0x88..=0x8f => assert_eq!(id, SubstreamId::Dts(sub - 0x88)),
                        0xa0..=0xbf => assert_eq!(id, SubstreamId::Lpcm(sub - 0xa0)),
                        _ => assert_eq!(id, SubstreamId::PrivateUnknown(sub)),
                    },
                    _ => assert!(matches!(id, SubstreamId::SystemRecord(_))),
                }
            }
        }
    }

    #[test]
    fn every_id_pair_routes() {
        let selections = [
            selection(Desired::Video, 0, None),
            selection(Desired::Audio, 0, None),
            selection(Desired::Audio, 3, Some(CodecId::Ac3)),
            selection(Desired::Audio, 7, Some(CodecId::Dts)),
            selection(Desired::Audio, 31, Some(CodecId::Lpcm)),
            selection(Desired::Subtitle, 5, None),
        ];
        for sel in &selections {
            for stream_id in 0x00..=0xffu8 {
                for sub in 0x00..=0xffu8 {
                    // must never panic, whatever the input
                    let _ = route(stream_id, Some(sub), sel);
                }
                let _ = route(stream_id, None, sel);
            }
        }
    }

    #[test]
    fn audio_track_matching() {
        let ac3_0 = selection(Desired::Audio, 0, Some(CodecId::Ac3));
        assert_eq!(
            route(0xbd, Some(0x80), &ac3_0),
            RouteDecision::Emit(SubstreamId::Ac3(0))
        );
        assert_eq!(route(0xbd, Some(0x81), &ac3_0), RouteDecision::Discard);
        assert_eq!(route(0xbd, Some(0x88), &ac3_0), RouteDecision::Discard);
        assert_eq!(route(0xc0, Some(0x80), &ac3_0), RouteDecision::Discard);

        let mp2_2 = selection(Desired::Audio, 2, None);
        assert_eq!(
            route(0xc2, None, &mp2_2),
            RouteDecision::Emit(SubstreamId::MpegAudio(2))
        );
        assert_eq!(route(0xc0, None, &mp2_2), RouteDecision::Discard);

        let dts_1 = selection(Desired::Audio, 1, Some(CodecId::Dts));
        assert_eq!(
            route(0xbd, Some(0x89), &dts_1),
            RouteDecision::Emit(SubstreamId::Dts(1))
        );

        let lpcm_0 = selection(Desired::Audio, 0, Some(CodecId::Lpcm));
        assert_eq!(
            route(0xbd, Some(0xa0), &lpcm_0),
            RouteDecision::Emit(SubstreamId::Lpcm(0))
        );
    }

    #[test]
    fn video_ignores_track() {
        let sel = selection(Desired::Video, 9, None);
        for id in 0xe0..=0xefu8 {
            assert_eq!(route(id, None, &sel), RouteDecision::Emit(SubstreamId::Video));
        }
        assert_eq!(route(0xc0, None, &sel), RouteDecision::Discard);
    }

    #[test]
    fn subtitle_track_matching() {
        let sel = selection(Desired::Subtitle, 1, None);
        assert_eq!(
            route(0xbd, Some(0x21), &sel),
            RouteDecision::Emit(SubstreamId::Subtitle(1))
        );
        assert_eq!(route(0xbd, Some(0x20), &sel), RouteDecision::Discard);
        // sub id ranges other than 0x20..=0x3f are never subtitles
        assert_eq!(route(0xbd, Some(0x81), &sel), RouteDecision::Discard);
    }

    #[test]
    fn payload_prefixes() {
        assert_eq!(SubstreamId::Ac3(0).payload_prefix_len(), 4);
        assert_eq!(SubstreamId::Dts(2).payload_prefix_len(), 4);
        assert_eq!(SubstreamId::Lpcm(0).payload_prefix_len(), 7);
        assert_eq!(SubstreamId::Subtitle(0).payload_prefix_len(), 0);
        assert_eq!(SubstreamId::Video.payload_prefix_len(), 0);
    }
}
