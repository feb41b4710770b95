//! Extract one substream from a `.mpg` / `.vob` / `.ts` file to stdout.
//!
//! ```text
//! cargo run --example extract -- movie.vob ac3 0 > track.ac3
//! cargo run --example extract -- movie.ts video 0 0x100 > video.m2v
//! ```

use mpeg2ps_demux::session::DemuxSession;
use mpeg2ps_demux::sink::WriteSink;
use mpeg2ps_demux::substream::{CodecId, Desired, Selection};
use mpeg2ps_demux::ContainerKind;
use std::fs::File;
use std::io;

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .expect("usage: extract <file> <kind> [track] [pid]");
    let kind = args.next().unwrap_or_else(|| "video".to_string());
    let track = args.next().map(|s| parse_number(&s) as u8).unwrap_or(0);

    let (desired, codec_hint) = match kind.as_str() {
        "video" => (Desired::Video, None),
        "mp2" | "mp3" => (Desired::Audio, Some(CodecId::MpegAudio)),
        "ac3" => (Desired::Audio, Some(CodecId::Ac3)),
        "dts" => (Desired::Audio, Some(CodecId::Dts)),
        "lpcm" => (Desired::Audio, Some(CodecId::Lpcm)),
        "subtitle" => (Desired::Subtitle, None),
        other => panic!("unknown substream kind {:?}", other),
    };
    let container = if path.ends_with(".ts") {
        let pid = args
            .next()
            .map(|s| parse_number(&s) as u16)
            .expect("transport streams need a pid argument");
        ContainerKind::TransportStream { pid }
    } else {
        ContainerKind::ProgramStream
    };
    let selection = Selection {
        desired,
        track,
        codec_hint,
    };

    let mut src = File::open(&path).expect("opening input");
    let stdout = io::stdout();
    let mut sink = WriteSink::new(stdout.lock());
    let stats = DemuxSession::new(container, selection)
        .run(&mut src, &mut sink)
        .expect("demux failed");
    eprintln!(
        "{} bytes in {} chunks from {} PES packets ({} discontinuities)",
        stats.bytes_emitted, stats.chunks, stats.pes_packets, stats.discontinuities
    );
}

fn parse_number(s: &str) -> u32 {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).expect("hex number")
    } else {
        s.parse().expect("number")
    }
}
