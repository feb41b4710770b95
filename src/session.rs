//! The session entry point tying a byte source, a container kind and a substream selection to
//! an output sink.

use crate::ps::PsDemuxer;
use crate::sink::ChunkSink;
use crate::substream::Selection;
use crate::ts::TsDemuxer;
use crate::{ps, ContainerKind, DemuxError, DemuxStats};
use std::io;
use std::io::Read;

/// A single demultiplexing session: one source, one selected substream, one sink.
///
/// Sessions are one-shot; cancellation is simply dropping the session (or having the source or
/// sink return an error).
pub struct DemuxSession {
    container: ContainerKind,
    selection: Selection,
}

impl DemuxSession {
    /// Describe a session over the given container layout, extracting the given selection.
    pub fn new(container: ContainerKind, selection: Selection) -> DemuxSession {
        DemuxSession {
            container,
            selection,
        }
    }

    /// Consume `src` to exhaustion (or the program end code), delivering the selected
    /// substream to `sink`.
    pub fn run<R: Read, S: ChunkSink>(
        self,
        src: &mut R,
        sink: &mut S,
    ) -> Result<DemuxStats, DemuxError> {
        match self.container {
            ContainerKind::ProgramStream => PsDemuxer::new(self.selection).run(src, sink),
            ContainerKind::TransportStream { pid } => {
                TsDemuxer::new(pid, self.selection).run(src, sink)
            }
            ContainerKind::Raw => copy_through(src, sink),
        }
    }
}

/// The `Raw` pass-through: the source is already an elementary stream.
fn copy_through<R: Read, S: ChunkSink>(
    src: &mut R,
    sink: &mut S,
) -> Result<DemuxStats, DemuxError> {
    let mut stats = DemuxStats::default();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(stats),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        ps::deliver(&mut stats, sink, &buf[..n])?;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink::WriteSink;
    use crate::substream::Desired;

    #[test]
    fn raw_copies_through() {
        let data = b"not a multiplex at all";
        let mut sink = WriteSink::new(Vec::new());
        let stats = DemuxSession::new(
            ContainerKind::Raw,
            Selection {
                desired: Desired::Video,
                track: 0,
                codec_hint: None,
            },
        )
        .run(&mut &data[..], &mut sink)
        .unwrap();
        assert_eq!(sink.into_inner(), data);
        assert_eq!(stats.bytes_emitted, data.len() as u64);
    }

    #[test]
    fn empty_program_stream_is_clean_eof() {
        let mut src: &[u8] = &[];
        let mut sink = WriteSink::new(Vec::new());
        let stats = DemuxSession::new(
            ContainerKind::ProgramStream,
            Selection {
                desired: Desired::Video,
                track: 0,
                codec_hint: None,
            },
        )
        .run(&mut src, &mut sink)
        .unwrap();
        assert_eq!(stats, DemuxStats::default());
    }
}
