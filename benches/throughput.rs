use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mpeg2ps_demux::session::DemuxSession;
use mpeg2ps_demux::sink::WriteSink;
use mpeg2ps_demux::substream::{CodecId, Desired, Selection};
use mpeg2ps_demux::ContainerKind;

/// a synthetic program stream alternating video and AC-3 packets between pack headers
fn synthetic_ps(target_len: usize) -> Vec<u8> {
    let video_payload = vec![0x42u8; 2013];
    let ac3_payload = {
        let mut p = vec![0x80u8, 0x01, 0x00, 0x01];
        p.extend(vec![0x0bu8; 1536]);
        p
    };
    let mut stream = Vec::with_capacity(target_len + 4096);
    let mut pts: u64 = 0;
    while stream.len() < target_len {
        stream.extend_from_slice(&[0, 0, 1, 0xba]);
        stream.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x89, 0xc3, 0xf8]);
        for (id, payload, with_pts) in [
            (0xe0u8, &video_payload, true),
            (0xbd, &ac3_payload, false),
        ] {
            let header_data_len = if with_pts { 5 } else { 0 };
            let packet_length = 3 + header_data_len + payload.len();
            stream.extend_from_slice(&[0, 0, 1, id]);
            stream.push((packet_length >> 8) as u8);
            stream.push(packet_length as u8);
            stream.push(0x80);
            stream.push(if with_pts { 0x80 } else { 0x00 });
            stream.push(header_data_len as u8);
            if with_pts {
                stream.extend_from_slice(&[
                    0x20 | (((pts >> 30) & 0x7) as u8) << 1 | 1,
                    (pts >> 22) as u8,
                    (((pts >> 15) & 0x7f) as u8) << 1 | 1,
                    (pts >> 7) as u8,
                    ((pts & 0x7f) as u8) << 1 | 1,
                ]);
                pts += 3600;
            }
            stream.extend_from_slice(payload);
        }
    }
    stream
}

fn demux_ps(c: &mut Criterion) {
    let stream = synthetic_ps(32 * 1024 * 1024);
    let mut group = c.benchmark_group("demux");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("ps_ac3", |b| {
        b.iter(|| {
            let mut sink = WriteSink::new(std::io::sink());
            DemuxSession::new(
                ContainerKind::ProgramStream,
                Selection {
                    desired: Desired::Audio,
                    track: 0,
                    codec_hint: Some(CodecId::Ac3),
                },
            )
            .run(&mut &stream[..], &mut sink)
            .unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, demux_ps);
criterion_main!(benches);
