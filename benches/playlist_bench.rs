//! Benchmarks for playlist parsing and ffmpeg diagnostic parsing.
//!
//! Run with: `cargo bench --bench playlist_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hlsgrab::stream::engine::MediaProgressTracker;
use hlsgrab::stream::playlist::{parse_master_playlist, parse_media_playlist, select_variant};
use hlsgrab::stream::MediaStage;
use url::Url;

/// Generate a VOD media playlist with `segments` entries, alternating
/// relative and absolute URIs the way CDN playlists often do.
fn generate_media_playlist(segments: usize) -> String {
    let mut body = String::with_capacity(segments * 64 + 128);
    body.push_str("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n");
    body.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
    for i in 0..segments {
        body.push_str("#EXTINF:6.006,\n");
        if i % 2 == 0 {
            body.push_str(&format!("chunk_{i:05}.m4s?token=abcdef0123456789\n"));
        } else {
            body.push_str(&format!(
                "https://edge-2.cdn.example.com/vod/title/1080p/chunk_{i:05}.m4s\n"
            ));
        }
    }
    body.push_str("#EXT-X-ENDLIST\n");
    body
}

fn generate_master_playlist(variants: usize) -> String {
    let mut body = String::from("#EXTM3U\n#EXT-X-INDEPENDENT-SEGMENTS\n");
    for i in 0..variants {
        let height = 144 + i * 120;
        body.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},AVERAGE-BANDWIDTH={},RESOLUTION={}x{height},CODECS=\"avc1.640028,mp4a.40.2\",FRAME-RATE=29.970\n{height}p/index.m3u8\n",
            400_000 + i * 600_000,
            350_000 + i * 550_000,
            height * 16 / 9,
        ));
    }
    body
}

fn bench_media_playlist(c: &mut Criterion) {
    let mut group = c.benchmark_group("media_playlist");
    let base = Url::parse("https://cdn.example.com/vod/title/1080p/index.m3u8").unwrap();

    // 10 min, 1 h and 3 h at 6 s segments
    for &segments in &[100usize, 600, 1_800] {
        let body = generate_media_playlist(segments);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse", segments), &body, |b, body| {
            b.iter(|| black_box(parse_media_playlist(black_box(body), &base).unwrap()));
        });
    }

    group.finish();
}

fn bench_master_playlist(c: &mut Criterion) {
    let base = Url::parse("https://cdn.example.com/vod/title/master.m3u8").unwrap();
    let body = generate_master_playlist(8);

    c.bench_function("master_parse_and_select", |b| {
        b.iter(|| {
            let variants = parse_master_playlist(black_box(&body), &base).unwrap();
            black_box(select_variant(&variants).map(|v| v.height))
        });
    });
}

fn bench_progress_lines(c: &mut Criterion) {
    let lines: Vec<String> = (0..1_000)
        .map(|i| {
            format!(
                "frame={i:5} fps=240 q=-1.0 size={:8}kB time=00:{:02}:{:02}.{:02} bitrate=4012.3kbits/s speed=8.01x",
                i * 48,
                i / 60 % 60,
                i % 60,
                i % 100
            )
        })
        .collect();

    c.bench_function("progress_tracker_1000_lines", |b| {
        b.iter(|| {
            let mut tracker = MediaProgressTracker::new(MediaStage::Concatenate, None);
            tracker.observe("  Duration: 00:20:00.00, start: 0.000000, bitrate: 4000 kb/s");
            for line in &lines {
                black_box(tracker.observe(black_box(line)));
            }
            tracker.elapsed()
        });
    });
}

criterion_group!(
    benches,
    bench_media_playlist,
    bench_master_playlist,
    bench_progress_lines
);
criterion_main!(benches);
