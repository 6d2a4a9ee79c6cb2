//! Benchmarks for spot decoding and watch-list matching.

use chrono::{TimeZone, Utc};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use dxwatch::parser::{looks_like_spot, parse_cluster_line};
use dxwatch::spot::Spot;
use dxwatch::watchlist::compile;
use dxwatch::wsjtx::{StatusMessage, decode_datagram};

/// Sample cluster lines for benchmarking.
const SAMPLE_SPOTS: &[&str] = &[
    "DX de KD0AA:     18100.0  JR1FYS       FT8 LOUD in FL!                2156Z EL98",
    "DX de W3LPL:     14025.0  VP8LP        CW up 2                        2157Z",
    "DX de DL8AW:      7074.0  ZS6CCY       FT8 -12 dB                     2157Z JO62",
    "DX de K1TTT:     21295.0  5H3EE        SSB big signal                 2158Z",
    "DX de JA1XYZ:    50313.0  VK4MA/P      FT8 Es opening                 2158Z PM95",
    "DX de G4ABC:      3505.0  UA9XX        CW                             2159Z",
];

fn bench_parse_cluster_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_cluster_line");
    let now = Utc.with_ymd_and_hms(2026, 10, 17, 22, 0, 0).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("single", |b| {
        b.iter(|| parse_cluster_line(black_box(SAMPLE_SPOTS[0]), now))
    });

    group.throughput(Throughput::Elements(SAMPLE_SPOTS.len() as u64));
    group.bench_function("batch", |b| {
        b.iter(|| {
            for line in SAMPLE_SPOTS {
                let _ = parse_cluster_line(black_box(line), now);
            }
        })
    });

    group.finish();
}

fn bench_mixed_input(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_input");
    let now = Utc.with_ymd_and_hms(2026, 10, 17, 22, 0, 0).unwrap();

    let mixed_lines: Vec<&str> = vec![
        SAMPLE_SPOTS[0],
        "Hello N0CALL, this is GB7DJK in Reading",
        SAMPLE_SPOTS[1],
        "",
        SAMPLE_SPOTS[2],
        "N0CALL de GB7DJK 17-Oct-2026 2200Z dxspider >",
    ];

    group.throughput(Throughput::Elements(mixed_lines.len() as u64));
    group.bench_function("filter_then_parse", |b| {
        b.iter(|| {
            for line in &mixed_lines {
                if looks_like_spot(line) {
                    let _ = parse_cluster_line(black_box(line), now);
                }
            }
        })
    });

    group.finish();
}

fn bench_decode_datagram(c: &mut Criterion) {
    let status = StatusMessage {
        id: "WSJT-X".to_string(),
        frequency_hz: 14_074_000,
        mode: "FT8".to_string(),
        dx_call: "JA1XYZ".to_string(),
        dx_grid: "PM95".to_string(),
        de_call: "W1AW".to_string(),
        de_grid: "FN31".to_string(),
        ..Default::default()
    };
    let datagram = status.encode();

    c.bench_function("decode_datagram", |b| {
        b.iter(|| decode_datagram(black_box(&datagram)))
    });
}

fn bench_watch_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("watch_list");
    let list = compile("VP8, ZS 20m 40m, JA/ 50-54, 5H").unwrap();
    let now = Utc::now();
    let spots: Vec<Spot> = [
        ("VP8LP", 14025.0),
        ("ZS6CCY", 7074.0),
        ("W1AW/JA", 50313.0),
        ("DL1ABC", 14074.0),
    ]
    .into_iter()
    .map(|(call, khz)| Spot::new(call, "K1TTT", khz, now))
    .collect();

    group.bench_function("compile", |b| {
        b.iter(|| compile(black_box("VP8, ZS 20m 40m, JA/ 50-54, 5H")))
    });

    group.throughput(Throughput::Elements(spots.len() as u64));
    group.bench_function("matches", |b| {
        b.iter(|| spots.iter().filter(|s| list.matches(black_box(s))).count())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_cluster_line,
    bench_mixed_input,
    bench_decode_datagram,
    bench_watch_list
);
criterion_main!(benches);
