//! Series engine benchmarks: normalizing a long regional history and
//! merging several regions into a global one.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use market_store::application::{global_history, normalize};
use market_store::domain::{RawDayRecord, RegionSeries, DATE_FORMAT};

// Every third day has no trades, so normalization has gaps to fill
fn make_raw_days(n: usize) -> Vec<RawDayRecord> {
    let base_date = chrono::NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
    (0..n)
        .filter(|i| i % 3 != 2)
        .map(|i| {
            let average = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            RawDayRecord {
                date: (base_date + chrono::Duration::days(i as i64))
                    .format(DATE_FORMAT)
                    .to_string(),
                average,
                highest: average + 1.5,
                lowest: average - 1.5,
                order_count: 50 + (i as i64 % 20),
                volume: 10_000 + (i as i64 % 5_000),
            }
        })
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    for days in [100, 1000] {
        let raw = make_raw_days(days);
        group.bench_with_input(BenchmarkId::from_parameter(days), &raw, |b, raw| {
            b.iter(|| normalize(black_box(raw)).unwrap());
        });
    }
    group.finish();
}

fn bench_global_history(c: &mut Criterion) {
    let series: Vec<RegionSeries> = (0..5)
        .map(|region| RegionSeries {
            region_id: 10_000_001 + region,
            days: make_raw_days(1000),
        })
        .collect();

    c.bench_function("global_history_5_regions", |b| {
        b.iter(|| global_history(black_box(&series), 1000).unwrap());
    });
}

criterion_group!(benches, bench_normalize, bench_global_history);
criterion_main!(benches);
