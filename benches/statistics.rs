/// Benchmarks for ensemble statistics.
use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ensemblist::engine::{LogProgress, StatsEngine};
use ensemblist::loader::{scan, LoaderOptions};
use ensemblist::member_format::MemberFile;
use ensemblist::models::ReachId;
use ensemblist::statistics;
use ensemblist::types::Timestamp;

const QUANTILES: [f64; 3] = [0.05, 0.5, 0.95];

fn write_ensemble(dir: &std::path::Path, members: usize, reaches: u64, steps: i64) {
    let time: Vec<Timestamp> = (0..steps)
        .map(|i| Timestamp::from_seconds(1_672_531_200 + 3600 * i))
        .collect();
    for m in 0..members {
        let reaches: BTreeMap<ReachId, Vec<Option<f64>>> = (0..reaches)
            .map(|r| {
                let values = (0..steps)
                    .map(|t| Some(((m as i64 * 7 + t * 13 + r as i64) % 101) as f64))
                    .collect();
                (ReachId::from(r), values)
            })
            .collect();
        let member = MemberFile {
            member_id: Some(m as i64),
            time: time.clone(),
            reaches,
            ..Default::default()
        };
        member
            .write(&dir.join(format!("member_{:03}.json.gz", m)))
            .unwrap();
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    for size in [16, 256, 4096] {
        let samples: Vec<f64> = (0..size).map(|i| ((i * 37) % 101) as f64).collect();
        let name = format!("quantile_linear({})", size);
        c.bench_function(&name, |b| {
            b.iter(|| {
                let mut samples = samples.clone();
                statistics::quantile_linear(black_box(&mut samples), 0.95)
            })
        });
    }

    let dir = tempfile::tempdir().unwrap();
    write_ensemble(dir.path(), 20, 200, 48);
    let mut inputs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    inputs.sort();
    let index = scan(&inputs, &LoaderOptions::default()).unwrap();
    for use_rayon in [false, true] {
        for batch_size in [16, 200] {
            let engine = StatsEngine::new(&QUANTILES, batch_size, use_rayon).unwrap();
            let name = format!("engine(batch {}, rayon {})", batch_size, use_rayon);
            c.bench_function(&name, |b| {
                b.iter(|| engine.run(black_box(&index), &LogProgress).unwrap())
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
