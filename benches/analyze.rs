use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pulsekit::{analyze_signal, Options};

fn synthetic_ppg(fs: f64, bpm: f64, seconds: f64) -> Vec<f64> {
    let f = bpm / 60.0;
    let n = (fs * seconds) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / fs;
            let phase = 2.0 * std::f64::consts::PI * f * t;
            phase.sin() + 0.3 * (2.0 * phase).sin() + 0.02 * (11.0 * t).sin()
        })
        .collect()
}

fn bench_batch_analysis(c: &mut Criterion) {
    let fs = 50.0;
    let signal = synthetic_ppg(fs, 72.0, 60.0);
    let opt = Options::default();
    c.bench_function("analyze_signal_60s_50hz", |b| {
        b.iter(|| analyze_signal(black_box(&signal), fs, &opt).unwrap())
    });

    let mut opt_full = Options::default();
    opt_full.preprocessing.interp_clipping = true;
    opt_full.preprocessing.hampel_correct = true;
    opt_full.quality.threshold_rr = true;
    opt_full.cleaning.clean_rr = true;
    c.bench_function("analyze_signal_60s_full_pipeline", |b| {
        b.iter(|| analyze_signal(black_box(&signal), fs, &opt_full).unwrap())
    });
}

criterion_group!(benches, bench_batch_analysis);
criterion_main!(benches);
