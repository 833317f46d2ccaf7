//! End-to-end batch scenarios.

use approx::assert_relative_eq;
use ndarray::Array1;
use pulsekit::{
    analyze_rr_intervals, analyze_signal, interpolate_clipping, scale_data, Options,
};

fn sine(fs: f64, hz: f64, seconds: f64) -> Vec<f64> {
    let n = (fs * seconds) as usize;
    (0..n).map(|i| (2.0 * std::f64::consts::PI * hz * i as f64 / fs).sin()).collect()
}

#[test]
fn clean_sinusoid_full_pipeline() {
    let fs = 50.0;
    let x = sine(fs, 1.0, 30.0);
    let m = analyze_signal(&x, fs, &Options::default()).unwrap();
    assert!((m.bpm - 60.0).abs() < 2.0, "bpm = {}", m.bpm);
    assert!(m.rmssd < 5.0);
    assert!(m.quality.good_quality);
    assert_eq!(m.binary_peak_mask.len(), m.peak_list_raw.len());
    // mask invariants: accepted count equals the corrected peak list
    let accepted = m.binary_peak_mask.iter().filter(|&&b| b == 1).count();
    assert_eq!(accepted, m.peak_list.len());
}

#[test]
fn noisy_sinusoid_still_in_band() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let fs = 50.0;
    let mut rng = StdRng::seed_from_u64(7);
    let x: Vec<f64> = sine(fs, 1.2, 30.0)
        .into_iter()
        .map(|v| v + 0.15 * (rng.gen::<f64>() - 0.5))
        .collect();
    let m = analyze_signal(&x, fs, &Options::default()).unwrap();
    assert!((m.bpm - 72.0).abs() < 6.0, "bpm = {}", m.bpm);
}

#[test]
fn threshold_rr_drops_outlier_interval() {
    let rr = [800.0, 810.0, 790.0, 2000.0, 805.0, 820.0];
    let mut opt = Options::default();
    opt.quality.threshold_rr = true;
    let m = analyze_rr_intervals(&rr, &opt);
    assert_relative_eq!(m.bpm, 60_000.0 / 805.0, epsilon = 1e-9);
    assert!(m.sdnn < 15.0, "sdnn = {}", m.sdnn);
}

#[test]
fn clipping_interpolation_contract() {
    let x = Array1::from(vec![1.0, 2.0, 3.0, 1020.0, 1020.0, 1020.0, 5.0, 6.0]);
    let y = interpolate_clipping(&x, 1020.0);
    let expected = [1.0, 2.0, 3.0, 3.5, 4.0, 4.5, 5.0, 6.0];
    for (a, b) in y.iter().zip(expected.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn scale_round_trip_recovers_signal() {
    let x = Array1::from(sine(50.0, 1.0, 5.0));
    let lo = x.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let back = scale_data(&scale_data(&x, 0.0, 1024.0), lo, hi);
    for (a, b) in x.iter().zip(back.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn metrics_serialize_to_wire_format() {
    let fs = 50.0;
    let x = sine(fs, 1.0, 30.0);
    let m = analyze_signal(&x, fs, &Options::default()).unwrap();
    let json = serde_json::to_value(&m).unwrap();
    for field in [
        "bpm", "sdnn", "rmssd", "sdsd", "pnn20", "pnn50", "mad", "sd1", "sd2",
        "ibiMs", "rrList", "peakList", "peakListRaw", "binaryPeakMask",
        "waveform_values", "waveform_timestamps", "breathingRate",
    ] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
    let q = json.get("quality").unwrap();
    for field in ["snrDb", "confidence", "f0Hz", "doublingFlag", "softDoublingFlag"] {
        assert!(q.get(field).is_some(), "missing quality field {field}");
    }
}

#[test]
fn segmentwise_rejects_nothing_by_default() {
    let fs = 50.0;
    let x = sine(fs, 1.0, 100.0);
    let mut opt = Options::default();
    opt.segmentwise.width_sec = 30.0;
    let m = pulsekit::analyze_signal_segmentwise(&x, fs, &opt).unwrap();
    assert!(m.segments.len() >= 3);
    for seg in &m.segments {
        assert!((seg.bpm - 60.0).abs() < 3.0);
    }
}

#[test]
fn rr_cleaning_methods_converge() {
    let mut rr = vec![820.0, 810.0, 790.0, 805.0, 795.0, 815.0, 800.0, 790.0];
    rr.insert(4, 1900.0); // ectopic-like outlier
    for method in [
        pulsekit::CleanMethod::QuotientFilter,
        pulsekit::CleanMethod::Iqr,
        pulsekit::CleanMethod::ZScore,
    ] {
        let mut opt = Options::default();
        opt.cleaning.clean_rr = true;
        opt.cleaning.method = method;
        opt.quality.threshold_rr = true;
        let m = analyze_rr_intervals(&rr, &opt);
        assert!(
            (m.bpm - 74.5).abs() < 3.0,
            "method {method:?} bpm = {}",
            m.bpm
        );
    }
}
