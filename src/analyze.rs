//! Batch analysis entry points.
//!
//! `analyze_signal` is the full pipeline: preprocessing, detrend + bandpass
//! (for the spectral/quality path), HeartPy-style peak fitting on the scaled
//! signal, RR outlier masking, segment-wise quality, spacing guard, and the
//! metric computation. `analyze_rr_intervals` skips straight to masking and
//! metrics; `analyze_signal_segmentwise` repeats the pipeline over windows.

use ndarray::Array1;
use tracing::debug;

use crate::config::{CleanMethod, FilterMode, Options};
use crate::dsp::{biquad, mean, rolling};
use crate::error::AnalysisError;
use crate::physio::{metrics, peaks, rr};
use crate::preprocess;
use crate::types::{HeartMetrics, QualityInfo};

/// Analyze a finite PPG signal and produce one metrics record.
pub fn analyze_signal(
    signal: &[f64],
    fs: f64,
    opt: &Options,
) -> Result<HeartMetrics, AnalysisError> {
    if signal.is_empty() {
        return Err(AnalysisError::EmptySignal);
    }
    if fs <= 0.0 || !fs.is_finite() {
        return Err(AnalysisError::InvalidSampleRate(fs));
    }

    let mut m = HeartMetrics::default();
    let mut processed = Array1::from(signal.to_vec());

    if opt.preprocessing.interp_clipping {
        processed = preprocess::interpolate_clipping(&processed, opt.preprocessing.clipping_threshold);
    }
    if opt.preprocessing.hampel_correct {
        processed = preprocess::hampel_filter(
            &processed,
            opt.preprocessing.hampel_window,
            opt.preprocessing.hampel_threshold,
        );
    }
    if opt.preprocessing.remove_baseline_wander {
        processed = preprocess::remove_baseline_wander(&processed, fs);
    }
    if opt.preprocessing.enhance_peaks {
        processed = preprocess::enhance_peaks(&processed);
    }

    // Ensure a positive baseline before scaling.
    let min_val = processed.iter().cloned().fold(f64::INFINITY, f64::min);
    if min_val < 0.0 {
        processed.mapv_inplace(|v| v + min_val.abs());
    }

    debug!(len = processed.len(), fs, "batch analysis start");

    // Detrend + bandpass feed the spectral/quality path; peak detection works
    // on the scaled processed signal.
    let detrend_win = ((0.75 * fs).round() as usize).max(5);
    let processed_vec = processed.to_vec();
    let detrended = rolling::moving_average_detrend(&processed_vec, detrend_win);
    let filtered = apply_bandpass(&detrended, fs, opt);

    let scaled = preprocess::scale_data(&processed, 0.0, 1024.0).to_vec();
    let fit = peaks::fit_peaks(&scaled, fs, opt.peak.bpm_min, opt.peak.bpm_max);
    let mut detected = if fit.ok {
        fit.peaks
    } else {
        peaks::detect_peaks_adaptive(
            &scaled,
            fs,
            opt.peak.refractory_ms,
            opt.peak.threshold_scale,
            opt.peak.bpm_min,
            opt.peak.bpm_max,
        )
    };
    if opt.streaming.high_precision && opt.streaming.high_precision_fs > fs && !detected.is_empty() {
        detected = peaks::interpolate_peaks(&scaled, &detected, fs, opt.streaming.high_precision_fs);
    }
    m.peak_list = detected.clone();
    m.peak_list_raw = detected.clone();
    debug!(raw_peaks = m.peak_list_raw.len(), sweep_ok = fit.ok, "peak detection done");

    m.quality = assess_signal_quality(&filtered, &detected, fs);

    // HeartPy check_peaks: drop peaks whose incoming RR leaves the band
    // mean +- clamp(percent*mean, min, max) ms.
    if detected.len() >= 2 {
        let rr_raw: Vec<f64> =
            detected.windows(2).map(|w| (w[1] - w[0]) as f64 * 1000.0 / fs).collect();
        let mean_rr = mean(&rr_raw);
        let rr_percent = opt.peak.rr_outlier_percent.clamp(0.0, 1.0);
        let percent_delta = mean_rr * rr_percent;
        let delta_min = opt.peak.rr_outlier_min_ms.max(0.0);
        let delta_max = if opt.peak.rr_outlier_max_ms > 0.0 {
            opt.peak.rr_outlier_max_ms.max(delta_min)
        } else {
            percent_delta.max(delta_min)
        };
        let rr_delta = percent_delta.clamp(
            if delta_min > 0.0 { delta_min } else { percent_delta },
            delta_max,
        );
        let lower = mean_rr - rr_delta;
        let upper = mean_rr + rr_delta;

        let mut keep = vec![1u8; detected.len()];
        for (i, &v) in rr_raw.iter().enumerate() {
            if v <= lower || v >= upper {
                keep[i + 1] = 0;
            }
        }

        if opt.quality.reject_segmentwise {
            m.binary_segments = rr::check_binary_quality(
                &mut keep,
                opt.quality.segment_reject_window_beats,
                opt.quality.segment_reject_max_rejects,
                opt.quality.segment_reject_overlap,
            );
        }

        let mut peaks_cor = Vec::with_capacity(detected.len());
        let mut accepted_raw = Vec::with_capacity(detected.len());
        m.binary_peak_mask = Vec::with_capacity(keep.len());
        m.quality.rejected_indices.clear();
        for (i, &k) in keep.iter().enumerate() {
            m.binary_peak_mask.push(i32::from(k));
            if k == 1 {
                peaks_cor.push(detected[i]);
                accepted_raw.push(i);
            } else {
                m.quality.rejected_indices.push(i);
            }
        }

        // Spacing guard: ceil(ms*fs/1000) samples, ties kept (strict '<').
        if opt.peak.min_peak_distance_ms > 0.0 && peaks_cor.len() > 1 {
            let min_samples = (opt.peak.min_peak_distance_ms * fs / 1000.0).ceil() as usize;
            if min_samples > 1 {
                let mut filtered_peaks = vec![peaks_cor[0]];
                let mut filtered_raw = vec![accepted_raw[0]];
                let mut last = peaks_cor[0];
                let mut removed = 0usize;
                for idx in 1..peaks_cor.len() {
                    let sample = peaks_cor[idx];
                    let raw_idx = accepted_raw[idx];
                    if sample - last < min_samples {
                        keep[raw_idx] = 0;
                        m.binary_peak_mask[raw_idx] = 0;
                        m.quality.rejected_indices.push(raw_idx);
                        removed += 1;
                        continue;
                    }
                    filtered_peaks.push(sample);
                    filtered_raw.push(raw_idx);
                    last = sample;
                }
                if removed > 0 {
                    debug!(removed, min_samples, "spacing guard removed peaks");
                    peaks_cor = filtered_peaks;
                }
            }
        }

        m.ibi_ms = peaks_cor.windows(2).map(|w| (w[1] - w[0]) as f64 * 1000.0 / fs).collect();
        m.peak_list = peaks_cor;
        m.quality.rejected_indices.sort_unstable();
        m.quality.rejected_indices.dedup();
        m.quality.rejected_beats = m.quality.rejected_indices.len();
        if m.quality.total_beats > 0 {
            m.quality.rejection_rate =
                m.quality.rejected_beats as f64 / m.quality.total_beats as f64;
            m.quality.good_quality = m.quality.rejection_rate < 0.3;
            if !m.quality.good_quality && m.quality.quality_warning.is_empty() {
                m.quality.quality_warning = "High rejection rate".to_string();
            }
        }
    }

    m.rr_list = m.ibi_ms.clone();

    // threshold_rr masking before optional cleaning
    let mut rr_mask: Vec<u8> = Vec::new();
    let rr_all = m.ibi_ms.clone();
    if opt.quality.threshold_rr && !m.rr_list.is_empty() {
        rr_mask = rr::threshold_rr_mask(&m.rr_list);
        let rr_cor: Vec<f64> = m
            .rr_list
            .iter()
            .zip(rr_mask.iter())
            .filter(|(_, &mk)| mk == 0)
            .map(|(v, _)| *v)
            .collect();
        if !rr_cor.is_empty() {
            m.rr_list = rr_cor;
        }
    }

    if opt.cleaning.clean_rr && !m.rr_list.is_empty() {
        apply_cleaning(&mut m, &rr_all, &mut rr_mask, opt);
    }

    if !m.rr_list.is_empty() {
        let mask_for_pairs = if rr_mask.len() == rr_all.len() { rr_mask.clone() } else { Vec::new() };
        let rr_clean = m.rr_list.clone();
        metrics::time_domain(&mut m, &rr_clean, &rr_all, &mask_for_pairs, opt);
        if m.rr_list.len() >= 2 {
            metrics::poincare(&mut m, &rr_all, &mask_for_pairs, opt);
        }
        if m.rr_list.len() >= 10 {
            let br_hz = metrics::breathing_rate(&m.rr_list);
            m.breathing_rate = if opt.output.breathing_as_bpm { br_hz * 60.0 } else { br_hz };
        }
    }

    if opt.output.calc_freq && m.ibi_ms.len() >= 2 {
        let rr_for_freq = m.ibi_ms.clone();
        metrics::frequency_domain(&mut m, &rr_for_freq, opt);
    } else {
        m.vlf = f64::NAN;
        m.lf = f64::NAN;
        m.hf = f64::NAN;
        m.lfhf = f64::NAN;
    }

    debug!(bpm = m.bpm, rr = m.rr_list.len(), "batch analysis done");
    Ok(m)
}

fn apply_bandpass(x: &[f64], fs: f64, opt: &Options) -> Vec<f64> {
    let lo = opt.bandpass.low_hz.max(0.0001);
    let hi = opt.bandpass.high_hz.max(0.0001);
    match opt.bandpass.mode {
        FilterMode::Rbj => {
            biquad::bandpass_filter(x, fs, opt.bandpass.low_hz, opt.bandpass.high_hz, opt.bandpass.order)
        }
        FilterMode::ButterFiltfilt => biquad::butter_filtfilt(x, fs, lo, hi, opt.bandpass.order),
        FilterMode::Auto => {
            if opt.bandpass.order >= 3 {
                biquad::butter_filtfilt(x, fs, lo, hi, opt.bandpass.order)
            } else {
                biquad::bandpass_filter(
                    x,
                    fs,
                    opt.bandpass.low_hz,
                    opt.bandpass.high_hz,
                    opt.bandpass.order,
                )
            }
        }
    }
}

fn apply_cleaning(m: &mut HeartMetrics, rr_all: &[f64], rr_mask: &mut Vec<u8>, opt: &Options) {
    match opt.cleaning.method {
        CleanMethod::Iqr => {
            let (kept, _, _) = rr::remove_outliers_iqr(&m.rr_list);
            m.rr_list = kept;
        }
        CleanMethod::ZScore => {
            m.rr_list = rr::remove_outliers_zscore(&m.rr_list, 3.0);
        }
        CleanMethod::QuotientFilter => {
            let qmask = rr::quotient_filter_mask(rr_all, rr_mask, opt.cleaning.iterations.max(1));
            let rr_clean: Vec<f64> = rr_all
                .iter()
                .zip(qmask.iter())
                .filter(|(_, &mk)| mk == 0)
                .map(|(v, _)| *v)
                .collect();
            if !rr_clean.is_empty() {
                m.rr_list = rr_clean;
            }
            *rr_mask = qmask;
        }
    }
}

/// Signal quality from the raw peak set: count RRs outside 300..2000 ms.
pub fn assess_signal_quality(_signal: &[f64], peaks: &[usize], fs: f64) -> QualityInfo {
    let mut quality = QualityInfo { total_beats: peaks.len(), ..Default::default() };
    if peaks.len() < 2 {
        quality.good_quality = false;
        quality.quality_warning = "Insufficient peaks detected".to_string();
        return quality;
    }
    let rr: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64 * 1000.0 / fs).collect();
    let bad = rr.iter().filter(|&&v| !(300.0..=2000.0).contains(&v)).count();
    quality.rejected_beats = bad;
    quality.rejection_rate = bad as f64 / rr.len() as f64;
    quality.good_quality = quality.rejection_rate < 0.3;
    if !quality.good_quality {
        quality.quality_warning = "High rejection rate".to_string();
    }
    quality
}

/// Repeat `analyze_signal` over windows of `segmentwise.width_sec` seconds
/// with the configured overlap, averaging BPM/SDNN/RMSSD over valid segments.
pub fn analyze_signal_segmentwise(
    signal: &[f64],
    fs: f64,
    opt: &Options,
) -> Result<HeartMetrics, AnalysisError> {
    if signal.is_empty() {
        return Err(AnalysisError::EmptySignal);
    }
    if fs <= 0.0 || !fs.is_finite() {
        return Err(AnalysisError::InvalidSampleRate(fs));
    }
    let mut result = HeartMetrics::default();
    let segment_len = (opt.segmentwise.width_sec * fs) as usize;
    let step = ((segment_len as f64 * (1.0 - opt.segmentwise.overlap)) as usize).max(1);
    let min_size = (opt.segmentwise.min_size_sec * fs) as usize;

    let mut start = 0usize;
    while start < signal.len() {
        let end = (start + segment_len).min(signal.len());
        if end - start < min_size {
            break;
        }
        if let Ok(seg) = analyze_signal(&signal[start..end], fs, opt) {
            if seg.quality.good_quality || !opt.quality.reject_segmentwise {
                result.segments.push(seg);
            }
        }
        start += step;
    }

    let valid: Vec<&HeartMetrics> = result.segments.iter().filter(|s| s.bpm > 0.0).collect();
    if !valid.is_empty() {
        let n = valid.len() as f64;
        result.bpm = valid.iter().map(|s| s.bpm).sum::<f64>() / n;
        result.sdnn = valid.iter().map(|s| s.sdnn).sum::<f64>() / n;
        result.rmssd = valid.iter().map(|s| s.rmssd).sum::<f64>() / n;
    }
    Ok(result)
}

/// Analyze a pre-extracted RR series (ms): masking + cleaning + metrics, no
/// filtering or peak detection.
pub fn analyze_rr_intervals(rr_ms: &[f64], opt: &Options) -> HeartMetrics {
    let mut m = HeartMetrics { rr_list: rr_ms.to_vec(), ..Default::default() };
    if rr_ms.is_empty() {
        return m;
    }

    let mut rr_mask = vec![0u8; rr_ms.len()];
    if opt.quality.threshold_rr {
        rr_mask = rr::threshold_rr_mask(rr_ms);
        let rr_cor: Vec<f64> = rr_ms
            .iter()
            .zip(rr_mask.iter())
            .filter(|(_, &mk)| mk == 0)
            .map(|(v, _)| *v)
            .collect();
        if !rr_cor.is_empty() {
            m.rr_list = rr_cor;
        }
    }

    if opt.cleaning.clean_rr {
        apply_cleaning(&mut m, rr_ms, &mut rr_mask, opt);
    }

    if !m.rr_list.is_empty() {
        let rr_clean = m.rr_list.clone();
        metrics::time_domain(&mut m, &rr_clean, rr_ms, &rr_mask, opt);
        if m.rr_list.len() >= 2 {
            metrics::poincare(&mut m, rr_ms, &rr_mask, opt);
        }
        if m.rr_list.len() >= 10 {
            let br_hz = metrics::breathing_rate(&m.rr_list);
            m.breathing_rate = if opt.output.breathing_as_bpm { br_hz * 60.0 } else { br_hz };
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine_ppg(fs: f64, hz: f64, seconds: f64) -> Vec<f64> {
        let n = (fs * seconds) as usize;
        (0..n).map(|i| (2.0 * std::f64::consts::PI * hz * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn clean_sinusoid_reports_60_bpm() {
        let fs = 50.0;
        let x = sine_ppg(fs, 1.0, 30.0);
        let m = analyze_signal(&x, fs, &Options::default()).unwrap();
        assert!((m.bpm - 60.0).abs() < 2.0, "bpm = {}", m.bpm);
        assert!(m.rmssd < 5.0, "rmssd = {}", m.rmssd);
        assert!(m.quality.good_quality);
    }

    #[test]
    fn empty_signal_is_an_error() {
        let err = analyze_signal(&[], 50.0, &Options::default()).unwrap_err();
        assert_eq!(err.code(), "E102");
        let err = analyze_signal(&[1.0, 2.0], 0.0, &Options::default()).unwrap_err();
        assert_eq!(err.code(), "E001");
    }

    #[test]
    fn rr_intervals_threshold_scenario() {
        let rr = [800.0, 810.0, 790.0, 2000.0, 805.0, 820.0];
        let mut opt = Options::default();
        opt.quality.threshold_rr = true;
        let m = analyze_rr_intervals(&rr, &opt);
        assert_relative_eq!(m.bpm, 60_000.0 / 805.0, epsilon = 1e-9);
        assert!(m.sdnn < 15.0, "sdnn = {}", m.sdnn);
        assert_eq!(m.rr_list.len(), 5);
    }

    #[test]
    fn rr_intervals_without_cleaning_keeps_all() {
        let rr = [800.0, 810.0, 790.0];
        let m = analyze_rr_intervals(&rr, &Options::default());
        assert_eq!(m.rr_list.len(), 3);
        assert_relative_eq!(m.bpm, 60_000.0 / 800.0, epsilon = 1e-9);
    }

    #[test]
    fn binary_mask_aligns_with_raw_peaks() {
        let fs = 50.0;
        let x = sine_ppg(fs, 1.0, 30.0);
        let m = analyze_signal(&x, fs, &Options::default()).unwrap();
        assert_eq!(m.binary_peak_mask.len(), m.peak_list_raw.len());
        let accepted = m.binary_peak_mask.iter().filter(|&&b| b == 1).count();
        assert_eq!(accepted, m.peak_list.len());
    }

    #[test]
    fn segmentwise_averages_segments() {
        let fs = 50.0;
        let x = sine_ppg(fs, 1.0, 120.0);
        let mut opt = Options::default();
        opt.segmentwise.width_sec = 40.0;
        opt.segmentwise.min_size_sec = 20.0;
        let m = analyze_signal_segmentwise(&x, fs, &opt).unwrap();
        assert!(m.segments.len() >= 3);
        assert!((m.bpm - 60.0).abs() < 2.0);
    }

    #[test]
    fn spacing_guard_strict_inequality() {
        // peaks exactly min_peak_distance apart must be kept
        let fs = 100.0;
        let mut opt = Options::default();
        opt.peak.min_peak_distance_ms = 320.0; // == 32 samples at 100 Hz
        let mut x = vec![0.0; 400];
        for p in [50usize, 82, 114, 146, 178, 210] {
            x[p] = 100.0;
        }
        let m = analyze_signal(&x, fs, &opt).unwrap();
        // all gaps equal exactly 32 samples, strict '<' keeps them
        assert!(m.peak_list.len() >= 5, "kept = {:?}", m.peak_list);
    }

    #[test]
    fn quality_warning_on_too_few_peaks() {
        let q = assess_signal_quality(&[], &[5], 50.0);
        assert!(!q.good_quality);
        assert_eq!(q.quality_warning, "Insufficient peaks detected");
    }
}
