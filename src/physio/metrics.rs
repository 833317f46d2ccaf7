//! HRV metric computation: time domain, Poincaré, frequency domain, breathing.

use crate::config::{Options, PoincareMode, SdsdMode};
use crate::dsp::spline::CubicSpline;
use crate::dsp::welch::{integrate_band, welch_psd};
use crate::dsp::{mad, mean, rolling, round6, spline, std_pop};
use crate::types::HeartMetrics;

/// Time-domain statistics over the clean RR list, with successive-difference
/// measures restricted to adjacent pairs whose *original* RR entries are both
/// accepted by `mask` (0 = accepted). `rr_all`/`mask` may be empty, in which
/// case every adjacent pair of `rr_clean` counts.
pub fn time_domain(
    m: &mut HeartMetrics,
    rr_clean: &[f64],
    rr_all: &[f64],
    mask: &[u8],
    opt: &Options,
) {
    if rr_clean.is_empty() {
        return;
    }
    let mean_rr = mean(rr_clean);
    m.bpm = 60_000.0 / mean_rr;
    m.sdnn = std_pop(rr_clean);
    m.mad = mad(rr_clean);

    let (pair_diffs, pair_abs) = masked_pair_diffs(rr_clean, rr_all, mask);
    if pair_diffs.is_empty() {
        m.sdsd = 0.0;
        m.rmssd = 0.0;
        m.pnn20 = 0.0;
        m.pnn50 = 0.0;
        m.nn20 = 0.0;
        m.nn50 = 0.0;
        return;
    }

    m.sdsd = match opt.output.sdsd_mode {
        SdsdMode::Abs => std_pop(&pair_abs),
        SdsdMode::Signed => std_pop(&pair_diffs),
    };
    let sumsq: f64 = pair_diffs.iter().map(|d| d * d).sum();
    m.rmssd = (sumsq / pair_diffs.len() as f64).sqrt();

    // Strict '>' on rounded abs diffs so float noise cannot cross a boundary.
    let mut over20 = 0usize;
    let mut over50 = 0usize;
    for &ad in &pair_abs {
        let v = round6(ad);
        if v > 20.0 {
            over20 += 1;
        }
        if v > 50.0 {
            over50 += 1;
        }
    }
    m.nn20 = over20 as f64;
    m.nn50 = over50 as f64;
    let r20 = over20 as f64 / pair_abs.len() as f64;
    let r50 = over50 as f64 / pair_abs.len() as f64;
    m.pnn20 = if opt.output.pnn_as_percent { 100.0 * r20 } else { r20 };
    m.pnn50 = if opt.output.pnn_as_percent { 100.0 * r50 } else { r50 };
}

fn masked_pair_diffs(rr_clean: &[f64], rr_all: &[f64], mask: &[u8]) -> (Vec<f64>, Vec<f64>) {
    let mut diffs = Vec::new();
    let mut abs = Vec::new();
    if rr_all.len() >= 2 && mask.len() == rr_all.len() {
        for i in 1..rr_all.len() {
            if mask[i] == 0 && mask[i - 1] == 0 {
                let d = rr_all[i] - rr_all[i - 1];
                diffs.push(d);
                abs.push(d.abs());
            }
        }
    } else {
        for w in rr_clean.windows(2) {
            let d = w[1] - w[0];
            diffs.push(d);
            abs.push(d.abs());
        }
    }
    (diffs, abs)
}

/// Poincaré SD1/SD2 plus the derived ratio and ellipse area.
pub fn poincare(m: &mut HeartMetrics, rr_all: &[f64], mask: &[u8], opt: &Options) {
    let masked = matches!(opt.output.poincare_mode, PoincareMode::Masked);
    if masked && rr_all.len() >= 2 {
        let mask_ok = mask.len() == rr_all.len();
        let mut x_plus = Vec::with_capacity(rr_all.len());
        let mut x_minus = Vec::with_capacity(rr_all.len());
        for i in 0..rr_all.len() - 1 {
            let accepted = !mask_ok || mask[i] + mask[i + 1] == 0;
            if accepted {
                x_plus.push(rr_all[i]);
                x_minus.push(rr_all[i + 1]);
            }
        }
        if x_plus.len() >= 2 {
            let inv_sqrt2 = std::f64::consts::FRAC_1_SQRT_2;
            let x_one: Vec<f64> =
                x_plus.iter().zip(&x_minus).map(|(a, b)| (a - b) * inv_sqrt2).collect();
            let x_two: Vec<f64> =
                x_plus.iter().zip(&x_minus).map(|(a, b)| (a + b) * inv_sqrt2).collect();
            m.sd1 = std_pop(&x_one);
            m.sd2 = std_pop(&x_two);
            m.sd1_sd2_ratio = if m.sd2 > 1e-12 { m.sd1 / m.sd2 } else { 0.0 };
            m.ellipse_area = std::f64::consts::PI * m.sd1 * m.sd2;
            return;
        }
    }
    // FORMULA mode (and the masked fallback with too few pairs)
    m.sd1 = m.rmssd / 2.0f64.sqrt();
    m.sd2 = (2.0 * m.sdnn * m.sdnn - 0.5 * m.sdsd * m.sdsd).max(0.0).sqrt();
    m.sd1_sd2_ratio = if m.sd2 > 1e-12 { m.sd1 / m.sd2 } else { 0.0 };
    m.ellipse_area = std::f64::consts::PI * m.sd1 * m.sd2;
}

/// Frequency-domain bands via Welch on the cubic-spline-resampled tachogram.
/// Sets VLF/LF/HF to NaN when the PSD cannot be formed.
pub fn frequency_domain(m: &mut HeartMetrics, rr: &[f64], opt: &Options) {
    if rr.len() < 2 {
        set_freq_nan(m);
        return;
    }
    // cumulative time axis in ms
    let mut rr_x = Vec::with_capacity(rr.len());
    let mut acc = 0.0;
    for &v in rr {
        acc += v;
        rr_x.push(acc);
    }
    let resamp_factor = 4usize;
    let datalen = ((rr_x.len() - 1) * resamp_factor).max(8);
    let start = rr_x[0];
    let stop = rr_x[rr_x.len() - 1];
    let rr_x_new: Vec<f64> = (0..datalen)
        .map(|i| start + (stop - start) * i as f64 / (datalen - 1) as f64)
        .collect();

    // smoothing: target-SSE bisection wins, then fixed-lambda CG, then the
    // legacy box-car blend
    let rr_smooth: Vec<f64> = if opt.rr_spline.target_sse > 0.0 {
        spline::smooth_rr_target_sse(rr, opt.rr_spline.target_sse)
    } else if opt.rr_spline.s > 1e-9 {
        spline::smooth_rr_cg(rr, opt.rr_spline.s)
    } else if opt.rr_spline.smooth > 1e-6 {
        let mut w = (((opt.rr_spline.smooth * rr.len() as f64) / 20.0).round() as usize).max(3);
        if w % 2 == 0 {
            w += 1;
        }
        let filt = spline::boxcar_smooth(rr, w);
        rr.iter()
            .zip(filt.iter())
            .map(|(r, f)| (1.0 - opt.rr_spline.smooth) * r + opt.rr_spline.smooth * f)
            .collect()
    } else {
        rr.to_vec()
    };

    let sp = CubicSpline::natural(&rr_x, &rr_smooth);
    let rr_interp: Vec<f64> = if sp.is_ok() {
        rr_x_new.iter().map(|&x| sp.eval(x)).collect()
    } else {
        vec![rr[0]; datalen]
    };

    let dt = mean(rr) / 1000.0;
    let fs_rr = if dt > 0.0 { 1.0 / dt } else { 1.0 };
    let fs_new = fs_rr * resamp_factor as f64;
    let mut nperseg = if opt.welch.nfft > 0 {
        opt.welch.nfft
    } else {
        (opt.welch.wsize_sec * fs_new).round() as usize
    };
    if nperseg == 0 {
        nperseg = 256;
    }
    nperseg = nperseg.min(rr_interp.len());
    let psd = welch_psd(&rr_interp, fs_new, nperseg, 0.5);
    if psd.is_empty() {
        set_freq_nan(m);
        return;
    }
    m.vlf = integrate_band(&psd.freqs, &psd.psd, 0.0033, 0.04);
    m.lf = integrate_band(&psd.freqs, &psd.psd, 0.04, 0.15);
    m.hf = integrate_band(&psd.freqs, &psd.psd, 0.15, 0.40);
    m.total_power = m.vlf + m.lf + m.hf;
    m.lfhf = if m.hf > 1e-12 { m.lf / m.hf } else { 0.0 };
    let sum_lfhf = m.lf + m.hf;
    if sum_lfhf > 1e-12 {
        m.lf_norm = m.lf / sum_lfhf * 100.0;
        m.hf_norm = m.hf / sum_lfhf * 100.0;
    }
    // breathing: argmax bin in the 0.10..0.40 Hz band of the same PSD
    let mut fpeak = 0.0;
    let mut vmax = -1.0;
    for (f, p) in psd.freqs.iter().zip(psd.psd.iter()) {
        if (0.10..=0.40).contains(f) && *p > vmax {
            vmax = *p;
            fpeak = *f;
        }
    }
    m.breathing_rate = if opt.output.breathing_as_bpm { fpeak * 60.0 } else { fpeak };
}

fn set_freq_nan(m: &mut HeartMetrics) {
    m.vlf = f64::NAN;
    m.lf = f64::NAN;
    m.hf = f64::NAN;
    m.lfhf = f64::NAN;
}

/// Breathing frequency (Hz) from the RR series: linear resample onto a 4 Hz
/// grid, detrend, Welch, argmax in the 0.10..0.40 Hz band. Returns 0 when
/// under-determined.
pub fn breathing_rate(rr_intervals: &[f64]) -> f64 {
    if rr_intervals.len() < 10 {
        return 0.0;
    }
    let mut t = Vec::with_capacity(rr_intervals.len());
    let mut rr_sec = Vec::with_capacity(rr_intervals.len());
    let mut acc = 0.0;
    for &rr in rr_intervals {
        let v = rr * 0.001;
        acc += v;
        t.push(acc);
        rr_sec.push(v);
    }
    let fs = 4.0;
    let duration = t[t.len() - 1] - t[0];
    let n = (duration * fs).floor() as usize;
    if n < 16 {
        return 0.0;
    }
    let dt = 1.0 / fs;
    let mut reg = vec![0.0; n];
    for (i, slot) in reg.iter_mut().enumerate() {
        let time = t[0] + i as f64 * dt;
        let mut k = 1usize;
        while k < t.len() && t[k] < time {
            k += 1;
        }
        if k >= t.len() {
            k = t.len() - 1;
        }
        let (t1, t2) = (t[k - 1], t[k]);
        let v1 = rr_sec[(k - 1).min(rr_sec.len() - 1)];
        let v2 = rr_sec[k.min(rr_sec.len() - 1)];
        let alpha = if t2 - t1 > 0.0 { (time - t1) / (t2 - t1) } else { 0.0 };
        *slot = v1 + alpha * (v2 - v1);
    }
    let reg = rolling::moving_average_detrend(&reg, (2.0 * fs).round() as usize);
    let psd = welch_psd(&reg, fs, 256, 0.5);
    if psd.is_empty() {
        return 0.0;
    }
    let mut fpeak = 0.0;
    let mut pmax = -1.0;
    for (f, p) in psd.freqs.iter().zip(psd.psd.iter()) {
        if (0.10..=0.40).contains(f) && *p > pmax {
            pmax = *p;
            fpeak = *f;
        }
    }
    fpeak.max(0.0)
}

/// SD1/SD2/ratio/area from an unmasked RR list (convenience utility).
pub fn poincare_descriptors(rr_intervals: &[f64]) -> [f64; 4] {
    let mut out = [0.0; 4];
    if rr_intervals.len() < 2 {
        return out;
    }
    let sdnn = crate::dsp::std_samp(rr_intervals);
    let diff: Vec<f64> = rr_intervals.windows(2).map(|w| w[1] - w[0]).collect();
    let rmssd = if diff.is_empty() {
        0.0
    } else {
        (diff.iter().map(|d| d * d).sum::<f64>() / diff.len() as f64).sqrt()
    };
    let sd1 = rmssd / 2.0f64.sqrt();
    let sd_diff = crate::dsp::std_samp(&diff);
    let sd2 = (2.0 * sdnn * sdnn - 0.5 * sd_diff * sd_diff).max(0.0).sqrt();
    out[0] = sd1;
    out[1] = sd2;
    out[2] = if sd2 > 1e-12 { sd1 / sd2 } else { 0.0 };
    out[3] = std::f64::consts::PI * sd1 * sd2;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn time_domain_known_values() {
        let rr = [800.0, 810.0, 790.0, 805.0, 820.0];
        let mut m = HeartMetrics::default();
        time_domain(&mut m, &rr, &rr, &vec![0u8; 5], &opts());
        assert_relative_eq!(m.bpm, 60_000.0 / 805.0, epsilon = 1e-9);
        assert_relative_eq!(m.sdnn, 10.0, epsilon = 1e-9);
        // diffs: 10, -20, 15, 15 -> rmssd = sqrt((100+400+225+225)/4)
        assert_relative_eq!(m.rmssd, (950.0f64 / 4.0).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn pnn_counts_use_strict_rounded_comparison() {
        // diffs: exactly 20, 20.0000004 (rounds to 20), 21, 60
        let rr = [800.0, 820.0, 840.0000004, 861.0000004, 921.0000004];
        let mut m = HeartMetrics::default();
        let mut o = opts();
        o.output.pnn_as_percent = false;
        time_domain(&mut m, &rr, &rr, &vec![0u8; 5], &o);
        assert_eq!(m.nn20, 2.0); // 21 and 60
        assert_eq!(m.nn50, 1.0); // 60 only
        assert_relative_eq!(m.pnn20, 0.5);
        assert_relative_eq!(m.pnn50, 0.25);
    }

    #[test]
    fn masked_pairs_skip_rejected_neighbors() {
        let rr_all = [800.0, 2000.0, 810.0, 805.0];
        let mask = [0u8, 1, 0, 0];
        let mut m = HeartMetrics::default();
        let rr_clean: Vec<f64> = rr_all
            .iter()
            .zip(mask.iter())
            .filter(|(_, &mk)| mk == 0)
            .map(|(v, _)| *v)
            .collect();
        time_domain(&mut m, &rr_clean, &rr_all, &mask, &opts());
        // only the (810, 805) pair survives -> rmssd = 5
        assert_relative_eq!(m.rmssd, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn poincare_formula_vs_masked() {
        let rr = [800.0, 850.0, 790.0, 860.0, 780.0, 855.0];
        let mask = vec![0u8; rr.len()];
        let mut o = opts();

        let mut m1 = HeartMetrics::default();
        time_domain(&mut m1, &rr, &rr, &mask, &o);
        o.output.poincare_mode = PoincareMode::Masked;
        poincare(&mut m1, &rr, &mask, &o);
        assert!(m1.sd1 > 0.0 && m1.sd2 > 0.0);
        assert_relative_eq!(m1.ellipse_area, std::f64::consts::PI * m1.sd1 * m1.sd2);

        let mut m2 = HeartMetrics::default();
        time_domain(&mut m2, &rr, &rr, &mask, &o);
        o.output.poincare_mode = PoincareMode::Formula;
        poincare(&mut m2, &rr, &mask, &o);
        assert_relative_eq!(m2.sd1, m2.rmssd / 2.0f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn frequency_domain_finds_modulation() {
        // 256 RRs around 800 ms with a slow oscillation -> LF-visible power
        let rr: Vec<f64> = (0..256)
            .map(|i| 800.0 + 50.0 * (2.0 * std::f64::consts::PI * 0.08 * i as f64 * 0.8).sin())
            .collect();
        let mut m = HeartMetrics::default();
        frequency_domain(&mut m, &rr, &opts());
        assert!(m.vlf.is_finite());
        assert!(m.lf > 0.0);
        assert!(m.total_power > 0.0);
        assert!(m.lf_norm + m.hf_norm > 99.0);
    }

    #[test]
    fn frequency_domain_nan_when_underdetermined() {
        let mut m = HeartMetrics::default();
        frequency_domain(&mut m, &[800.0], &opts());
        assert!(m.vlf.is_nan());
        assert!(m.lfhf.is_nan());
    }

    #[test]
    fn breathing_rate_sees_rsa() {
        // RR modulated at 0.25 Hz (15 breaths/min), mean RR 800 ms
        let rr: Vec<f64> = (0..240)
            .map(|i| {
                let t = i as f64 * 0.8;
                800.0 + 40.0 * (2.0 * std::f64::consts::PI * 0.25 * t).sin()
            })
            .collect();
        let br = breathing_rate(&rr);
        assert!((br - 0.25).abs() < 0.05, "breathing = {br}");
    }

    #[test]
    fn breathing_rate_underdetermined_is_zero() {
        assert_eq!(breathing_rate(&[800.0; 5]), 0.0);
    }
}
