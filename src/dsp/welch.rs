//! Welch power spectral density with the adaptive parameter guard.
//!
//! One-sided density with SciPy-compatible normalization: Hann window,
//! per-segment mean detrend, `|X[k]|^2 / (fs * U)` averaged over segments,
//! interior bins doubled. When the signal is too short for the requested
//! configuration the guard ladder shrinks `nfft` to powers of two and raises
//! the overlap until at least two segments fit; if nothing satisfies the
//! floor, an empty result is returned and the failure counter increments.

use std::sync::atomic::{AtomicU64, Ordering};

use num_complex::Complex64;

use crate::dsp::fft;

static GUARD_FALLBACKS: AtomicU64 = AtomicU64::new(0);
static GUARD_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Times the guard had to adjust nfft/overlap away from the request.
pub fn guard_fallback_count() -> u64 {
    GUARD_FALLBACKS.load(Ordering::Relaxed)
}

/// Times no valid Welch configuration existed and an empty PSD was returned.
pub fn guard_failure_count() -> u64 {
    GUARD_FAILURES.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Default)]
pub struct PsdResult {
    pub freqs: Vec<f64>,
    pub psd: Vec<f64>,
}

impl PsdResult {
    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }
}

const MIN_NFFT: usize = 32;
/// PSD below this resolution is too coarse to be usable downstream.
const MIN_USABLE_NFFT: usize = 64;

fn largest_power_of_two_le(value: usize) -> usize {
    if value < 1 {
        return 0;
    }
    let mut p = 1usize;
    while p << 1 <= value {
        p <<= 1;
    }
    p
}

/// Compute the one-sided Welch PSD of `x`.
pub fn welch_psd(x: &[f64], fs: f64, nfft: usize, overlap: f64) -> PsdResult {
    let n = x.len();
    let requested_nfft = if nfft == 0 { 256 } else { nfft };
    let requested_overlap = overlap.clamp(0.0, 0.95);

    let mut working_nfft = requested_nfft.max(MIN_NFFT);
    let mut working_overlap = requested_overlap;
    let mut step = 1usize;
    let mut nseg = 0usize;
    let mut params_ready = false;
    let mut adjusted = false;

    while working_nfft >= MIN_NFFT {
        if n < working_nfft {
            let next = largest_power_of_two_le(n);
            if next < MIN_NFFT {
                break;
            }
            if next != working_nfft {
                tracing::debug!(n, from = working_nfft, to = next, "signal shorter than nfft, reducing");
                adjusted = true;
                working_nfft = next;
                continue;
            }
        }

        if n <= working_nfft {
            // Even maximal overlap cannot produce two segments at this size.
            if working_nfft == MIN_NFFT {
                break;
            }
            let next = largest_power_of_two_le(working_nfft - 1);
            if next < MIN_NFFT {
                break;
            }
            tracing::debug!(n, from = working_nfft, to = next, "insufficient span for nfft, reducing");
            adjusted = true;
            working_nfft = next;
            continue;
        }

        let mut min_overlap_for_two = 1.0 - (n - working_nfft) as f64 / working_nfft as f64;
        min_overlap_for_two = min_overlap_for_two.clamp(0.0, 0.95);
        let candidate_overlap = working_overlap.max(min_overlap_for_two + 0.02).clamp(0.0, 0.95);

        let step_float = (working_nfft as f64 * (1.0 - candidate_overlap)).max(1.0);
        step = (step_float.round() as usize).max(1);
        nseg = 1 + (n - working_nfft) / step;

        if nseg >= 2 {
            if (candidate_overlap - working_overlap).abs() > 1e-6 {
                adjusted = true;
            }
            working_overlap = candidate_overlap;
            params_ready = true;
            break;
        }

        if candidate_overlap < 0.95 - 1e-6 {
            working_overlap = (candidate_overlap + 0.05).min(0.95);
            adjusted = true;
            continue;
        }

        if working_nfft == MIN_NFFT {
            break;
        }
        let next = largest_power_of_two_le(working_nfft - 1);
        if next < MIN_NFFT {
            break;
        }
        tracing::debug!(n, from = working_nfft, to = next, "rounding prevented two segments, reducing");
        adjusted = true;
        working_nfft = next;
    }

    if !params_ready {
        GUARD_FAILURES.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(n, requested_nfft, "unable to satisfy Welch parameters");
        return PsdResult::default();
    }

    if adjusted {
        GUARD_FALLBACKS.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            from_nfft = requested_nfft,
            to_nfft = working_nfft,
            from_overlap = requested_overlap,
            to_overlap = working_overlap,
            nseg,
            "adjusted Welch parameters"
        );
    }

    if working_nfft < MIN_USABLE_NFFT {
        GUARD_FAILURES.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(nfft = working_nfft, n, "rejecting Welch parameters below usable floor");
        return PsdResult::default();
    }

    let nfft = working_nfft;
    let kmax = nfft / 2 + 1;

    // Hann window and its power normalization.
    let w: Vec<f64> = (0..nfft)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (nfft - 1) as f64).cos())
        .collect();
    let u: f64 = w.iter().map(|v| v * v).sum();

    let mut p = vec![0.0f64; kmax];
    let mut buf = vec![Complex64::new(0.0, 0.0); nfft];
    for s in 0..nseg {
        let start = s * step;
        let seg = &x[start..start + nfft];
        let mu: f64 = seg.iter().sum::<f64>() / nfft as f64;
        for t in 0..nfft {
            buf[t] = Complex64::new((seg[t] - mu) * w[t], 0.0);
        }
        fft::fft_inplace(&mut buf);
        for (k, acc) in p.iter_mut().enumerate() {
            *acc += buf[k].norm_sqr() / (fs * u);
        }
    }
    for v in p.iter_mut() {
        *v /= nseg as f64;
    }

    // One-sided correction; DC and Nyquist stay undoubled.
    if kmax > 1 {
        let last = if nfft % 2 == 0 { kmax - 1 } else { kmax };
        for v in p.iter_mut().take(last).skip(1) {
            *v *= 2.0;
        }
    }

    let freqs: Vec<f64> = (0..kmax).map(|k| fs * k as f64 / nfft as f64).collect();
    PsdResult { freqs, psd: p }
}

/// Trapezoid integration over PSD bins whose frequency falls in `[lo, hi)`.
pub fn integrate_band(freqs: &[f64], psd: &[f64], lo: f64, hi: f64) -> f64 {
    if freqs.len() < 2 || psd.len() != freqs.len() {
        return 0.0;
    }
    let df = freqs[1] - freqs[0];
    let vals: Vec<f64> = freqs
        .iter()
        .zip(psd.iter())
        .filter(|(f, _)| **f >= lo && **f < hi)
        .map(|(_, p)| p.abs())
        .collect();
    if vals.len() < 2 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 1..vals.len() {
        area += 0.5 * (vals[i - 1] + vals[i]) * df;
    }
    area
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(n: usize, fs: f64, hz: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * hz * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn frequency_grid_invariants() {
        let x = tone(1000, 50.0, 1.0);
        let psd = welch_psd(&x, 50.0, 256, 0.5);
        assert_eq!(psd.freqs.len(), 256 / 2 + 1);
        assert_eq!(psd.freqs[0], 0.0);
        assert_relative_eq!(psd.freqs[psd.freqs.len() - 1], 25.0);
        assert_relative_eq!(psd.freqs[1] - psd.freqs[0], 50.0 / 256.0, epsilon = 1e-12);
    }

    #[test]
    fn tone_peak_at_expected_frequency() {
        let x = tone(2000, 100.0, 2.0);
        let psd = welch_psd(&x, 100.0, 512, 0.5);
        let (i, _) = psd
            .psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_relative_eq!(psd.freqs[i], 2.0, epsilon = 0.25);
    }

    #[test]
    fn short_signal_triggers_fallback() {
        let before = guard_fallback_count();
        // 200 samples cannot carry nfft=256; the guard must shrink it.
        let x = tone(200, 50.0, 1.0);
        let psd = welch_psd(&x, 50.0, 256, 0.5);
        assert!(!psd.is_empty());
        assert_eq!(psd.freqs.len(), 128 / 2 + 1);
        assert!(guard_fallback_count() > before);
    }

    #[test]
    fn hopeless_signal_returns_empty() {
        let before = guard_failure_count();
        let x = tone(40, 50.0, 1.0); // best pow2 <= 40 is 32 < usable floor
        let psd = welch_psd(&x, 50.0, 256, 0.5);
        assert!(psd.is_empty());
        assert!(guard_failure_count() > before);
    }

    #[test]
    fn band_integration_captures_tone_power() {
        let x = tone(4000, 100.0, 1.0);
        let psd = welch_psd(&x, 100.0, 1024, 0.5);
        let in_band = integrate_band(&psd.freqs, &psd.psd, 0.8, 1.2);
        let out_band = integrate_band(&psd.freqs, &psd.psd, 3.0, 10.0);
        // A unit sinusoid carries 0.5 power; windowing spreads a little.
        assert!(in_band > 0.3, "in_band = {in_band}");
        assert!(out_band < 0.01 * in_band, "out_band = {out_band}");
    }

    #[test]
    fn integrate_band_empty_on_mismatch() {
        assert_eq!(integrate_band(&[0.0, 1.0], &[1.0], 0.0, 2.0), 0.0);
    }
}
