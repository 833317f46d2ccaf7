//! FFT plumbing: a process-wide plan cache plus the bit-stable DFT fallback.
//!
//! Plans are cached by transform length behind one mutex so concurrent
//! analyzers share setup work. The deterministic toggle forces the scalar DFT
//! path, which is slower but bit-identical across platforms and lengths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use num_complex::Complex64;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustfft::{Fft, FftPlanner};

static DETERMINISTIC: AtomicBool = AtomicBool::new(false);

/// Force the scalar DFT path in all spectral routines (process-wide).
pub fn set_deterministic(on: bool) {
    DETERMINISTIC.store(on, Ordering::Relaxed);
}

pub fn is_deterministic() -> bool {
    DETERMINISTIC.load(Ordering::Relaxed)
}

struct PlanCache {
    planner: FftPlanner<f64>,
    plans: HashMap<usize, Arc<dyn Fft<f64>>>,
}

static PLAN_CACHE: Lazy<Mutex<PlanCache>> = Lazy::new(|| {
    Mutex::new(PlanCache { planner: FftPlanner::new(), plans: HashMap::new() })
});

fn plan_forward(n: usize) -> Arc<dyn Fft<f64>> {
    let mut cache = PLAN_CACHE.lock();
    if let Some(plan) = cache.plans.get(&n) {
        return Arc::clone(plan);
    }
    let plan = cache.planner.plan_fft_forward(n);
    tracing::debug!(nfft = n, "created FFT plan cache entry");
    cache.plans.insert(n, Arc::clone(&plan));
    plan
}

/// In-place forward transform. Uses the cached plan unless deterministic mode
/// is on, in which case a naive DFT is evaluated instead.
pub fn fft_inplace(buf: &mut [Complex64]) {
    let n = buf.len();
    if n <= 1 {
        return;
    }
    if is_deterministic() {
        let out = dft_forward(buf);
        buf.copy_from_slice(&out);
        return;
    }
    plan_forward(n).process(buf);
}

fn dft_forward(input: &[Complex64]) -> Vec<Complex64> {
    let n = input.len();
    let mut out = vec![Complex64::new(0.0, 0.0); n];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut acc = Complex64::new(0.0, 0.0);
        for (t, x) in input.iter().enumerate() {
            let ang = -2.0 * std::f64::consts::PI * (k as f64) * (t as f64) / n as f64;
            acc += x * Complex64::new(ang.cos(), ang.sin());
        }
        *slot = acc;
    }
    out
}

/// Forward transform of a real, already-windowed segment; returns the first
/// `n/2 + 1` bins.
pub fn real_spectrum(segment: &[f64]) -> Vec<Complex64> {
    let n = segment.len();
    let mut buf: Vec<Complex64> = segment.iter().map(|&x| Complex64::new(x, 0.0)).collect();
    fft_inplace(&mut buf);
    buf.truncate(n / 2 + 1);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(n: usize, cycles: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * cycles * i as f64 / n as f64).sin())
            .collect()
    }

    #[test]
    fn fft_and_dft_agree() {
        let x = tone(64, 5.0);
        set_deterministic(false);
        let fast = real_spectrum(&x);
        set_deterministic(true);
        let slow = real_spectrum(&x);
        set_deterministic(false);
        assert_eq!(fast.len(), slow.len());
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert_relative_eq!(a.re, b.re, epsilon = 1e-9, max_relative = 1e-9);
            assert_relative_eq!(a.im, b.im, epsilon = 1e-9, max_relative = 1e-9);
        }
    }

    #[test]
    fn tone_lands_in_expected_bin() {
        let x = tone(128, 8.0);
        let spec = real_spectrum(&x);
        let (peak_bin, _) = spec
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm_sqr().partial_cmp(&b.1.norm_sqr()).unwrap())
            .unwrap();
        assert_eq!(peak_bin, 8);
    }

    #[test]
    fn one_sided_length() {
        let x = tone(64, 3.0);
        assert_eq!(real_spectrum(&x).len(), 33);
    }
}
