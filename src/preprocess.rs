//! Signal conditioning applied before peak detection.
//!
//! All functions take and return [`Array1<f64>`] and leave the input length
//! unchanged.

use ndarray::Array1;

/// Linearly interpolate across runs of samples at or above `threshold`.
///
/// Interior clipped runs are replaced by the ramp between the samples just
/// outside the run, with the fraction `(j - start + 1) / (end - start + 2)`.
/// Leading and trailing clipped runs are left unchanged.
pub fn interpolate_clipping(signal: &Array1<f64>, threshold: f64) -> Array1<f64> {
    let n = signal.len();
    let mut result = signal.clone();
    let clipped: Vec<bool> = signal.iter().map(|&v| v >= threshold).collect();
    let mut i = 0usize;
    while i < n {
        if clipped[i] {
            let start = i;
            while i < n && clipped[i] {
                i += 1;
            }
            let end = i - 1;
            if start > 0 && end < n - 1 {
                let start_val = signal[start - 1];
                let end_val = signal[end + 1];
                let denom = (end - start + 2) as f64;
                for j in start..=end {
                    let t = (j - start + 1) as f64 / denom;
                    result[j] = start_val + t * (end_val - start_val);
                }
            }
        } else {
            i += 1;
        }
    }
    result
}

/// Hampel outlier filter: replace a sample with the local median when it
/// deviates from it by more than `threshold * MAD` over a symmetric window.
pub fn hampel_filter(signal: &Array1<f64>, window_size: usize, threshold: f64) -> Array1<f64> {
    let n = signal.len();
    let mut result = signal.clone();
    let half = (window_size / 2) as isize;
    for i in 0..n as isize {
        let start = (i - half).max(0) as usize;
        let end = ((i + half) as usize).min(n.saturating_sub(1));
        let mut window: Vec<f64> = (start..=end).map(|j| signal[j]).collect();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = window[window.len() / 2];
        let mut deviations: Vec<f64> = window.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mad = deviations[deviations.len() / 2];
        if (signal[i as usize] - median).abs() > threshold * mad {
            result[i as usize] = median;
        }
    }
    result
}

/// Single-pole high-pass at 0.5 Hz; removes slow baseline wander.
pub fn remove_baseline_wander(signal: &Array1<f64>, fs: f64) -> Array1<f64> {
    let n = signal.len();
    let mut result = Array1::zeros(n);
    if n == 0 {
        return result;
    }
    let cutoff = 0.5;
    let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff);
    let dt = 1.0 / fs;
    let alpha = rc / (rc + dt);
    result[0] = signal[0];
    for i in 1..n {
        result[i] = alpha * (result[i - 1] + signal[i] - signal[i - 1]);
    }
    result
}

/// Sharpen systolic upstrokes by mixing in a tenth of the centered derivative.
pub fn enhance_peaks(signal: &Array1<f64>) -> Array1<f64> {
    let n = signal.len();
    if n < 3 {
        return signal.clone();
    }
    let mut result = signal.clone();
    for i in 1..n - 1 {
        let derivative = (signal[i + 1] - signal[i - 1]) / 2.0;
        result[i] = signal[i] + 0.1 * derivative;
    }
    result
}

/// Affine map of `[min(signal), max(signal)]` onto `[new_min, new_max]`.
/// Identity when the input range is below 1e-12.
pub fn scale_data(signal: &Array1<f64>, new_min: f64, new_max: f64) -> Array1<f64> {
    if signal.is_empty() {
        return signal.clone();
    }
    let old_min = signal.iter().cloned().fold(f64::INFINITY, f64::min);
    let old_max = signal.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let old_range = old_max - old_min;
    if old_range < 1e-12 {
        return signal.clone();
    }
    let new_range = new_max - new_min;
    signal.mapv(|v| new_min + (v - old_min) / old_range * new_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn clipping_ramp_is_exact() {
        let x = Array1::from(vec![1.0, 2.0, 3.0, 1020.0, 1020.0, 1020.0, 5.0, 6.0]);
        let y = interpolate_clipping(&x, 1020.0);
        assert_relative_eq!(y[3], 3.5);
        assert_relative_eq!(y[4], 4.0);
        assert_relative_eq!(y[5], 4.5);
        assert_relative_eq!(y[2], 3.0);
        assert_relative_eq!(y[6], 5.0);
    }

    #[test]
    fn clipping_single_sample_fraction_pinned() {
        // run of length 1: t = 1/2, so the sample lands on the midpoint
        let x = Array1::from(vec![0.0, 1020.0, 3.0]);
        let y = interpolate_clipping(&x, 1020.0);
        assert_relative_eq!(y[1], 1.5, epsilon = 1e-12);
    }

    #[test]
    fn clipping_leading_trailing_runs_untouched() {
        let x = Array1::from(vec![1020.0, 1020.0, 2.0, 1020.0]);
        let y = interpolate_clipping(&x, 1020.0);
        assert_eq!(y[0], 1020.0);
        assert_eq!(y[1], 1020.0);
        assert_eq!(y[3], 1020.0);
    }

    #[test]
    fn hampel_replaces_spike() {
        let mut v = vec![1.0; 21];
        v[10] = 100.0;
        let x = Array1::from(v);
        let y = hampel_filter(&x, 6, 3.0);
        assert_relative_eq!(y[10], 1.0);
    }

    #[test]
    fn hampel_idempotent_on_clean_signal() {
        let x = Array1::from(
            (0..50)
                .map(|i| (2.0 * std::f64::consts::PI * i as f64 / 25.0).sin())
                .collect::<Vec<f64>>(),
        );
        let once = hampel_filter(&x, 6, 3.0);
        let twice = hampel_filter(&once, 6, 3.0);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn baseline_wander_removes_offset() {
        let x = Array1::from(vec![10.0; 400]);
        let y = remove_baseline_wander(&x, 50.0);
        assert!(y[399].abs() < 0.5);
    }

    #[test]
    fn enhance_peaks_keeps_endpoints() {
        let x = Array1::from(vec![0.0, 1.0, 0.0, -1.0, 0.0]);
        let y = enhance_peaks(&x);
        assert_eq!(y[0], x[0]);
        assert_eq!(y[4], x[4]);
    }

    #[test]
    fn scale_data_maps_extremes() {
        let x = Array1::from(vec![-2.0, 0.0, 2.0]);
        let y = scale_data(&x, 0.0, 1024.0);
        assert_relative_eq!(y[0], 0.0);
        assert_relative_eq!(y[1], 512.0);
        assert_relative_eq!(y[2], 1024.0);
    }

    #[test]
    fn scale_data_flat_input_is_identity() {
        let x = Array1::from(vec![3.0, 3.0, 3.0]);
        let y = scale_data(&x, 0.0, 1024.0);
        assert_eq!(y, x);
    }

    proptest! {
        #[test]
        fn scale_round_trip(values in proptest::collection::vec(-1000.0f64..1000.0, 3..64)) {
            let x = Array1::from(values);
            let lo = x.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            prop_assume!(hi - lo > 1e-6);
            let scaled = scale_data(&x, 0.0, 1024.0);
            let back = scale_data(&scaled, lo, hi);
            for (a, b) in x.iter().zip(back.iter()) {
                prop_assert!((a - b).abs() < 1e-9);
            }
        }
    }
}
