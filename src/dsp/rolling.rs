//! Rolling-window helpers for the batch peak detector.

use crate::dsp::mean;

/// HeartPy-style rolling mean: simple moving average of `window_seconds * fs`
/// samples, padded at both ends by replicating the first/last mean so the
/// output stays centered and the same length as the input.
pub fn rolling_mean(data: &[f64], fs: f64, window_seconds: f64) -> Vec<f64> {
    let n = data.len();
    let win = (window_seconds * fs) as usize;
    if win <= 1 || n == 0 || win > n {
        return vec![mean(data); n];
    }
    let mut rol = Vec::with_capacity(n - win + 1);
    let mut s: f64 = data[..win].iter().sum();
    rol.push(s / win as f64);
    for i in win..n {
        s += data[i];
        s -= data[i - win];
        rol.push(s / win as f64);
    }
    let n_miss = (n - rol.len()) / 2;
    let front = rol[0];
    let back = rol[rol.len() - 1];
    let mut out = Vec::with_capacity(n);
    out.extend(std::iter::repeat(front).take(n_miss));
    out.extend_from_slice(&rol);
    while out.len() < n {
        out.push(back);
    }
    out.truncate(n);
    out
}

/// Subtract a centered moving average of `window` samples.
pub fn moving_average_detrend(x: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 {
        return x.to_vec();
    }
    let n = x.len();
    let mut cumsum = vec![0.0; n + 1];
    for i in 0..n {
        cumsum[i + 1] = cumsum[i] + x[i];
    }
    let half = window / 2;
    let mut out = vec![0.0; n];
    for i in 0..n {
        let start = i.saturating_sub(half);
        let end = (i + (window - half)).min(n);
        let count = (end - start).max(1);
        let m = (cumsum[end] - cumsum[start]) / count as f64;
        out[i] = x[i] - m;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rolling_mean_matches_length_and_center() {
        let data: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let out = rolling_mean(&data, 10.0, 1.0); // 10-sample window
        assert_eq!(out.len(), data.len());
        // interior values are centered averages of a linear ramp
        assert_relative_eq!(out[50], data[46..56].iter().sum::<f64>() / 10.0, epsilon = 1e-9);
        // ends are padded with the first/last mean
        assert_relative_eq!(out[0], out[4]);
        assert_relative_eq!(out[99], out[95]);
    }

    #[test]
    fn rolling_mean_degenerates_to_global_mean() {
        let data = [1.0, 2.0, 3.0];
        let out = rolling_mean(&data, 100.0, 1.0); // window longer than data
        assert_eq!(out, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn detrend_removes_slow_drift() {
        let x: Vec<f64> = (0..200)
            .map(|i| 0.05 * i as f64 + (2.0 * std::f64::consts::PI * i as f64 / 20.0).sin())
            .collect();
        let y = moving_average_detrend(&x, 20);
        let m = mean(&y[20..180]);
        assert!(m.abs() < 0.1, "residual mean = {m}");
    }

    #[test]
    fn detrend_window_one_is_identity() {
        let x = [5.0, 6.0, 7.0];
        assert_eq!(moving_average_detrend(&x, 1), x.to_vec());
    }
}
