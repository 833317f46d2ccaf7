//! Numeric primitives shared across the batch and streaming paths.

pub mod biquad;
pub mod fft;
pub mod rolling;
pub mod spline;
pub mod welch;

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

/// Population standard deviation (ddof = 0).
pub fn std_pop(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let m = mean(v);
    let acc: f64 = v.iter().map(|x| (x - m) * (x - m)).sum();
    (acc / v.len() as f64).sqrt()
}

/// Sample standard deviation (ddof = 1); 0 for fewer than two samples.
pub fn std_samp(v: &[f64]) -> f64 {
    if v.len() <= 1 {
        return 0.0;
    }
    let m = mean(v);
    let acc: f64 = v.iter().map(|x| (x - m) * (x - m)).sum();
    (acc / (v.len() - 1) as f64).sqrt()
}

/// Upper-median (element at index n/2 of the sorted data); 0 for empty input.
pub fn median(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

/// Median absolute deviation around the upper-median.
pub fn mad(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let med = median(v);
    let devs: Vec<f64> = v.iter().map(|x| (x - med).abs()).collect();
    median(&devs)
}

/// Round to 1e-6 precision; threshold comparisons on RR differences use this
/// so float noise cannot flip a strict `>` against a 20/50 ms boundary.
#[inline]
pub fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mean_and_std() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_relative_eq!(mean(&v), 3.0);
        assert_relative_eq!(std_pop(&v), 2.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(std_samp(&v), 2.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(std_pop(&[]), 0.0);
        assert_eq!(median(&[]), 0.0);
        assert_eq!(mad(&[]), 0.0);
    }

    #[test]
    fn median_is_upper_median() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 3.0);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    }

    #[test]
    fn mad_known_value() {
        // data 1..9, median 5, |devs| 0..4 sorted -> upper median 2
        let v: Vec<f64> = (1..=9).map(|x| x as f64).collect();
        assert_eq!(mad(&v), 2.0);
    }

    #[test]
    fn round6_pins_boundaries() {
        assert_eq!(round6(50.000000_4), 50.0);
        assert!(round6(50.000001_4) > 50.0);
    }
}
