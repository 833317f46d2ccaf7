//! RR-interval cleaning and segment-wise binary quality.
//!
//! Mask convention follows HeartPy: 0 = accepted, 1 = rejected, indexed over
//! the *original* RR list so downstream pair logic can see both endpoints.

use crate::dsp::{mean, std_samp};
use crate::types::BinarySegment;

/// HeartPy `threshold_rr`: reject RRs outside `mean ± max(0.3*mean, 300 ms)`.
/// Boundaries are exclusive for acceptance (`<=` / `>=` reject).
pub fn threshold_rr_mask(rr: &[f64]) -> Vec<u8> {
    if rr.is_empty() {
        return Vec::new();
    }
    let mean_rr = mean(rr);
    let margin = (0.3 * mean_rr).max(300.0);
    let lower = mean_rr - margin;
    let upper = mean_rr + margin;
    rr.iter().map(|&v| u8::from(v <= lower || v >= upper)).collect()
}

/// Quotient filter on successive RR ratios; marks `rr[i]` rejected when
/// `rr[i]/rr[i+1]` leaves `[0.8, 1.2]`, skipping pairs already masked.
pub fn quotient_filter_mask(rr: &[f64], base_mask: &[u8], iterations: usize) -> Vec<u8> {
    let n = rr.len();
    let mut mask: Vec<u8> = if base_mask.is_empty() { vec![0; n] } else { base_mask.to_vec() };
    for _ in 0..iterations {
        if n < 2 {
            break;
        }
        for i in 0..n - 1 {
            if mask[i] + mask[i + 1] != 0 {
                continue;
            }
            let r2 = rr[i + 1];
            if r2 == 0.0 {
                mask[i] = 1;
                continue;
            }
            let q = rr[i] / r2;
            if !(0.8..=1.2).contains(&q) {
                mask[i] = 1;
            }
        }
    }
    mask
}

/// IQR outlier removal; also reports the bounds used.
pub fn remove_outliers_iqr(data: &[f64]) -> (Vec<f64>, f64, f64) {
    if data.len() < 4 {
        return (data.to_vec(), f64::NEG_INFINITY, f64::INFINITY);
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3 = sorted[3 * n / 4];
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;
    let kept = data.iter().cloned().filter(|v| *v >= lower && *v <= upper).collect();
    (kept, lower, upper)
}

/// Z-score outlier removal with a sample-std denominator.
pub fn remove_outliers_zscore(data: &[f64], threshold: f64) -> Vec<f64> {
    if data.len() < 3 {
        return data.to_vec();
    }
    let m = mean(data);
    let sd = std_samp(data);
    if sd < 1e-12 {
        return data.to_vec();
    }
    data.iter().cloned().filter(|v| ((v - m) / sd).abs() <= threshold).collect()
}

/// Quotient-filter removal keeping first/last and interior values whose
/// ratios to both neighbors stay in `[0.8, 1.2]`.
pub fn remove_outliers_quotient(rr: &[f64]) -> Vec<f64> {
    if rr.len() < 3 {
        return rr.to_vec();
    }
    let mut result = vec![rr[0]];
    for i in 1..rr.len() - 1 {
        let q1 = rr[i] / rr[i - 1];
        let q2 = rr[i + 1] / rr[i];
        if (0.8..=1.2).contains(&q1) && (0.8..=1.2).contains(&q2) {
            result.push(rr[i]);
        }
    }
    result.push(rr[rr.len() - 1]);
    result
}

/// Segment-wise binary quality over the raw-peak accept/reject vector.
///
/// Windows of `window_beats` advance by `window_beats * (1 - overlap)`; a
/// window with more than `max_rejects` rejects flips entirely to rejected.
/// Returns one record per window and mutates `keep` in place.
pub fn check_binary_quality(
    keep: &mut [u8],
    window_beats: usize,
    max_rejects: usize,
    overlap: f64,
) -> Vec<BinarySegment> {
    let seg_size = window_beats.max(1);
    let step = ((seg_size as f64 * (1.0 - overlap.clamp(0.0, 0.99))).round() as usize).max(1);
    let mut segments = Vec::new();
    let mut idx = 0usize;
    while idx < keep.len() {
        let end = (idx + seg_size).min(keep.len());
        let rejected = keep[idx..end].iter().filter(|&&k| k == 0).count();
        let accepted = rejected <= max_rejects;
        if !accepted {
            for k in keep[idx..end].iter_mut() {
                *k = 0;
            }
        }
        segments.push(BinarySegment {
            index: idx / seg_size,
            start_beat: idx,
            end_beat: end,
            total_beats: end - idx,
            rejected_beats: rejected,
            accepted,
        });
        idx += step;
        if idx >= keep.len() {
            break;
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_rr_drops_long_interval() {
        let rr = [800.0, 810.0, 790.0, 2000.0, 805.0, 820.0];
        let mask = threshold_rr_mask(&rr);
        assert_eq!(mask, vec![0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn threshold_rr_boundary_is_rejecting() {
        // mean = 1000, margin = 300 -> exactly 1300 rejected (>=)
        let rr = [700.1, 1000.0, 1299.9, 1300.0 - 0.0, 700.0];
        let mask = threshold_rr_mask(&rr);
        let mean_rr = mean(&rr);
        let upper = mean_rr + (0.3 * mean_rr).max(300.0);
        for (i, &v) in rr.iter().enumerate() {
            assert_eq!(mask[i] == 1, v >= upper || v <= mean_rr - (0.3 * mean_rr).max(300.0));
        }
    }

    #[test]
    fn quotient_mask_flags_ratio_breaks() {
        let rr = [800.0, 820.0, 500.0, 810.0, 805.0];
        let mask = quotient_filter_mask(&rr, &[], 2);
        // 820/500 = 1.64 -> index 1 rejected; 500/810 skipped next pass only
        assert_eq!(mask[1], 1);
        assert_eq!(mask[0], 0);
        assert_eq!(mask[4], 0);
    }

    #[test]
    fn iqr_removes_extreme() {
        let mut data: Vec<f64> = vec![800.0; 12];
        data[5] = 802.0;
        data.push(3000.0);
        let (kept, _, upper) = remove_outliers_iqr(&data);
        assert!(upper < 3000.0);
        assert_eq!(kept.len(), data.len() - 1);
    }

    #[test]
    fn zscore_keeps_flat_data() {
        let data = vec![800.0; 10];
        assert_eq!(remove_outliers_zscore(&data, 3.0).len(), 10);
    }

    #[test]
    fn zscore_removes_far_point() {
        let mut data: Vec<f64> = (0..20).map(|i| 800.0 + i as f64).collect();
        data.push(5000.0);
        let kept = remove_outliers_zscore(&data, 3.0);
        assert!(!kept.contains(&5000.0));
    }

    #[test]
    fn quotient_removal_keeps_endpoints() {
        let rr = [800.0, 1500.0, 810.0];
        let out = remove_outliers_quotient(&rr);
        assert_eq!(out, vec![800.0, 810.0]);
    }

    #[test]
    fn binary_quality_flips_bad_window() {
        // 10-beat window with 4 rejects (> max 3) flips whole window
        let mut keep = vec![1u8; 12];
        keep[1] = 0;
        keep[3] = 0;
        keep[5] = 0;
        keep[7] = 0;
        let segs = check_binary_quality(&mut keep, 10, 3, 0.0);
        assert_eq!(segs.len(), 2);
        assert!(!segs[0].accepted);
        assert_eq!(segs[0].rejected_beats, 4);
        assert!(keep[..10].iter().all(|&k| k == 0));
        // trailing window of 2 accepted beats survives
        assert!(segs[1].accepted);
        assert_eq!(keep[10], 1);
    }

    #[test]
    fn binary_quality_overlap_advances_partially() {
        let mut keep = vec![1u8; 20];
        let segs = check_binary_quality(&mut keep, 10, 3, 0.5);
        // step of 5 beats -> windows at 0,5,10,15
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[1].start_beat, 5);
    }
}
