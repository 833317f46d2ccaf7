//! Output types: the metrics record and its nested quality report.
//!
//! These are the external wire format; field names serialize in camelCase and
//! all numeric fields are IEEE-754 doubles. Arrays are ordered.

use serde::{Deserialize, Serialize};

/// One binary-quality segment over the raw peak accept/reject vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinarySegment {
    /// Segment ordinal.
    pub index: usize,
    /// Start index in `peak_list_raw`.
    pub start_beat: usize,
    /// End index (exclusive).
    pub end_beat: usize,
    pub total_beats: usize,
    pub rejected_beats: usize,
    /// Whether the segment passes the reject threshold.
    pub accepted: bool,
}

/// Quality report attached to every metrics record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityInfo {
    pub total_beats: usize,
    pub rejected_beats: usize,
    pub rejection_rate: f64,
    pub rejected_indices: Vec<usize>,
    pub good_quality: bool,
    pub quality_warning: String,

    // Streaming fields (zero / false when produced by the batch path).
    pub snr_db: f64,
    pub confidence: f64,
    /// HR fundamental used for SNR; may be harmonically remapped.
    pub f0_hz: f64,
    pub ma_perc_active: f64,
    pub doubling_flag: i32,
    pub soft_doubling_flag: i32,
    pub doubling_hint_flag: i32,
    pub hard_fallback_active: i32,
    pub rr_fallback_mode_active: i32,
    pub snr_warmup_active: i32,
    pub p_half_over_fund: f64,
    pub pair_frac: f64,
    pub rr_short_frac: f64,
    pub rr_long_ms: f64,
    pub refractory_ms_active: f64,
    pub min_rr_bound_ms: f64,
    pub soft_streak: i32,
    pub soft_secs: f64,
    pub snr_sample_count: f64,

    // Audit / telemetry (cumulative unless noted).
    pub dropped_samples_total: u64,
    pub dropped_samples_last: u64,
    pub clamped_batches_total: u64,
    pub clamped_batches_last: u64,
    pub oom_prevented_total: u64,
    pub param_change_events_total: u64,
    pub timestamp_backtrack_events_total: u64,
    pub timestamps_skipped_total: u64,
    pub time_jump_events_total: u64,
    pub merge_budget_exhausted: i32,
    pub merge_budget_exhausted_total: u64,
    pub zero_copy_used: u64,
    pub fallback_copy_used: u64,
    pub dropping_active: i32,
}

impl Default for QualityInfo {
    fn default() -> Self {
        Self {
            total_beats: 0,
            rejected_beats: 0,
            rejection_rate: 0.0,
            rejected_indices: Vec::new(),
            good_quality: true,
            quality_warning: String::new(),
            snr_db: 0.0,
            confidence: 0.0,
            f0_hz: 0.0,
            ma_perc_active: 0.0,
            doubling_flag: 0,
            soft_doubling_flag: 0,
            doubling_hint_flag: 0,
            hard_fallback_active: 0,
            rr_fallback_mode_active: 0,
            snr_warmup_active: 0,
            p_half_over_fund: 0.0,
            pair_frac: 0.0,
            rr_short_frac: 0.0,
            rr_long_ms: 0.0,
            refractory_ms_active: 0.0,
            min_rr_bound_ms: 0.0,
            soft_streak: 0,
            soft_secs: 0.0,
            snr_sample_count: 0.0,
            dropped_samples_total: 0,
            dropped_samples_last: 0,
            clamped_batches_total: 0,
            clamped_batches_last: 0,
            oom_prevented_total: 0,
            param_change_events_total: 0,
            timestamp_backtrack_events_total: 0,
            timestamps_skipped_total: 0,
            time_jump_events_total: 0,
            merge_budget_exhausted: 0,
            merge_budget_exhausted_total: 0,
            zero_copy_used: 0,
            fallback_copy_used: 0,
            dropping_active: 0,
        }
    }
}

/// The full cardiac metrics record emitted by batch analysis and `poll`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartMetrics {
    pub bpm: f64,
    /// Inter-beat intervals in ms (from the corrected peak list).
    pub ibi_ms: Vec<f64>,
    /// Timestamps of accepted peaks (empty without a timestamped source).
    pub peak_timestamps: Vec<f64>,
    /// Clean RR intervals after masking/cleaning.
    pub rr_list: Vec<f64>,
    /// Accepted peak indices into the emitted window snapshot.
    pub peak_list: Vec<usize>,
    /// Pre-cleaning peak set.
    pub peak_list_raw: Vec<usize>,
    /// 1 = accepted, 0 = rejected; aligned to `peak_list_raw`.
    pub binary_peak_mask: Vec<i32>,

    /// Window snapshot synchronized with this record.
    #[serde(rename = "waveform_values")]
    pub waveform_values: Vec<f64>,
    #[serde(rename = "waveform_timestamps")]
    pub waveform_timestamps: Vec<f64>,

    // Time domain.
    pub sdnn: f64,
    pub rmssd: f64,
    pub sdsd: f64,
    pub pnn20: f64,
    pub pnn50: f64,
    pub nn20: f64,
    pub nn50: f64,
    pub mad: f64,

    // Poincaré.
    pub sd1: f64,
    pub sd2: f64,
    pub sd1_sd2_ratio: f64,
    pub ellipse_area: f64,

    // Frequency domain (NaN when under-determined).
    pub vlf: f64,
    pub lf: f64,
    pub hf: f64,
    pub lfhf: f64,
    pub total_power: f64,
    pub lf_norm: f64,
    pub hf_norm: f64,

    pub breathing_rate: f64,

    pub quality: QualityInfo,

    /// Per-segment results from segmentwise analysis.
    pub segments: Vec<HeartMetrics>,
    pub binary_segments: Vec<BinarySegment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_camel_case() {
        let m = HeartMetrics { bpm: 60.0, ..Default::default() };
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("bpm").is_some());
        assert!(json.get("ibiMs").is_some());
        assert!(json.get("peakListRaw").is_some());
        assert!(json.get("binaryPeakMask").is_some());
        assert!(json.get("waveform_values").is_some());
        let q = json.get("quality").unwrap();
        assert!(q.get("snrDb").is_some());
        assert!(q.get("softDoublingFlag").is_some());
        assert!(q.get("timestampBacktrackEventsTotal").is_some());
    }

    #[test]
    fn quality_defaults_are_clean() {
        let q = QualityInfo::default();
        assert!(q.good_quality);
        assert_eq!(q.confidence, 0.0);
        assert_eq!(q.snr_warmup_active, 0);
    }
}
