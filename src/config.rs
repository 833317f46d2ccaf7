//! Analysis configuration.
//!
//! Every knob lives in a nested struct with production defaults; hosts can
//! deserialize the camelCase JSON form via [`Options::from_json`] or build the
//! tree in Rust. [`validate_options`] is the single gate that `create`-style
//! entry points call before any allocation happens.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bandpass filter mode for the batch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterMode {
    /// Legacy selection: zero-phase filtfilt when `order >= 3`, RBJ cascade otherwise.
    #[default]
    Auto,
    Rbj,
    ButterFiltfilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanMethod {
    #[default]
    QuotientFilter,
    Iqr,
    ZScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdsdMode {
    Signed,
    #[default]
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoincareMode {
    Formula,
    #[default]
    Masked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BandpassConfig {
    pub low_hz: f64,
    pub high_hz: f64,
    pub order: usize,
    pub mode: FilterMode,
}

impl Default for BandpassConfig {
    fn default() -> Self {
        Self { low_hz: 0.5, high_hz: 5.0, order: 2, mode: FilterMode::Auto }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WelchConfig {
    pub nfft: usize,
    /// Segment overlap ratio, 0..0.95.
    pub overlap: f64,
    /// Welch window size in seconds for the RR tachogram (HeartPy default).
    pub wsize_sec: f64,
    /// Allow the streaming SNR path to shrink nfft / raise overlap when the
    /// window is short, and to fall back to cached PSD / time-domain SNR.
    pub adaptive_psd: bool,
}

impl Default for WelchConfig {
    fn default() -> Self {
        Self { nfft: 256, overlap: 0.5, wsize_sec: 240.0, adaptive_psd: true }
    }
}

/// RR tachogram smoothing applied before cubic-spline resampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RrSplineConfig {
    /// Legacy box-car blend factor, 0..1.
    pub smooth: f64,
    /// Fixed smoothing factor lambda for the CG solver; 0 disables.
    pub s: f64,
    /// If > 0, bisect lambda until the residual SSE reaches this target.
    pub target_sse: f64,
}

impl Default for RrSplineConfig {
    fn default() -> Self {
        Self { smooth: 0.1, s: 10.0, target_sse: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeakConfig {
    pub refractory_ms: f64,
    /// Post-processing guard dropping tightly spaced beats.
    pub min_peak_distance_ms: f64,
    /// `k` in the classical `mean + k*sd` threshold.
    pub threshold_scale: f64,
    pub bpm_min: f64,
    pub bpm_max: f64,
    /// RR outlier band as a fraction of mean RR, clamped to the ms bounds below.
    pub rr_outlier_percent: f64,
    pub rr_outlier_min_ms: f64,
    pub rr_outlier_max_ms: f64,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            refractory_ms: 150.0,
            min_peak_distance_ms: 320.0,
            threshold_scale: 0.3,
            bpm_min: 35.0,
            bpm_max: 180.0,
            rr_outlier_percent: 0.25,
            rr_outlier_min_ms: 180.0,
            rr_outlier_max_ms: 320.0,
        }
    }
}

/// HeartPy-style threshold in the streaming detector: scale the rolling window
/// to [0, 1024] and lift the rolling mean by `ma_perc` percent-units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HpThresholdConfig {
    pub enabled: bool,
    pub ma_perc: f64,
}

impl Default for HpThresholdConfig {
    fn default() -> Self {
        Self { enabled: false, ma_perc: 30.0 }
    }
}

/// RR-predicted gating bounds for the streaming detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatingConfig {
    pub min_rr_gate_factor: f64,
    pub min_rr_floor_relaxed_ms: f64,
    pub min_rr_floor_strict_ms: f64,
    pub min_rr_ceiling_ms: f64,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            min_rr_gate_factor: 0.86,
            min_rr_floor_relaxed_ms: 400.0,
            min_rr_floor_strict_ms: 500.0,
            min_rr_ceiling_ms: 1200.0,
        }
    }
}

/// RR pair-merge correction applied while a doubling state is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeConfig {
    pub band_low: f64,
    pub band_high: f64,
    /// Equal-pair acceptance band around the long-RR target.
    pub equal_band_low: f64,
    pub equal_band_high: f64,
    /// Maximum merges per poll; exhaustion is flagged and counted.
    pub budget: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            band_low: 0.75,
            band_high: 1.25,
            equal_band_low: 0.85,
            equal_band_high: 1.15,
            budget: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DoublingConfig {
    /// Soft activation threshold on the compensated P(f0/2)/P(f0) ratio.
    pub p_half_over_fund_threshold_soft: f64,
    /// Looser sustained-hint threshold.
    pub p_half_over_fund_threshold_low: f64,
    pub half_f0_hist_len: usize,
    pub half_f0_tol_hz_warm: f64,
    pub half_f0_tol_hz_cold: f64,
    pub choke_bpm_threshold: f64,
    pub choke_relax_base_sec: f64,
    pub choke_relax_low_bpm_sec: f64,
}

impl Default for DoublingConfig {
    fn default() -> Self {
        Self {
            p_half_over_fund_threshold_soft: 1.4,
            p_half_over_fund_threshold_low: 1.2,
            half_f0_hist_len: 5,
            half_f0_tol_hz_warm: 0.06,
            half_f0_tol_hz_cold: 0.10,
            choke_bpm_threshold: 35.0,
            choke_relax_base_sec: 5.0,
            choke_relax_low_bpm_sec: 7.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnrConfig {
    pub tau_sec: f64,
    pub active_tau_sec: f64,
    /// Half-width (Hz) of the signal bands in passive mode.
    pub band_passive_hz: f64,
    pub band_active_hz: f64,
    /// Blend toward the instant value when the band mode or width changes.
    pub band_blend_factor: f64,
}

impl Default for SnrConfig {
    fn default() -> Self {
        Self {
            tau_sec: 3.0,
            active_tau_sec: 2.0,
            band_passive_hz: 0.15,
            band_active_hz: 0.25,
            band_blend_factor: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreprocessingConfig {
    pub interp_clipping: bool,
    pub clipping_threshold: f64,
    pub hampel_correct: bool,
    pub hampel_window: usize,
    pub hampel_threshold: f64,
    pub remove_baseline_wander: bool,
    pub enhance_peaks: bool,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            interp_clipping: false,
            clipping_threshold: 1020.0,
            hampel_correct: false,
            hampel_window: 6,
            hampel_threshold: 3.0,
            remove_baseline_wander: false,
            enhance_peaks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityConfig {
    pub reject_segmentwise: bool,
    pub segment_reject_max_rejects: usize,
    pub segment_reject_window_beats: usize,
    /// Overlap ratio between successive binary-quality windows, 0..0.99.
    pub segment_reject_overlap: f64,
    /// HeartPy `threshold_rr` masking on the clean RR list.
    pub threshold_rr: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            reject_segmentwise: false,
            segment_reject_max_rejects: 3,
            segment_reject_window_beats: 10,
            segment_reject_overlap: 0.0,
            threshold_rr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleaningConfig {
    pub clean_rr: bool,
    pub method: CleanMethod,
    pub iterations: usize,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self { clean_rr: false, method: CleanMethod::QuotientFilter, iterations: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    /// Breathing rate in breaths/min instead of Hz.
    pub breathing_as_bpm: bool,
    /// pNN20/pNN50 as percent (0..100) instead of ratio (0..1).
    pub pnn_as_percent: bool,
    pub sdsd_mode: SdsdMode,
    pub poincare_mode: PoincareMode,
    /// Compute VLF/LF/HF and LF/HF (skipped when false).
    pub calc_freq: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            breathing_as_bpm: false,
            pnn_as_percent: true,
            sdsd_mode: SdsdMode::Abs,
            poincare_mode: PoincareMode::Masked,
            calc_freq: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentwiseConfig {
    pub width_sec: f64,
    pub overlap: f64,
    pub min_size_sec: f64,
}

impl Default for SegmentwiseConfig {
    fn default() -> Self {
        Self { width_sec: 120.0, overlap: 0.0, min_size_sec: 20.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingConfig {
    pub use_ring_buffer: bool,
    /// Force the DFT spectral path and snap the SNR EMA cadence.
    pub deterministic: bool,
    pub high_precision: bool,
    pub high_precision_fs: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            use_ring_buffer: false,
            deterministic: false,
            high_precision: false,
            high_precision_fs: 1000.0,
        }
    }
}

/// The full option tree. All fields optional in JSON; missing groups take
/// their production defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub bandpass: BandpassConfig,
    pub welch: WelchConfig,
    pub rr_spline: RrSplineConfig,
    pub peak: PeakConfig,
    pub hp_threshold: HpThresholdConfig,
    pub gating: GatingConfig,
    pub merge: MergeConfig,
    pub doubling: DoublingConfig,
    pub snr: SnrConfig,
    pub preprocessing: PreprocessingConfig,
    pub quality: QualityConfig,
    pub cleaning: CleaningConfig,
    pub output: OutputConfig,
    pub segmentwise: SegmentwiseConfig,
    pub streaming: StreamingConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bandpass: BandpassConfig::default(),
            welch: WelchConfig::default(),
            rr_spline: RrSplineConfig::default(),
            peak: PeakConfig::default(),
            hp_threshold: HpThresholdConfig::default(),
            gating: GatingConfig::default(),
            merge: MergeConfig::default(),
            doubling: DoublingConfig::default(),
            snr: SnrConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            quality: QualityConfig::default(),
            cleaning: CleaningConfig::default(),
            output: OutputConfig::default(),
            segmentwise: SegmentwiseConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl Options {
    /// Parse the camelCase JSON form used by host bridges.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Validate sample rate and option ranges. Called by `registry::create` and
/// `RealtimeAnalyzer::new`; nothing is allocated when this fails.
pub fn validate_options(fs: f64, opt: &Options) -> Result<(), ConfigError> {
    if !fs.is_finite() || !(1.0..=10_000.0).contains(&fs) {
        return Err(ConfigError::InvalidSampleRate(fs));
    }
    let nyquist = fs * 0.5;
    let (low, high) = (opt.bandpass.low_hz, opt.bandpass.high_hz);
    if !low.is_finite() || !high.is_finite() {
        return Err(ConfigError::NonFinite("bandpass"));
    }
    if low < 0.0 || low >= high || high > nyquist {
        return Err(ConfigError::InvalidBandpass { low, high, nyquist });
    }
    if !(64..=16_384).contains(&opt.welch.nfft) {
        return Err(ConfigError::InvalidNfft(opt.welch.nfft));
    }
    if !opt.welch.overlap.is_finite() {
        return Err(ConfigError::NonFinite("welch.overlap"));
    }
    if !(0.0..0.95).contains(&opt.welch.overlap) {
        return Err(ConfigError::NonFinite("welch.overlap"));
    }
    let (bpm_min, bpm_max) = (opt.peak.bpm_min, opt.peak.bpm_max);
    if !bpm_min.is_finite() || !bpm_max.is_finite() {
        return Err(ConfigError::NonFinite("peak.bpm"));
    }
    if bpm_min < 30.0 || bpm_min >= bpm_max || bpm_max > 240.0 {
        return Err(ConfigError::InvalidBpmRange { min: bpm_min, max: bpm_max });
    }
    if !opt.peak.refractory_ms.is_finite() {
        return Err(ConfigError::NonFinite("peak.refractoryMs"));
    }
    if !(50.0..=2000.0).contains(&opt.peak.refractory_ms) {
        return Err(ConfigError::InvalidRefractory(opt.peak.refractory_ms));
    }
    for (name, v) in [
        ("peak.thresholdScale", opt.peak.threshold_scale),
        ("peak.rrOutlierPercent", opt.peak.rr_outlier_percent),
        ("snr.tauSec", opt.snr.tau_sec),
        ("snr.activeTauSec", opt.snr.active_tau_sec),
        ("streaming.highPrecisionFs", opt.streaming.high_precision_fs),
        ("quality.segmentRejectOverlap", opt.quality.segment_reject_overlap),
    ] {
        if !v.is_finite() {
            return Err(ConfigError::NonFinite(name));
        }
    }
    if !(0.0..=1.0).contains(&opt.peak.rr_outlier_percent) {
        return Err(ConfigError::NonFinite("peak.rrOutlierPercent"));
    }
    if !(0.0..0.99).contains(&opt.quality.segment_reject_overlap) {
        return Err(ConfigError::NonFinite("quality.segmentRejectOverlap"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        validate_options(50.0, &Options::default()).unwrap();
        validate_options(100.0, &Options::default()).unwrap();
    }

    #[test]
    fn rejects_bad_fs() {
        let opt = Options::default();
        assert_eq!(validate_options(0.0, &opt).unwrap_err().code(), "E001");
        assert_eq!(validate_options(20_000.0, &opt).unwrap_err().code(), "E001");
        assert_eq!(validate_options(f64::NAN, &opt).unwrap_err().code(), "E001");
    }

    #[test]
    fn rejects_bad_bandpass() {
        let mut opt = Options::default();
        opt.bandpass.low_hz = 6.0;
        opt.bandpass.high_hz = 5.0;
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E011");

        let mut opt = Options::default();
        opt.bandpass.high_hz = 30.0; // above nyquist for fs=50
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E011");
    }

    #[test]
    fn rejects_bad_nfft_bpm_refractory() {
        let mut opt = Options::default();
        opt.welch.nfft = 32;
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E012");

        let mut opt = Options::default();
        opt.peak.bpm_min = 20.0;
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E013");

        let mut opt = Options::default();
        opt.peak.refractory_ms = 10.0;
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E014");
    }

    #[test]
    fn rejects_non_finite_overlap() {
        let mut opt = Options::default();
        opt.welch.overlap = f64::INFINITY;
        assert_eq!(validate_options(50.0, &opt).unwrap_err().code(), "E015");
    }

    #[test]
    fn json_round_trip_partial() {
        let opt = Options::from_json(r#"{"bandpass":{"lowHz":0.7,"highHz":3.0},"peak":{"bpmMax":200.0}}"#)
            .unwrap();
        assert_eq!(opt.bandpass.low_hz, 0.7);
        assert_eq!(opt.bandpass.high_hz, 3.0);
        assert_eq!(opt.peak.bpm_max, 200.0);
        // untouched groups keep defaults
        assert_eq!(opt.welch.nfft, 256);
        assert_eq!(opt.peak.bpm_min, 35.0);
    }

    #[test]
    fn filter_mode_wire_names() {
        let opt = Options::from_json(r#"{"bandpass":{"mode":"BUTTER_FILTFILT"}}"#).unwrap();
        assert_eq!(opt.bandpass.mode, FilterMode::ButterFiltfilt);
    }
}
