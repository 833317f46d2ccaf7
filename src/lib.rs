//! # pulsekit
//!
//! Real-time photoplethysmography (PPG) heart-rate analysis.
//!
//! This crate provides:
//! - **Batch analysis**: preprocessing, HeartPy-style adaptive peak fitting,
//!   RR cleaning, and time/frequency-domain HRV metrics over a finite signal
//! - **Streaming analysis**: a sliding-window analyzer with an incremental
//!   peak detector, Welch-based SNR tracking, and harmonic doubling
//!   suppression, polled at a configurable cadence
//! - **Host plumbing**: a process-wide handle registry with a stable error
//!   taxonomy and a camelCase JSON wire format for the metrics record
//!
//! ## Example
//!
//! ```
//! use pulsekit::{analyze_signal, Options, RealtimeAnalyzer};
//!
//! // Batch: one record from a finite signal
//! let fs = 50.0;
//! let signal: Vec<f64> = (0..(fs as usize * 30))
//!     .map(|i| (2.0 * std::f64::consts::PI * i as f64 / fs).sin())
//!     .collect();
//! let metrics = analyze_signal(&signal, fs, &Options::default()).unwrap();
//! assert!((metrics.bpm - 60.0).abs() < 3.0);
//!
//! // Streaming: push camera luma samples, poll for updates
//! let analyzer = RealtimeAnalyzer::new(fs, Options::default()).unwrap();
//! let chunk: Vec<f32> = signal.iter().map(|&v| v as f32).collect();
//! analyzer.push(&chunk[..500]);
//! let _maybe_update = analyzer.poll();
//! ```

pub mod analyze;
pub mod config;
pub mod dsp;
pub mod error;
pub mod physio;
pub mod preprocess;
pub mod stream;
pub mod types;

pub use analyze::{analyze_rr_intervals, analyze_signal, analyze_signal_segmentwise};
pub use config::{
    validate_options, CleanMethod, FilterMode, Options, PoincareMode, SdsdMode,
};
pub use error::{AnalysisError, ConfigError, StreamError};
pub use types::{BinarySegment, HeartMetrics, QualityInfo};

pub use dsp::fft::{is_deterministic, set_deterministic};
pub use dsp::welch::{guard_failure_count, guard_fallback_count, welch_psd, PsdResult};

pub use preprocess::{
    enhance_peaks, hampel_filter, interpolate_clipping, remove_baseline_wander, scale_data,
};

pub use physio::metrics::{breathing_rate, poincare_descriptors};
pub use physio::rr::{remove_outliers_iqr, remove_outliers_quotient, remove_outliers_zscore};

pub use stream::registry;
pub use stream::RealtimeAnalyzer;
