//! Realtime streaming analyzer.
//!
//! One analyzer owns a sliding window of filtered samples, an online peak
//! detector with RR-predicted gating and dynamic refractory, and the SNR /
//! doubling poll engine. `push` appends and filters under the data lock;
//! `poll` snapshots the window under the same lock, releases it, runs the
//! heavy analysis under a separate engine lock, and reacquires the data lock
//! only to commit quality and gating state. Holding the data lock across the
//! PSD computation would block ingestion, so the split is load-bearing.

pub mod doubling;
pub mod registry;
pub mod ring;
pub mod snr;

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{validate_options, Options};
use crate::dsp::biquad::{design_bandpass_stream, Biquad};
use crate::dsp::median;
use crate::error::ConfigError;
use crate::types::{HeartMetrics, QualityInfo};
use ring::RingBuffer;
use snr::{PollEngine, PollSnapshot};

const MAX_WINDOW_SEC: f64 = 300.0;
const TIME_JUMP_SEC: f64 = 2.0;
const DEFAULT_WINDOW_SEC: f64 = 10.0;
/// Scaled-units trough depth required between consecutive accepted peaks.
const TROUGH_DELTA: f64 = 140.0;
/// High-BPM persistence threshold feeding the RR-only hint path.
const BPM_HIGH_THRESHOLD: f64 = 120.0;

/// Saturating capacity product; reports whether the cap was hit.
fn safe_size_mul(a: f64, b: f64, cap: usize) -> (usize, bool) {
    if !(a.is_finite() && b.is_finite()) || a <= 0.0 || b <= 0.0 {
        return (0, false);
    }
    let prod = a * b;
    if prod >= cap as f64 {
        (cap, true)
    } else {
        (prod as usize, false)
    }
}

pub(crate) struct StreamState {
    fs: f64,
    opt: Options,
    window_sec: f64,
    update_sec: f64,
    psd_update_sec: f64,
    display_hz: f64,

    // window storage
    use_ring: bool,
    signal: Vec<f32>,
    filt: Vec<f32>,
    timestamps: Vec<f64>,
    ring_signal: RingBuffer<f32>,
    ring_filt: RingBuffer<f32>,
    display_buf: Vec<f32>,
    chain: Vec<Biquad>,

    // rolling statistics (~0.75 s)
    win_samples: usize,
    roll_win: VecDeque<f32>,
    roll_sum: f64,
    roll_sumsq: f64,
    roll_rect: VecDeque<f32>,
    rect_sum: f64,
    rect_sumsq: f64,
    rect_min_q: VecDeque<f32>,
    rect_max_q: VecDeque<f32>,

    // absolute indexing
    first_abs: u64,
    total_abs: u64,
    peaks_abs: Vec<u64>,
    accepted_peaks_total: u64,
    prev1: f32,
    prev2: f32,

    // timebase
    last_emit_time: f64,
    last_ts: f64,
    first_ts_approx: f64,
    warmup_start_ts: f64,
    effective_fs: f64,
    ema_alpha: f64,

    // thresholding
    hp_threshold: bool,
    ma_perc: f64,

    // gating state shared with the poll commit
    bpm_ema: f64,
    bpm_ema_valid: bool,
    last_bpm_update_ts: f64,
    last_f0_hz: f64,
    last_ref_ms_active: f64,
    last_min_rr_bound_ms: f64,
    short_reject_count: u32,
    short_reject_window_start: f64,
    temp_lift_boost: f64,
    temp_lift_until: f64,
    dyn_ref_extra_samples: usize,
    dyn_ref_until: f64,
    soft_doubling_active: bool,
    doubling_active: bool,
    doubling_hint_active: bool,
    doubling_long_rr_ms: f64,
    hard_fallback_until: f64,
    doubling_hold_until: f64,
    choke_relax_until: f64,
    bpm_high_active: bool,
    bpm_high_start_ts: f64,

    // cached outputs
    last_quality: QualityInfo,
    last_peaks: Vec<usize>,
    last_rr: Vec<f64>,

    // audit counters
    dropped_samples_total: u64,
    dropped_samples_last: u64,
    clamped_batches_total: u64,
    clamped_batches_last: u64,
    oom_prevented_total: u64,
    param_change_events_total: u64,
    ts_backtrack_events_total: u64,
    ts_skipped_total: u64,
    time_jump_events_total: u64,
    drop_consec_polls: u32,
    zero_copy_used: u64,
    fallback_copy_used: u64,
}

impl StreamState {
    fn new(fs: f64, opt: Options) -> Self {
        let window_sec = DEFAULT_WINDOW_SEC;
        let update_sec = (window_sec * 0.08).clamp(0.2, 0.5);
        let chain = if opt.bandpass.low_hz > 0.0 || opt.bandpass.high_hz > 0.0 {
            design_bandpass_stream(fs, opt.bandpass.low_hz, opt.bandpass.high_hz, opt.bandpass.order.max(1))
        } else {
            Vec::new()
        };
        let win_samples = ((0.75 * fs).round() as usize).max(5);
        let ma_perc = opt.hp_threshold.ma_perc.clamp(10.0, 60.0);
        let hp_threshold = opt.hp_threshold.enabled;
        let use_ring = opt.streaming.use_ring_buffer;
        let (cap, saturated) = safe_size_mul(window_sec, fs, usize::MAX / 8);
        let mut state = Self {
            fs,
            opt,
            window_sec,
            update_sec,
            psd_update_sec: 2.0,
            display_hz: 60.0,
            use_ring,
            signal: Vec::with_capacity(if use_ring { 0 } else { cap }),
            filt: Vec::with_capacity(if use_ring { 0 } else { cap }),
            timestamps: Vec::new(),
            ring_signal: RingBuffer::with_capacity(cap.max(1)),
            ring_filt: RingBuffer::with_capacity(cap.max(1)),
            display_buf: Vec::new(),
            chain,
            win_samples,
            roll_win: VecDeque::new(),
            roll_sum: 0.0,
            roll_sumsq: 0.0,
            roll_rect: VecDeque::new(),
            rect_sum: 0.0,
            rect_sumsq: 0.0,
            rect_min_q: VecDeque::new(),
            rect_max_q: VecDeque::new(),
            first_abs: 0,
            total_abs: 0,
            peaks_abs: Vec::new(),
            accepted_peaks_total: 0,
            prev1: 0.0,
            prev2: 0.0,
            last_emit_time: 0.0,
            last_ts: 0.0,
            first_ts_approx: 0.0,
            warmup_start_ts: f64::NAN,
            effective_fs: fs,
            ema_alpha: 0.1,
            hp_threshold,
            ma_perc,
            bpm_ema: 0.0,
            bpm_ema_valid: false,
            last_bpm_update_ts: 0.0,
            last_f0_hz: 0.0,
            last_ref_ms_active: 0.0,
            last_min_rr_bound_ms: 0.0,
            short_reject_count: 0,
            short_reject_window_start: 0.0,
            temp_lift_boost: 0.0,
            temp_lift_until: 0.0,
            dyn_ref_extra_samples: 0,
            dyn_ref_until: 0.0,
            soft_doubling_active: false,
            doubling_active: false,
            doubling_hint_active: false,
            doubling_long_rr_ms: 0.0,
            hard_fallback_until: 0.0,
            doubling_hold_until: 0.0,
            choke_relax_until: 0.0,
            bpm_high_active: false,
            bpm_high_start_ts: 0.0,
            last_quality: QualityInfo::default(),
            last_peaks: Vec::new(),
            last_rr: Vec::new(),
            dropped_samples_total: 0,
            dropped_samples_last: 0,
            clamped_batches_total: 0,
            clamped_batches_last: 0,
            oom_prevented_total: 0,
            param_change_events_total: 0,
            ts_backtrack_events_total: 0,
            ts_skipped_total: 0,
            time_jump_events_total: 0,
            drop_consec_polls: 0,
            zero_copy_used: 0,
            fallback_copy_used: 0,
        };
        if saturated {
            state.oom_prevented_total += 1;
        }
        state
    }

    #[inline]
    fn eff_fs(&self) -> f64 {
        if self.effective_fs > 1e-6 {
            self.effective_fs
        } else {
            self.fs
        }
    }

    fn window_len(&self) -> usize {
        if self.use_ring {
            self.ring_filt.len()
        } else {
            self.filt.len()
        }
    }

    #[inline]
    fn filt_at(&self, rel: usize) -> f32 {
        if self.use_ring {
            self.ring_filt.at(rel)
        } else {
            self.filt[rel]
        }
    }

    fn ingest(&mut self, samples: &[f32], timestamps: Option<&[f64]>) {
        if samples.is_empty() {
            return;
        }
        self.clamped_batches_last = 0;
        self.dropped_samples_last = 0;
        let max_batch = (10.0 * self.fs).ceil() as usize;
        let mut n = samples.len();
        if n > max_batch {
            n = max_batch;
            self.clamped_batches_total += 1;
            self.clamped_batches_last += 1;
            warn!(len = samples.len(), max_batch, "push batch clamped");
        }
        let samples = &samples[..n];

        match timestamps {
            None => {
                if self.window_len() == 0 && self.total_abs == 0 {
                    self.first_ts_approx = 0.0;
                    self.last_ts = n as f64 / self.fs;
                    if !self.warmup_start_ts.is_finite() {
                        self.warmup_start_ts = 0.0;
                    }
                } else {
                    self.last_ts += n as f64 / self.fs;
                }
                for &s in samples {
                    self.process_sample(s, None);
                }
            }
            Some(ts_all) => {
                let ts = &ts_all[..n.min(ts_all.len())];
                if ts.len() >= 2 {
                    let dt = (ts[ts.len() - 1] - ts[0]) / (ts.len() - 1) as f64;
                    if dt > 1e-6 {
                        let fs_batch = 1.0 / dt;
                        if self.effective_fs <= 0.0 {
                            self.effective_fs = fs_batch;
                        } else {
                            self.effective_fs =
                                (1.0 - self.ema_alpha) * self.effective_fs + self.ema_alpha * fs_batch;
                        }
                    }
                }
                if self.window_len() == 0 && self.total_abs == 0 {
                    self.first_ts_approx = ts.first().copied().unwrap_or(0.0);
                    if !self.warmup_start_ts.is_finite() {
                        self.warmup_start_ts = self.first_ts_approx;
                    }
                }
                let mut last_seen = self.last_ts;
                for (i, &s) in samples.iter().enumerate() {
                    let t = ts[i];
                    if t < last_seen {
                        self.ts_backtrack_events_total += 1;
                        self.ts_skipped_total += 1;
                        continue;
                    }
                    if self.total_abs > 0 && (t - last_seen) > TIME_JUMP_SEC {
                        self.time_jump_events_total += 1;
                    }
                    self.process_sample(s, Some(t));
                    last_seen = t;
                }
                self.last_ts = last_seen;
            }
        }
        self.rebuild_display();
        self.trim_to_window();
    }

    fn process_sample(&mut self, s: f32, ts: Option<f64>) {
        let mut y = s as f64;
        for bi in self.chain.iter_mut() {
            y = bi.process(y);
        }
        let yout = y as f32;

        if self.use_ring {
            self.ring_signal.push_back(s);
            self.ring_filt.push_back(yout);
            if let Some(t) = ts {
                self.timestamps.push(t);
                let cur = self.ring_filt.len();
                if self.timestamps.len() > cur {
                    let drop = self.timestamps.len() - cur;
                    self.timestamps.drain(..drop);
                }
            }
        } else {
            self.signal.push(s);
            self.filt.push(yout);
            if let Some(t) = ts {
                self.timestamps.push(t);
            }
        }

        // rolling windows
        self.roll_win.push_back(yout);
        self.roll_sum += yout as f64;
        self.roll_sumsq += yout as f64 * yout as f64;
        let yr = yout.max(0.0);
        self.roll_rect.push_back(yr);
        self.rect_sum += yr as f64;
        self.rect_sumsq += yr as f64 * yr as f64;
        while let Some(&back) = self.rect_min_q.back() {
            if back > yr {
                self.rect_min_q.pop_back();
            } else {
                break;
            }
        }
        self.rect_min_q.push_back(yr);
        while let Some(&back) = self.rect_max_q.back() {
            if back < yr {
                self.rect_max_q.pop_back();
            } else {
                break;
            }
        }
        self.rect_max_q.push_back(yr);
        while self.roll_win.len() > self.win_samples {
            let u = self.roll_win.pop_front().unwrap_or(0.0);
            self.roll_sum -= u as f64;
            self.roll_sumsq -= u as f64 * u as f64;
        }
        while self.roll_rect.len() > self.win_samples {
            let u = self.roll_rect.pop_front().unwrap_or(0.0);
            self.rect_sum -= u as f64;
            self.rect_sumsq -= u as f64 * u as f64;
            if self.rect_min_q.front() == Some(&u) {
                self.rect_min_q.pop_front();
            }
            if self.rect_max_q.front() == Some(&u) {
                self.rect_max_q.pop_front();
            }
        }

        // incremental local-max test, one sample behind input
        if self.total_abs >= 2 {
            let y2 = self.prev2;
            let y1 = self.prev1;
            let y0 = yout;
            if y1 > y2 && y1 >= y0 {
                self.try_accept(self.total_abs - 1, y1, ts.is_some());
            }
        }

        self.prev2 = self.prev1;
        self.prev1 = yout;
        if let Some(t) = ts {
            self.last_ts = t;
        }
        self.total_abs += 1;
    }

    /// Threshold + gating decision for the candidate at `abs_idx`.
    fn try_accept(&mut self, abs_idx: u64, y1: f32, with_ts: bool) {
        let eff_fs = self.eff_fs();
        let n_win = self.roll_win.len().max(1) as f64;
        let mean = self.roll_sum / n_win;
        let sd = (self.roll_sumsq / n_win - mean * mean).max(0.0).sqrt();
        let rect_n = self.roll_rect.len().max(1) as f64;
        let rect_mean = self.rect_sum / rect_n;
        let rect_sd = (self.rect_sumsq / rect_n - rect_mean * rect_mean).max(0.0).sqrt();

        let y1r = y1.max(0.0) as f64;
        let vmin = self.rect_min_q.front().copied().unwrap_or(y1.max(0.0)) as f64;
        let vmax = self.rect_max_q.front().copied().unwrap_or(y1.max(0.0)) as f64;
        let den = (vmax - vmin).max(1e-6);
        let tnow = self.first_ts_approx + (abs_idx - self.first_abs) as f64 / eff_fs;

        let (thr, thr_scaled, y1_cmp, sd_cmp);
        if self.hp_threshold {
            let scaled_mean = (rect_mean - vmin) / den * 1024.0;
            let base_lift = scaled_mean * self.ma_perc / 100.0;
            let lift = base_lift + if tnow < self.temp_lift_until { self.temp_lift_boost } else { 0.0 };
            thr = scaled_mean + lift;
            thr_scaled = thr;
            y1_cmp = (y1r - vmin) / den * 1024.0;
            sd_cmp = rect_sd / den * 1024.0;
        } else {
            thr = mean + self.opt.peak.threshold_scale * sd;
            thr_scaled = (thr - vmin) / den * 1024.0;
            y1_cmp = y1 as f64;
            sd_cmp = sd;
        }
        if y1_cmp <= thr {
            return;
        }

        let mut allow = true;
        if let Some(&last_abs) = self.peaks_abs.last() {
            let rr_new_ms = (abs_idx - last_abs) as f64 / eff_fs * 1000.0;
            let mut bpm_prior = if self.bpm_ema_valid {
                self.bpm_ema
            } else {
                0.5 * (self.opt.peak.bpm_min + self.opt.peak.bpm_max)
            };
            bpm_prior = bpm_prior.clamp(self.opt.peak.bpm_min, self.opt.peak.bpm_max);
            let rr_prior_ms = (60_000.0 / bpm_prior.max(1e-6))
                .clamp(self.opt.gating.min_rr_floor_relaxed_ms, self.opt.gating.min_rr_ceiling_ms);
            let accepted_rr = self.accepted_peaks_total.saturating_sub(1);
            let gate_rel = tnow >= 15.0
                && accepted_rr >= 10
                && self.bpm_ema_valid
                && self.bpm_ema < 100.0;
            let floor_ms = if gate_rel {
                self.opt.gating.min_rr_floor_relaxed_ms
            } else {
                self.opt.gating.min_rr_floor_strict_ms
            };
            let mut min_rr_ms = (0.7 * rr_prior_ms).max(floor_ms);

            // Unified long-RR gating while any doubling state holds.
            if self.soft_doubling_active || self.doubling_active || self.doubling_hint_active {
                let mut long_est: f64 = 0.0;
                if self.doubling_long_rr_ms > 0.0 {
                    long_est = long_est.max(self.doubling_long_rr_ms);
                }
                if !self.last_rr.is_empty() {
                    long_est = long_est.max(2.0 * median(&self.last_rr));
                }
                if self.last_f0_hz > 1e-9 {
                    long_est = long_est.max(1000.0 / self.last_f0_hz);
                }
                if long_est > 0.0 {
                    long_est = long_est.clamp(600.0, self.opt.gating.min_rr_ceiling_ms);
                    let min_soft = (self.opt.gating.min_rr_gate_factor * long_est).clamp(
                        self.opt.gating.min_rr_floor_relaxed_ms,
                        self.opt.gating.min_rr_ceiling_ms,
                    );
                    min_rr_ms = min_rr_ms.max(min_soft);
                    if self.doubling_active && self.doubling_long_rr_ms > 0.0 {
                        if tnow <= self.hard_fallback_until {
                            min_rr_ms = min_rr_ms.max(0.9 * self.doubling_long_rr_ms);
                        } else if tnow < self.doubling_hold_until {
                            min_rr_ms = min_rr_ms.max(0.8 * self.doubling_long_rr_ms);
                        }
                    }
                }
            }
            // Choke relaxation loosens the gate while armed.
            if tnow < self.choke_relax_until {
                min_rr_ms *= 0.5;
            }

            if rr_new_ms < min_rr_ms {
                let last_cmp = self.amp_cmp_of(last_abs, y1, vmin, den);
                let margin = if gate_rel { 1.0 } else { 2.5 };
                if y1_cmp <= last_cmp + margin * sd_cmp {
                    allow = false;
                }
            }

            if !allow {
                if (tnow - self.short_reject_window_start) > 3.0 {
                    self.short_reject_window_start = tnow;
                    self.short_reject_count = 0;
                }
                self.short_reject_count += 1;
                if self.short_reject_count > 3 {
                    self.temp_lift_boost = self.temp_lift_boost.max(10.0);
                    self.temp_lift_until = tnow + 2.0;
                    let cap_extra =
                        ((0.35 - self.opt.peak.refractory_ms * 0.001).max(0.0) * eff_fs).round() as usize;
                    self.dyn_ref_extra_samples = self
                        .dyn_ref_extra_samples
                        .max((0.05 * eff_fs).round() as usize)
                        .min(cap_extra);
                    self.dyn_ref_until = tnow + 2.0;
                }
            }
            if tnow > self.dyn_ref_until {
                self.dyn_ref_extra_samples = 0;
            }

            // diagnostics: the refractory and min-RR bound actually applied
            let dyn_base_ref =
                ((0.4 * rr_prior_ms).clamp(280.0, 450.0) * 0.001 * eff_fs).round() as usize;
            let mut applied_ref = dyn_base_ref + self.dyn_ref_extra_samples;
            if self.doubling_active && tnow <= self.hard_fallback_until {
                let fallback_ref =
                    (((0.5 * rr_prior_ms).min(450.0)) * 0.001 * eff_fs).round() as usize;
                applied_ref = applied_ref.max(fallback_ref);
            }
            self.last_ref_ms_active = applied_ref as f64 * 1000.0 / eff_fs;
            self.last_min_rr_bound_ms = min_rr_ms;

            // Trough guard: the scaled signal must dip well below threshold
            // between the last accepted peak and this candidate.
            if allow && with_ts {
                let start_abs = last_abs.max(self.first_abs);
                let mut min_cmp = f64::INFINITY;
                let mut idx = start_abs;
                while idx < abs_idx {
                    let rel = (idx - self.first_abs) as usize;
                    if rel < self.window_len() {
                        let v = self.filt_at(rel).max(0.0) as f64;
                        min_cmp = min_cmp.min((v - vmin) / den * 1024.0);
                    }
                    idx += 1;
                }
                if !(min_cmp < thr_scaled - TROUGH_DELTA) {
                    allow = false;
                }
            }
        }

        if !allow {
            return;
        }
        match self.peaks_abs.last().copied() {
            None => {
                self.peaks_abs.push(abs_idx);
                self.accepted_peaks_total += 1;
            }
            Some(last_abs) => {
                let mut bpm_prior2 = if self.bpm_ema_valid {
                    self.bpm_ema
                } else {
                    0.5 * (self.opt.peak.bpm_min + self.opt.peak.bpm_max)
                };
                bpm_prior2 = bpm_prior2.max(1e-6);
                let rr_prior2 = (60_000.0 / bpm_prior2).clamp(400.0, 1200.0);
                let base_ref2 =
                    ((0.4 * rr_prior2).clamp(280.0, 450.0) * 0.001 * eff_fs).round() as usize;
                let mut refractory_now = base_ref2.max(1) + self.dyn_ref_extra_samples;
                if self.doubling_active && tnow <= self.hard_fallback_until {
                    let fallback_ref =
                        (((0.5 * rr_prior2).min(450.0)) * 0.001 * eff_fs).round() as usize;
                    refractory_now = refractory_now.max(fallback_ref);
                }
                if tnow < self.choke_relax_until {
                    refractory_now = ((refractory_now as f64) * 0.7).round().max(1.0) as usize;
                }
                if abs_idx - last_abs >= refractory_now as u64 {
                    self.peaks_abs.push(abs_idx);
                    self.accepted_peaks_total += 1;
                } else {
                    // strongest-within-refractory replacement
                    let last_cmp = self.amp_cmp_of(last_abs, y1, vmin, den);
                    if y1_cmp > last_cmp {
                        if let Some(last) = self.peaks_abs.last_mut() {
                            *last = abs_idx;
                        }
                    }
                }
            }
        }
        self.rebuild_peaks_rr();
    }

    /// Amplitude of the stored peak at `peak_abs` in the comparison domain.
    fn amp_cmp_of(&self, peak_abs: u64, fallback: f32, vmin: f64, den: f64) -> f64 {
        let val = if peak_abs >= self.first_abs {
            let rel = (peak_abs - self.first_abs) as usize;
            if rel < self.window_len() {
                self.filt_at(rel)
            } else {
                fallback
            }
        } else {
            fallback
        };
        if self.hp_threshold {
            (val.max(0.0) as f64 - vmin) / den * 1024.0
        } else {
            val as f64
        }
    }

    fn rebuild_peaks_rr(&mut self) {
        let eff_fs = self.eff_fs();
        self.last_peaks.clear();
        self.last_rr.clear();
        for j in 0..self.peaks_abs.len() {
            let rel = (self.peaks_abs[j] - self.first_abs) as usize;
            self.last_peaks.push(rel);
            if j > 0 {
                let dt = (self.peaks_abs[j] - self.peaks_abs[j - 1]) as f64 / eff_fs;
                self.last_rr.push(dt * 1000.0);
            }
        }
    }

    fn trim_to_window(&mut self) {
        let eff_fs = self.eff_fs();
        let (max_samples, saturated) =
            safe_size_mul(self.window_sec.min(MAX_WINDOW_SEC), eff_fs, usize::MAX / 8);
        if saturated {
            self.oom_prevented_total += 1;
        }
        if self.use_ring {
            let cur = self.ring_filt.len();
            self.first_abs = self.total_abs.saturating_sub(cur as u64);
            self.first_ts_approx = self.last_ts - cur as f64 / eff_fs;
            while self.peaks_abs.first().is_some_and(|&p| p < self.first_abs) {
                self.peaks_abs.remove(0);
            }
            self.rebuild_peaks_rr();
        } else if self.filt.len() > max_samples {
            let drop = self.filt.len() - max_samples;
            self.signal.drain(..drop.min(self.signal.len()));
            self.filt.drain(..drop);
            if !self.timestamps.is_empty() {
                let d = drop.min(self.timestamps.len());
                self.timestamps.drain(..d);
            }
            self.dropped_samples_last += drop as u64;
            self.dropped_samples_total += drop as u64;
            self.drop_consec_polls += 1;
            self.first_ts_approx = self.last_ts - self.filt.len() as f64 / eff_fs;
            self.first_abs += drop as u64;
            while self.peaks_abs.first().is_some_and(|&p| p < self.first_abs) {
                self.peaks_abs.remove(0);
            }
            self.rebuild_peaks_rr();
        } else {
            self.drop_consec_polls = 0;
        }
        // display buffer mirrors the same time span
        let (max_disp, _) = safe_size_mul(
            self.window_sec.min(MAX_WINDOW_SEC),
            self.display_hz.max(10.0),
            usize::MAX / 8,
        );
        if self.display_buf.len() > max_disp {
            let drop = self.display_buf.len() - max_disp;
            self.display_buf.drain(..drop);
        }
    }

    fn rebuild_display(&mut self) {
        let eff_fs = self.eff_fs();
        let stride = ((eff_fs / self.display_hz.max(10.0)).round() as usize).max(1);
        self.display_buf.clear();
        let len = self.window_len();
        self.display_buf.reserve(len / stride + 1);
        let mut idx = 0usize;
        while idx < len {
            self.display_buf.push(self.filt_at(idx));
            idx += stride;
        }
    }

    fn fill_audit(&self, q: &mut QualityInfo) {
        q.dropped_samples_total = self.dropped_samples_total;
        q.dropped_samples_last = self.dropped_samples_last;
        q.clamped_batches_total = self.clamped_batches_total;
        q.clamped_batches_last = self.clamped_batches_last;
        q.oom_prevented_total = self.oom_prevented_total;
        q.param_change_events_total = self.param_change_events_total;
        q.timestamp_backtrack_events_total = self.ts_backtrack_events_total;
        q.timestamps_skipped_total = self.ts_skipped_total;
        q.time_jump_events_total = self.time_jump_events_total;
        q.zero_copy_used = self.zero_copy_used;
        q.fallback_copy_used = self.fallback_copy_used;
        q.dropping_active = i32::from(self.drop_consec_polls > 1);
        q.refractory_ms_active = self.last_ref_ms_active;
        q.min_rr_bound_ms = self.last_min_rr_bound_ms;
        q.ma_perc_active = if self.hp_threshold { self.ma_perc } else { 0.0 };
    }

    /// Re-derive the filter cascade and threshold mode after a preset edit.
    /// New sections start with cleared state; the stored window keeps its
    /// already-filtered samples.
    fn apply_threshold_and_band_change(&mut self) {
        self.hp_threshold = self.opt.hp_threshold.enabled;
        self.ma_perc = self.opt.hp_threshold.ma_perc.clamp(10.0, 60.0);
        self.chain = if self.opt.bandpass.low_hz > 0.0 || self.opt.bandpass.high_hz > 0.0 {
            design_bandpass_stream(
                self.fs,
                self.opt.bandpass.low_hz,
                self.opt.bandpass.high_hz,
                self.opt.bandpass.order.max(1),
            )
        } else {
            Vec::new()
        };
        self.param_change_events_total += 1;
    }

    fn snapshot(&mut self) -> PollSnapshot {
        let mut window = Vec::with_capacity(self.window_len());
        if self.use_ring {
            for i in 0..self.ring_filt.len() {
                window.push(self.ring_filt.at(i) as f64);
            }
        } else {
            window.extend(self.filt.iter().map(|&v| v as f64));
        }
        PollSnapshot {
            window,
            timestamps: self.timestamps.clone(),
            fs_eff: self.eff_fs(),
            last_ts: self.last_ts,
            first_ts_approx: self.first_ts_approx,
            warmup_start_ts: self.warmup_start_ts,
            window_sec: self.window_sec,
            psd_update_sec: self.psd_update_sec,
            accepted_peaks_total: self.accepted_peaks_total,
            last_rr: self.last_rr.clone(),
            last_peaks_len: self.last_peaks.len(),
            bpm_ema: self.bpm_ema,
            bpm_ema_valid: self.bpm_ema_valid,
            ma_perc_active: if self.hp_threshold { self.ma_perc } else { 0.0 },
            bpm_high_persist: self.bpm_high_active
                && (self.last_ts - self.bpm_high_start_ts.max(0.0)) >= 8.0,
            chain: self.chain.clone(),
            opt: self.opt.clone(),
            last_quality: self.last_quality.clone(),
        }
    }
}

/// Streaming PPG analyzer handle. All methods are `&self`; the two internal
/// locks implement the snapshot/commit protocol described at module level.
pub struct RealtimeAnalyzer {
    data: Mutex<StreamState>,
    engine: Mutex<PollEngine>,
}

impl RealtimeAnalyzer {
    /// Validates `(fs, options)` and builds the analyzer; nothing is
    /// allocated on validation failure.
    pub fn new(fs: f64, opt: Options) -> Result<Self, ConfigError> {
        validate_options(fs, &opt)?;
        Ok(Self {
            data: Mutex::new(StreamState::new(fs, opt)),
            engine: Mutex::new(PollEngine::default()),
        })
    }

    /// Clamp the analysis window to `[1, 300]` seconds. A substantive change
    /// restarts the warm-up clock.
    pub fn set_window_seconds(&self, sec: f64) {
        let mut d = self.data.lock();
        let clamped = sec.clamp(1.0, MAX_WINDOW_SEC);
        if (clamped - d.window_sec).abs() > f64::EPSILON {
            d.window_sec = clamped;
            d.warmup_start_ts = if d.window_len() > 0 { d.last_ts } else { f64::NAN };
            d.param_change_events_total += 1;
            if d.use_ring {
                let fs = d.eff_fs();
                let (cap, saturated) = safe_size_mul(clamped.min(MAX_WINDOW_SEC), fs, usize::MAX / 8);
                if saturated {
                    d.oom_prevented_total += 1;
                }
                d.ring_signal.reconfigure(cap.max(1));
                d.ring_filt.reconfigure(cap.max(1));
            }
        }
        d.trim_to_window();
    }

    pub fn set_update_interval_seconds(&self, sec: f64) {
        let mut d = self.data.lock();
        d.update_sec = sec.max(0.1);
        d.param_change_events_total += 1;
    }

    pub fn set_psd_update_seconds(&self, sec: f64) {
        let mut d = self.data.lock();
        d.psd_update_sec = sec.clamp(0.5, 5.0);
        d.param_change_events_total += 1;
    }

    pub fn set_display_hz(&self, hz: f64) {
        let mut d = self.data.lock();
        d.display_hz = hz.clamp(10.0, 120.0);
        d.param_change_events_total += 1;
    }

    /// Torch preset: tight band, HP-style threshold, longer refractory.
    pub fn apply_preset_torch(&self) {
        let mut d = self.data.lock();
        d.opt.bandpass.low_hz = 0.7;
        d.opt.bandpass.high_hz = 3.0;
        d.opt.peak.refractory_ms = d.opt.peak.refractory_ms.max(300.0);
        d.opt.hp_threshold.enabled = true;
        d.apply_threshold_and_band_change();
    }

    /// Ambient preset: wider band, stronger threshold scale.
    pub fn apply_preset_ambient(&self) {
        let mut d = self.data.lock();
        d.opt.bandpass.low_hz = 0.5;
        d.opt.bandpass.high_hz = 3.5;
        d.opt.peak.threshold_scale = d.opt.peak.threshold_scale.max(0.5);
        d.opt.peak.refractory_ms = d.opt.peak.refractory_ms.max(320.0);
        d.opt.hp_threshold.enabled = true;
        d.apply_threshold_and_band_change();
    }

    /// Borrowed-slice ingestion; the analyzer reads the caller's buffer
    /// directly.
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mut d = self.data.lock();
        d.zero_copy_used += 1;
        d.ingest(samples, None);
    }

    /// Converting ingestion for f64 sources; counts a fallback copy.
    pub fn push_f64(&self, samples: &[f64]) {
        if samples.is_empty() {
            return;
        }
        let tmp: Vec<f32> = samples.iter().map(|&v| v as f32).collect();
        let mut d = self.data.lock();
        d.fallback_copy_used += 1;
        d.ingest(&tmp, None);
    }

    /// Timestamped ingestion (seconds, monotone non-decreasing; backtracking
    /// samples are dropped and counted).
    pub fn push_with_timestamps(&self, samples: &[f32], timestamps: &[f64]) {
        if samples.is_empty() || timestamps.is_empty() {
            return;
        }
        let n = samples.len().min(timestamps.len());
        let mut d = self.data.lock();
        d.zero_copy_used += 1;
        d.ingest(&samples[..n], Some(&timestamps[..n]));
    }

    /// Emit a metrics record when the update interval has elapsed; `None`
    /// when not ready.
    pub fn poll(&self) -> Option<HeartMetrics> {
        // snapshot under the data lock
        let snap = {
            let mut d = self.data.lock();
            if (d.last_ts - d.last_emit_time) < d.update_sec {
                return None;
            }
            if d.window_len() == 0 {
                return None;
            }
            d.last_emit_time = d.last_ts;
            d.snapshot()
        };

        // heavy path under the engine lock; ingestion stays unblocked
        let mut engine = self.engine.lock();
        let (mut metrics, commit) = engine.run_poll(&snap);
        drop(engine);

        // commit under the data lock
        {
            let mut d = self.data.lock();
            d.soft_doubling_active = commit.soft;
            d.doubling_active = commit.hard;
            d.doubling_hint_active = commit.hint;
            d.doubling_long_rr_ms = commit.long_rr_ms;
            d.hard_fallback_until = commit.hard_fallback_until;
            d.doubling_hold_until = commit.doubling_hold_until;
            d.choke_relax_until = commit.choke_relax_until;
            d.last_f0_hz = commit.last_f0_hz;
            if commit.bpm_raw > 0.0 && commit.bpm_raw.is_finite() {
                let dt = if d.last_bpm_update_ts > 0.0 {
                    (snap.last_ts - d.last_bpm_update_ts).max(1e-3)
                } else {
                    d.update_sec
                };
                let alpha = 1.0 - (-dt / 8.0).exp();
                if d.bpm_ema_valid {
                    d.bpm_ema = (1.0 - alpha) * d.bpm_ema + alpha * commit.bpm_raw;
                } else {
                    d.bpm_ema = commit.bpm_raw;
                    d.bpm_ema_valid = true;
                }
                d.last_bpm_update_ts = snap.last_ts;
                // high-BPM persistence for the RR-only hint path
                if d.bpm_ema > BPM_HIGH_THRESHOLD {
                    if !d.bpm_high_active {
                        d.bpm_high_active = true;
                        d.bpm_high_start_ts = snap.last_ts;
                    }
                } else {
                    d.bpm_high_active = false;
                }
            }
            d.fill_audit(&mut metrics.quality);
            metrics.quality.merge_budget_exhausted = commit.merge_budget_exhausted;
            metrics.quality.merge_budget_exhausted_total = commit.merge_budget_exhausted_total;
            d.last_quality = metrics.quality.clone();
        }
        debug!(
            bpm = metrics.bpm,
            snr_db = metrics.quality.snr_db,
            confidence = metrics.quality.confidence,
            soft = metrics.quality.soft_doubling_flag,
            "poll committed"
        );
        Some(metrics)
    }

    /// Last committed quality report.
    pub fn quality(&self) -> QualityInfo {
        self.data.lock().last_quality.clone()
    }

    /// Online-detector peaks, relative to the current window.
    pub fn latest_peaks(&self) -> Vec<usize> {
        self.data.lock().last_peaks.clone()
    }

    /// Online-detector RR intervals in ms.
    pub fn latest_rr(&self) -> Vec<f64> {
        self.data.lock().last_rr.clone()
    }

    /// Stride-decimated filtered window for display.
    pub fn display_buffer(&self) -> Vec<f32> {
        self.data.lock().display_buf.clone()
    }
}
