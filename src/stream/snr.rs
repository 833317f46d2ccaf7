//! Poll-side analysis engine: Welch SNR with EMA smoothing, the harmonic
//! doubling update, the RR pair-merge correction, and the confidence mapping.
//!
//! Everything here runs on a snapshot of the window, outside the ingestion
//! lock. The engine owns its scratch buffers and the PSD cache so repeated
//! polls stay allocation-light.

use tracing::debug;

use crate::analyze;
use crate::config::Options;
use crate::dsp::biquad::{cascade_power_gain, Biquad};
use crate::dsp::welch::welch_psd;
use crate::dsp::{fft, mean, median, std_pop};
use crate::physio::metrics;
use crate::stream::doubling::{HarmonicInputs, HarmonicState};
use crate::types::{HeartMetrics, QualityInfo};

const SNR_FALLBACK_DB: f64 = -5.0;
const NFFT_CANDIDATES: [usize; 10] = [1024, 512, 384, 256, 192, 128, 96, 64, 48, 32];
const MIN_NFFT: usize = 32;

/// Everything the poll path needs, copied out under the data lock.
pub(crate) struct PollSnapshot {
    pub window: Vec<f64>,
    pub timestamps: Vec<f64>,
    pub fs_eff: f64,
    pub last_ts: f64,
    pub first_ts_approx: f64,
    pub warmup_start_ts: f64,
    pub window_sec: f64,
    pub psd_update_sec: f64,
    pub accepted_peaks_total: u64,
    pub last_rr: Vec<f64>,
    pub last_peaks_len: usize,
    pub bpm_ema: f64,
    pub bpm_ema_valid: bool,
    pub ma_perc_active: f64,
    pub bpm_high_persist: bool,
    pub chain: Vec<Biquad>,
    pub opt: Options,
    pub last_quality: QualityInfo,
}

/// State written back under the data lock after the heavy path finishes.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommitUpdate {
    pub soft: bool,
    pub hard: bool,
    pub hint: bool,
    pub long_rr_ms: f64,
    pub hard_fallback_until: f64,
    pub doubling_hold_until: f64,
    pub choke_relax_until: f64,
    pub last_f0_hz: f64,
    pub bpm_raw: f64,
    pub merge_budget_exhausted: i32,
    pub merge_budget_exhausted_total: u64,
}

#[derive(Default)]
pub(crate) struct PollEngine {
    noise_scratch: Vec<f64>,

    // PSD cache
    last_psd_freq: Vec<f64>,
    last_psd_power: Vec<f64>,
    last_psd_valid: bool,
    last_psd_time: f64,

    // SNR EMA
    snr_ema_db: f64,
    snr_ema_valid: bool,
    last_snr_update: f64,
    last_snr_active_mode: bool,
    last_snr_base_bw: f64,

    last_f0_hz: f64,
    warmup_was_passed: bool,

    harmonic: HarmonicState,

    // counters
    psd_param_clamp_events: u64,
    psd_reuse_fallback_events: u64,
    psd_time_domain_fallback_events: u64,
    psd_invalid_frames: u64,
    merge_budget_exhausted_total: u64,
}

enum SnrSource {
    FreshPsd,
    CachedPsd,
    TimeDomain,
}

impl PollEngine {
    /// Analyze the snapshot and produce the metrics record plus the state to
    /// commit back into the ingestion path.
    pub(crate) fn run_poll(&mut self, snap: &PollSnapshot) -> (HeartMetrics, CommitUpdate) {
        sync_deterministic(&snap.opt);
        let mut m = analyze::analyze_signal(&snap.window, snap.fs_eff, &snap.opt)
            .unwrap_or_default();
        m.waveform_values = snap.window.clone();
        m.waveform_timestamps = snap.timestamps.clone();
        m.quality.ma_perc_active = snap.ma_perc_active;

        let commit = self.update_snr(snap, &mut m);

        // map (possibly merge-corrected) peak indices onto the snapshot
        m.peak_timestamps.clear();
        for &p in &m.peak_list {
            if p < snap.timestamps.len() {
                m.peak_timestamps.push(snap.timestamps[p]);
            }
        }
        (m, commit)
    }

    fn commit_from_state(&self, bpm_raw: f64, exhausted: bool) -> CommitUpdate {
        CommitUpdate {
            soft: self.harmonic.soft_active(),
            hard: self.harmonic.hard_active(),
            hint: self.harmonic.hint_active(),
            long_rr_ms: self.harmonic.long_rr_ms(),
            hard_fallback_until: self.harmonic.hard_fallback_until(),
            doubling_hold_until: self.harmonic.doubling_hold_until(),
            choke_relax_until: self.harmonic.choke_relax_until(),
            last_f0_hz: self.last_f0_hz,
            bpm_raw,
            merge_budget_exhausted: i32::from(exhausted),
            merge_budget_exhausted_total: self.merge_budget_exhausted_total,
        }
    }

    fn update_snr(&mut self, snap: &PollSnapshot, m: &mut HeartMetrics) -> CommitUpdate {
        let bpm_raw = m.bpm;
        let sample_count = snap.window.len();
        let now = snap.last_ts;

        // Poll cadence: between PSD updates, reuse the previous quality and
        // keep the reported rate consistent with the active remap.
        if (now - self.last_psd_time) < snap.psd_update_sec {
            m.quality = snap.last_quality.clone();
            m.quality.snr_sample_count = sample_count as f64;
            let mut exhausted = false;
            if self.harmonic.remap_active(now) && self.last_f0_hz > 1e-9 {
                exhausted = self.apply_rr_merge(m, 1000.0 / self.last_f0_hz, &snap.opt);
            }
            return self.commit_from_state(bpm_raw, exhausted);
        }
        self.last_psd_time = now;

        let eff_fs = snap.fs_eff;
        m.quality.snr_sample_count = sample_count as f64;
        if eff_fs <= 0.0 || sample_count < 16 {
            let fallback = if self.snr_ema_valid { self.snr_ema_db } else { SNR_FALLBACK_DB };
            m.quality.snr_db = if fallback.is_finite() { fallback } else { SNR_FALLBACK_DB };
            m.quality.hard_fallback_active = 1;
            m.quality.snr_warmup_active = 1;
            return self.commit_from_state(bpm_raw, false);
        }

        // HR fundamental: streaming-window RR first, then batch bpm, then the
        // previous estimate.
        let mut f0 = 0.0;
        if !m.rr_list.is_empty() {
            let mrr = mean(&m.rr_list);
            if mrr > 1e-3 {
                f0 = 1000.0 / mrr;
            }
        }
        if f0 <= 0.0 && m.bpm > 0.0 {
            f0 = m.bpm / 60.0;
        }
        if f0 <= 0.0 && self.last_f0_hz > 0.0 {
            f0 = self.last_f0_hz;
        }
        if f0 <= 0.0 {
            let fallback = if self.snr_ema_valid { self.snr_ema_db } else { SNR_FALLBACK_DB };
            m.quality.snr_db = if fallback.is_finite() { fallback } else { SNR_FALLBACK_DB };
            m.quality.f0_hz = 0.0;
            m.quality.hard_fallback_active = 1;
            return self.commit_from_state(bpm_raw, false);
        }
        self.last_f0_hz = f0;

        // Warm-up gate: time, sample count, and accepted-peak floors must all
        // clear before the PSD estimate is trusted.
        let warmup_sec = (snap.window_sec * 0.6).clamp(6.0, 18.0);
        let warmup_elapsed = if snap.warmup_start_ts.is_finite() {
            (now - snap.warmup_start_ts).max(0.0)
        } else {
            (now - snap.first_ts_approx).max(0.0)
        };
        let min_samples = (128f64.max((snap.window_sec * 0.6).max(4.0) * eff_fs)).ceil() as usize;
        let min_peaks = 6u64.max((snap.window_sec * 0.4).ceil() as u64);
        let warmup_active = warmup_elapsed < warmup_sec
            || sample_count < min_samples
            || snap.accepted_peaks_total < min_peaks;
        if warmup_active {
            let mut warm = if self.snr_ema_valid {
                self.snr_ema_db
            } else {
                time_domain_snr_db(&snap.window)
            };
            if !warm.is_finite() || warm <= 0.0 {
                warm = 8.0;
            }
            self.snr_ema_db = warm;
            self.snr_ema_valid = true;
            m.quality.snr_db = warm;
            m.quality.f0_hz = self.last_f0_hz;
            m.quality.snr_warmup_active = 1;
            m.quality.hard_fallback_active = 0;
            return self.commit_from_state(bpm_raw, false);
        }
        m.quality.snr_warmup_active = 0;

        // Welch configuration, adaptive when allowed.
        let mut source = SnrSource::FreshPsd;
        let mut fresh_psd = false;
        let base_overlap = snap.opt.welch.overlap.clamp(0.0, 0.90);
        let config = if snap.opt.welch.adaptive_psd {
            choose_welch_config(sample_count, base_overlap, coerce_nfft(snap.opt.welch.nfft))
        } else {
            let mut nfft = coerce_nfft(snap.opt.welch.nfft);
            if nfft > sample_count {
                let p2 = largest_power_of_two_le(sample_count);
                if p2 >= MIN_NFFT {
                    nfft = p2;
                } else {
                    nfft = 0;
                }
            }
            if nfft >= MIN_NFFT {
                Some((nfft, base_overlap, 0usize, false))
            } else {
                None
            }
        };

        match config {
            None => {
                self.psd_invalid_frames += 1;
                if snap.opt.welch.adaptive_psd {
                    debug!(samples = sample_count, "insufficient data for Welch PSD, time-domain SNR");
                    source = SnrSource::TimeDomain;
                    self.last_psd_valid = false;
                } else {
                    debug!("insufficient data for Welch PSD, adaptive disabled; skipping update");
                    return self.commit_from_state(bpm_raw, false);
                }
            }
            Some((nfft, overlap, _nseg, adjusted)) => {
                if adjusted {
                    self.psd_param_clamp_events += 1;
                }
                let psd = welch_psd(&snap.window, eff_fs, nfft, overlap);
                if psd.freqs.len() >= 4 && psd.freqs.len() == psd.psd.len() {
                    self.last_psd_freq = psd.freqs;
                    self.last_psd_power = psd.psd;
                    self.last_psd_valid = true;
                    fresh_psd = true;
                } else {
                    self.psd_invalid_frames += 1;
                    if !snap.opt.welch.adaptive_psd {
                        return self.commit_from_state(bpm_raw, false);
                    }
                    if self.last_psd_valid
                        && self.last_psd_freq.len() >= 4
                        && self.last_psd_freq.len() == self.last_psd_power.len()
                    {
                        source = SnrSource::CachedPsd;
                        self.psd_reuse_fallback_events += 1;
                    } else {
                        source = SnrSource::TimeDomain;
                        self.last_psd_valid = false;
                    }
                }
            }
        }

        let active_snr = self.harmonic.remap_active(now);
        let base_bw =
            if active_snr { snap.opt.snr.band_active_hz } else { snap.opt.snr.band_passive_hz };

        let mut band = 0.0;
        let mut df = 0.0;
        let mut noise_baseline = 0.0;
        let mut p_fund_raw = 0.0;
        let mut p_half_raw = 0.0;
        let mut snr_db_inst = SNR_FALLBACK_DB;

        match source {
            SnrSource::TimeDomain => {
                snr_db_inst = time_domain_snr_db(&snap.window);
                self.psd_time_domain_fallback_events += 1;
            }
            SnrSource::FreshPsd | SnrSource::CachedPsd => {
                let frq = &self.last_psd_freq;
                let p = &self.last_psd_power;
                df = if frq.len() > 1 { frq[1] - frq[0] } else { 0.0 };
                let nyq = 0.5 * eff_fs;
                band = (2.0 * df).max(base_bw);
                let guard = 0.03;
                let f0_half = 0.5 * f0;
                let mut peak_pow = 0.0;
                let mut peak_pow2 = 0.0;
                self.noise_scratch.clear();
                self.noise_scratch.reserve(frq.len());
                let harm_ok = 2.0 * f0 < nyq;
                for (i, &f) in frq.iter().enumerate() {
                    let pv = p[i].abs();
                    if (f - f0).abs() <= band {
                        peak_pow += pv;
                    }
                    if harm_ok && (f - 2.0 * f0).abs() <= band {
                        peak_pow2 += pv;
                    }
                    // Half band excludes anything inside the fundamental band;
                    // with wide bins the two overlap, and the fundamental's
                    // shoulder would otherwise masquerade as half-band power.
                    if f0_half > 0.0 && (f - f0_half).abs() <= band && (f - f0).abs() > band {
                        p_half_raw += pv;
                    }
                    let near_sig = (f - f0).abs() <= band + guard
                        || (harm_ok && (f - 2.0 * f0).abs() <= band + guard);
                    if !near_sig && (0.4..=5.0).contains(&f) {
                        self.noise_scratch.push(pv);
                    }
                }
                p_fund_raw = peak_pow;
                let signal_pow = peak_pow + peak_pow2;
                if !self.noise_scratch.is_empty() {
                    self.noise_scratch
                        .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let n = self.noise_scratch.len();
                    let start = n / 20;
                    let end = n - start;
                    if end > start {
                        let p75 = start + (end - start) * 3 / 4;
                        noise_baseline = self.noise_scratch[p75].max(1e-8);
                    }
                }
                if signal_pow > 1e-10 && noise_baseline > 1e-10 {
                    let noise_bandwidth = band * 2.0 / df.max(1e-6);
                    if noise_bandwidth > 1e-6 {
                        let ratio = signal_pow / (noise_baseline * noise_bandwidth);
                        if ratio > 1e-10 {
                            let candidate = 10.0 * ratio.log10();
                            if candidate.is_finite() {
                                snr_db_inst = candidate;
                            }
                        }
                    }
                }
            }
        }
        if !snr_db_inst.is_finite() {
            snr_db_inst = SNR_FALLBACK_DB;
        }

        // EMA over time; deterministic mode snaps the cadence.
        let mut dt = if self.last_snr_update > 0.0 { now - self.last_snr_update } else { snap.psd_update_sec };
        if snap.opt.streaming.deterministic {
            dt = snap.psd_update_sec;
        }
        let tau = if active_snr { snap.opt.snr.active_tau_sec } else { snap.opt.snr.tau_sec };
        let alpha = 1.0 - (-dt / tau.max(1e-3)).exp();
        if !self.snr_ema_valid {
            self.snr_ema_db = snr_db_inst;
            self.snr_ema_valid = true;
        } else {
            self.snr_ema_db = (1.0 - alpha) * self.snr_ema_db + alpha * snr_db_inst;
        }
        let band_changed =
            (base_bw - self.last_snr_base_bw).abs() > 1e-9 || active_snr != self.last_snr_active_mode;
        if band_changed && !snap.opt.streaming.deterministic {
            let bf = snap.opt.snr.band_blend_factor.clamp(0.0, 1.0);
            self.snr_ema_db = (1.0 - bf) * self.snr_ema_db + bf * snr_db_inst;
        }
        self.last_snr_base_bw = base_bw;
        self.last_snr_active_mode = active_snr;
        self.last_snr_update = now;
        if !self.snr_ema_db.is_finite() {
            self.snr_ema_db = SNR_FALLBACK_DB;
        }
        m.quality.snr_db = self.snr_ema_db;
        m.quality.f0_hz = self.last_f0_hz;

        // RR clustering for the harmonic analysis.
        let mut ratio_half_fund = 0.0;
        let mut short_frac = 0.0;
        let mut long_rr = 0.0;
        let mut rr_cv = 0.0;
        let mut pair_frac = 0.0;
        let mut rr_median = 0.0;
        let accepted_rr = snap.accepted_peaks_total.saturating_sub(1);
        // Measured from the stream origin, not the trimmed window start, so
        // short windows can still arm the detector.
        let warmup_passed = warmup_elapsed >= 15.0 && accepted_rr >= 10;
        let mut half_stable = false;

        if fresh_psd {
            // Compensate the streaming cascade's tilt so the half/fundamental
            // ratio reflects the raw signal, not the filter shape.
            let f0_half = 0.5 * f0;
            let gain_fund = cascade_power_gain(&snap.chain, f0, eff_fs).max(1e-6);
            let gain_half = cascade_power_gain(&snap.chain, f0_half, eff_fs).max(1e-6);
            let p_fund_comp = p_fund_raw / gain_fund;
            let p_half_comp = p_half_raw / gain_half;
            ratio_half_fund = if p_fund_comp > 0.0 { p_half_comp / p_fund_comp } else { 0.0 };

            if !m.rr_list.is_empty() {
                let rr = &m.rr_list;
                rr_median = median(rr);
                let thr = 0.8 * rr_median;
                let mut sum_long = 0.0;
                let mut cnt_long = 0usize;
                let mut cnt_short = 0usize;
                for &r in rr.iter() {
                    if r >= thr {
                        sum_long += r;
                        cnt_long += 1;
                    } else {
                        cnt_short += 1;
                    }
                }
                long_rr = if cnt_long > 0 { sum_long / cnt_long as f64 } else { rr_median };
                short_frac = cnt_short as f64 / rr.len() as f64;
                let m_rr = mean(rr);
                rr_cv = if m_rr > 1e-9 { std_pop(rr) / m_rr } else { 0.0 };
                let mut cnt_pairs = 0usize;
                let mut good_pairs = 0usize;
                for w in rr.windows(2) {
                    let s = w[0] + w[1];
                    if long_rr > 0.0 {
                        cnt_pairs += 1;
                        if s >= 0.85 * long_rr && s <= 1.15 * long_rr {
                            good_pairs += 1;
                        }
                    }
                }
                pair_frac =
                    if cnt_pairs > 0 { good_pairs as f64 / cnt_pairs as f64 } else { 0.0 };
            }

            if warmup_passed && !self.warmup_was_passed {
                self.harmonic.on_warmup_edge();
            }
            self.warmup_was_passed = warmup_passed;

            let bpm_est = if rr_median > 1e-6 { 60_000.0 / rr_median } else { 0.0 };
            let inputs = HarmonicInputs {
                now,
                warmup_passed,
                ratio_half_fund,
                half_f0_hz: f0_half,
                rejection_rate: m.quality.rejection_rate,
                rr_cv,
                bpm_ema: snap.bpm_ema,
                bpm_ema_valid: snap.bpm_ema_valid,
                ma_perc_active: snap.ma_perc_active,
                long_rr_ms: long_rr,
                rr_median_ms: rr_median,
                bpm_est,
                bpm_high_persist: snap.bpm_high_persist,
                soft_threshold: snap.opt.doubling.p_half_over_fund_threshold_soft,
                low_threshold: snap.opt.doubling.p_half_over_fund_threshold_low,
                hist_len: snap.opt.doubling.half_f0_hist_len,
                tol_warm: snap.opt.doubling.half_f0_tol_hz_warm,
                tol_cold: snap.opt.doubling.half_f0_tol_hz_cold,
                choke_bpm_threshold: snap.opt.doubling.choke_bpm_threshold,
                choke_relax_base_sec: snap.opt.doubling.choke_relax_base_sec,
                choke_relax_low_bpm_sec: snap.opt.doubling.choke_relax_low_bpm_sec,
            };
            half_stable = self.harmonic.update(&inputs);
        } else {
            debug!("harmonic update skipped: no fresh PSD this frame");
            self.warmup_was_passed = warmup_passed;
            self.harmonic.violation_tick(now);
        }

        // Frequency remap: while any doubling state (or its 5 s persistence)
        // holds, or the half band clearly dominates, fold both bands into the
        // signal estimate and report half the fundamental.
        let half_dominant = ratio_half_fund
            >= snap.opt.doubling.p_half_over_fund_threshold_soft
            && half_stable;
        let use_half = self.harmonic.remap_active(now) || half_dominant;
        let mut f0_used = f0;
        if use_half && f0 > 0.0 {
            let signal_pow_used = p_half_raw + p_fund_raw;
            let mut inst2 = SNR_FALLBACK_DB;
            if signal_pow_used > 0.0 && noise_baseline > 0.0 {
                let bw2 = band * 2.0 / df.max(1e-6);
                if bw2 > 1e-6 {
                    let r2 = signal_pow_used / (noise_baseline * bw2);
                    if r2 > 1e-10 {
                        let candidate = 10.0 * r2.log10();
                        if candidate.is_finite() {
                            inst2 = candidate;
                        }
                    }
                }
            }
            if self.snr_ema_valid {
                self.snr_ema_db = (1.0 - alpha) * self.snr_ema_db + alpha * inst2;
            } else {
                self.snr_ema_db = inst2;
                self.snr_ema_valid = true;
            }
            f0_used = 0.5 * f0;
        }
        self.last_f0_hz = f0_used;
        m.quality.f0_hz = f0_used;
        m.quality.snr_db = self.snr_ema_db;
        m.quality.soft_doubling_flag = i32::from(self.harmonic.soft_active());
        m.quality.doubling_flag = i32::from(self.harmonic.hard_active());
        m.quality.hard_fallback_active = i32::from(self.harmonic.hard_fallback_engaged(now));
        m.quality.doubling_hint_flag = i32::from(self.harmonic.hint_active());
        m.quality.rr_fallback_mode_active = i32::from(self.harmonic.rr_fallback_mode_active());
        m.quality.p_half_over_fund = ratio_half_fund;
        m.quality.pair_frac = pair_frac;
        m.quality.rr_short_frac = short_frac;
        m.quality.rr_long_ms = long_rr;
        m.quality.soft_streak = self.harmonic.soft_streak();
        m.quality.soft_secs = self.harmonic.soft_secs(now);

        // The pair-merge correction is what actually halves the reported BPM.
        let mut exhausted = false;
        if use_half && f0_used > 1e-9 {
            exhausted = self.apply_rr_merge(m, 1000.0 / f0_used, &snap.opt);
        }

        // Confidence: logistic on the smoothed SNR, scaled by rejection, RR
        // CV, an active-stability boost, and warm-up progress.
        let active_conf = self.harmonic.remap_active(now);
        let x0 = if active_conf { 5.2 } else { 6.0 };
        let k = if active_conf { 1.0 / 1.2 } else { 0.8 };
        let snr_for_conf =
            if self.snr_ema_db.is_finite() { self.snr_ema_db } else { SNR_FALLBACK_DB };
        let mut conf_snr = 1.0 / (1.0 + (-k * (snr_for_conf - x0)).exp());
        if !conf_snr.is_finite() {
            conf_snr = 0.0;
        }
        let mut conf = conf_snr * (1.0 - m.quality.rejection_rate);
        let mut cv = 0.0;
        if !m.rr_list.is_empty() {
            let m_rr = mean(&m.rr_list);
            cv = if m_rr > 1e-9 { std_pop(&m.rr_list) / m_rr } else { 0.0 };
            let k_cv = if active_conf { 0.5 } else { 1.0 };
            conf *= (1.0 - k_cv * cv).max(0.0);
        }
        if active_conf {
            let active_secs = self.harmonic.soft_secs(now).max(self.harmonic.hint_secs(now));
            if m.quality.rejection_rate < 0.03 && cv < 0.12 && active_secs >= 8.0 {
                conf = (conf * 1.1).min(1.0);
            }
        }
        let warm_sec_target = (snap.window_sec * 2.0).clamp(4.0, 10.0);
        let warm_beats_target = 4f64.max((snap.window_sec * 1.5).ceil());
        let elapsed = warmup_elapsed;
        let time_progress =
            if warm_sec_target > 0.0 { elapsed / warm_sec_target } else { 1.0 };
        let beats_in_window = if !m.peak_list.is_empty() {
            m.peak_list.len()
        } else if snap.last_peaks_len > 0 {
            snap.last_peaks_len
        } else {
            m.rr_list.len() + usize::from(!m.rr_list.is_empty())
        };
        let beat_progress = beats_in_window as f64 / warm_beats_target;
        let warm_progress = time_progress.max(beat_progress).clamp(0.0, 1.0);
        conf *= warm_progress;
        if !conf.is_finite() {
            conf = 0.0;
        }
        m.quality.confidence = conf.clamp(0.0, 1.0);

        self.commit_from_state(bpm_raw, exhausted)
    }

    /// Merge adjacent RR pairs summing to the remapped period; recompute the
    /// time-domain metrics from the merged list. Returns whether the merge
    /// budget was exhausted this poll.
    fn apply_rr_merge(&mut self, m: &mut HeartMetrics, target_ms: f64, opt: &Options) -> bool {
        if m.rr_list.len() < 2 || !(100.0..=3000.0).contains(&target_ms) {
            return false;
        }
        let lo = opt.merge.equal_band_low * target_ms;
        let hi = opt.merge.equal_band_high * target_ms;
        let rr = m.rr_list.clone();
        let peaks_aligned = m.peak_list.len() == rr.len() + 1;
        let mut merged = Vec::with_capacity(rr.len());
        let mut kept_peaks: Vec<usize> = if peaks_aligned { vec![m.peak_list[0]] } else { Vec::new() };
        let mut merges = 0usize;
        let mut exhausted = false;
        let mut i = 0usize;
        while i < rr.len() {
            let pair_ok = i + 1 < rr.len() && {
                let s = rr[i] + rr[i + 1];
                (lo..=hi).contains(&s)
            };
            if pair_ok && merges < opt.merge.budget {
                merged.push(rr[i] + rr[i + 1]);
                if peaks_aligned {
                    kept_peaks.push(m.peak_list[i + 2]);
                }
                merges += 1;
                i += 2;
            } else {
                if pair_ok {
                    exhausted = true;
                }
                merged.push(rr[i]);
                if peaks_aligned {
                    kept_peaks.push(m.peak_list[i + 1]);
                }
                i += 1;
            }
        }
        if merges == 0 {
            return false;
        }
        if exhausted {
            self.merge_budget_exhausted_total += 1;
        }
        debug!(merges, target_ms, "pair-merge corrected doubled RR stream");
        m.rr_list = merged;
        if peaks_aligned {
            m.peak_list = kept_peaks;
        }
        let rr_clean = m.rr_list.clone();
        metrics::time_domain(m, &rr_clean, &[], &[], opt);
        metrics::poincare(m, &rr_clean, &[], opt);
        exhausted
    }
}

/// Nearest ladder entry to the requested nfft.
fn coerce_nfft(n: usize) -> usize {
    if n == 0 {
        return 256;
    }
    let mut best = NFFT_CANDIDATES[NFFT_CANDIDATES.len() - 1];
    let mut best_d = usize::MAX;
    for &cand in NFFT_CANDIDATES.iter() {
        let d = n.abs_diff(cand);
        if d < best_d {
            best_d = d;
            best = cand;
        }
    }
    best
}

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

/// Shrink nfft / raise overlap until at least two segments fit.
/// Returns `(nfft, overlap, nseg, adjusted)`.
fn choose_welch_config(
    sample_count: usize,
    base_overlap: f64,
    desired_nfft: usize,
) -> Option<(usize, f64, usize, bool)> {
    if sample_count < MIN_NFFT {
        return None;
    }
    let desired = desired_nfft.min(largest_power_of_two_le(sample_count)).max(MIN_NFFT);
    let mut working_nfft = desired;
    let mut working_overlap = base_overlap;
    let mut adjusted = false;

    while working_nfft >= MIN_NFFT {
        if working_nfft > sample_count {
            let next = largest_power_of_two_le(sample_count);
            if next < MIN_NFFT {
                break;
            }
            working_nfft = next;
            adjusted = true;
            continue;
        }
        if working_nfft >= sample_count {
            if working_nfft == MIN_NFFT {
                break;
            }
            let next = largest_power_of_two_le(working_nfft - 1);
            if next < MIN_NFFT {
                break;
            }
            working_nfft = next;
            adjusted = true;
            continue;
        }

        let mut min_overlap_for_two =
            1.0 - (sample_count - working_nfft) as f64 / working_nfft as f64;
        min_overlap_for_two = min_overlap_for_two.clamp(0.0, 0.93);
        let overlap_candidate =
            working_overlap.max(min_overlap_for_two + 0.02).clamp(base_overlap, 0.93);

        let step_float = (working_nfft as f64 * (1.0 - overlap_candidate)).max(1.0);
        let step = (step_float.round() as usize).max(1);
        let nseg = 1 + (sample_count - working_nfft) / step;
        if nseg >= 2 {
            if (overlap_candidate - base_overlap).abs() > 1e-6 || working_nfft != desired {
                adjusted = true;
            }
            return Some((working_nfft, overlap_candidate, nseg, adjusted));
        }

        if overlap_candidate < 0.93 - 1e-6 {
            working_overlap = (overlap_candidate + 0.05).min(0.93);
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
        working_nfft = next;
        adjusted = true;
    }
    None
}

fn time_domain_snr_db(samples: &[f64]) -> f64 {
    if samples.len() < 16 {
        return SNR_FALLBACK_DB;
    }
    let m = mean(samples);
    let n = samples.len();
    let signal_var =
        samples.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n - 1).max(1) as f64;
    if signal_var <= 1e-10 {
        return SNR_FALLBACK_DB;
    }
    let diff_var = samples.windows(2).map(|w| (w[1] - w[0]) * (w[1] - w[0])).sum::<f64>()
        / (n - 1).max(1) as f64;
    let noise_var = (diff_var * 0.5).max(1e-10);
    let snr = 10.0 * (signal_var / noise_var).max(1e-10).log10();
    if snr.is_finite() {
        snr
    } else {
        SNR_FALLBACK_DB
    }
}

/// Per-poll hook for the global deterministic toggle; mirrors the host-side
/// contract of the runtime flag.
pub(crate) fn sync_deterministic(opt: &Options) {
    fft::set_deterministic(opt.streaming.deterministic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_picks_nearest_ladder_entry() {
        assert_eq!(coerce_nfft(0), 256);
        assert_eq!(coerce_nfft(250), 256);
        assert_eq!(coerce_nfft(300), 256);
        assert_eq!(coerce_nfft(360), 384);
        assert_eq!(coerce_nfft(40), 48);
        assert_eq!(coerce_nfft(8000), 1024);
    }

    #[test]
    fn welch_config_shrinks_for_short_windows() {
        // 300 samples cannot carry nfft 512
        let (nfft, _, nseg, adjusted) = choose_welch_config(300, 0.5, 512).unwrap();
        assert!(nfft <= 256);
        assert!(nseg >= 2);
        assert!(adjusted);
    }

    #[test]
    fn welch_config_none_when_hopeless() {
        assert!(choose_welch_config(16, 0.5, 256).is_none());
    }

    #[test]
    fn time_domain_snr_prefers_smooth_signals() {
        let fs = 50.0;
        let smooth: Vec<f64> = (0..500)
            .map(|i| (2.0 * std::f64::consts::PI * i as f64 / fs).sin())
            .collect();
        let noisy: Vec<f64> = smooth
            .iter()
            .enumerate()
            .map(|(i, v)| v + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        assert!(time_domain_snr_db(&smooth) > time_domain_snr_db(&noisy));
        assert_eq!(time_domain_snr_db(&[0.0; 4]), SNR_FALLBACK_DB);
    }

    #[test]
    fn merge_halves_a_doubled_rr_stream() {
        let mut engine = PollEngine::default();
        let mut m = HeartMetrics {
            rr_list: vec![480.0, 520.0, 470.0, 530.0, 490.0, 510.0],
            peak_list: vec![0, 48, 100, 147, 200, 249, 300],
            ..Default::default()
        };
        let opt = Options::default();
        let exhausted = engine.apply_rr_merge(&mut m, 1000.0, &opt);
        assert!(!exhausted);
        assert_eq!(m.rr_list, vec![1000.0, 1000.0, 1000.0]);
        assert_eq!(m.peak_list, vec![0, 100, 200, 300]);
        assert!((m.bpm - 60.0).abs() < 1e-9);
    }

    #[test]
    fn merge_respects_budget() {
        let mut engine = PollEngine::default();
        let rr: Vec<f64> = (0..10).map(|i| if i % 2 == 0 { 480.0 } else { 520.0 }).collect();
        let mut m = HeartMetrics { rr_list: rr, ..Default::default() };
        let mut opt = Options::default();
        opt.merge.budget = 2;
        let exhausted = engine.apply_rr_merge(&mut m, 1000.0, &opt);
        assert!(exhausted);
        // two merges happened, the rest passed through
        assert_eq!(m.rr_list.len(), 8);
        assert_eq!(engine.merge_budget_exhausted_total, 1);
    }

    #[test]
    fn merge_leaves_regular_stream_alone() {
        let mut engine = PollEngine::default();
        let mut m = HeartMetrics { rr_list: vec![1000.0, 990.0, 1010.0], ..Default::default() };
        let opt = Options::default();
        assert!(!engine.apply_rr_merge(&mut m, 1000.0, &opt));
        assert_eq!(m.rr_list.len(), 3);
    }
}
