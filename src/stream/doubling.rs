//! Harmonic doubling detector.
//!
//! Three coupled flags watch for the half-rate trap, where a strong component
//! at half the detected fundamental means the detector has latched onto a
//! harmonic:
//!
//! - **soft** arms immediately post warm-up when the half band clearly
//!   dominates and the RR stream is clean;
//! - **hard** requires soft to persist, PSD dominance at `ratio >= 2`, and a
//!   sustained high BPM prior, and carries a short elevated-refractory window;
//! - **hint** is the conservative unlock path, reachable through the PSD, a
//!   sustained loose-PSD ratio, or an RR-only signature around 150 BPM.
//!
//! Soft/hard clear only after violations persist for five seconds; this
//! hysteresis is deliberate and keeps the remap from flapping. Choke
//! protection arms a gating relaxation when an active doubling state drives
//! the live BPM estimate under the configured floor.

use std::collections::VecDeque;

use tracing::debug;

/// Per-frame inputs; everything the transitions read, precomputed by the
/// SNR engine.
#[derive(Debug, Clone, Default)]
pub struct HarmonicInputs {
    pub now: f64,
    pub warmup_passed: bool,
    /// Compensated P(f0/2) / P(f0).
    pub ratio_half_fund: f64,
    /// f0/2 in Hz; 0 when no valid fundamental this frame.
    pub half_f0_hz: f64,
    pub rejection_rate: f64,
    pub rr_cv: f64,
    pub bpm_ema: f64,
    pub bpm_ema_valid: bool,
    pub ma_perc_active: f64,
    /// Long-cluster RR estimate (ms).
    pub long_rr_ms: f64,
    pub rr_median_ms: f64,
    /// Live BPM estimate from the RR median, for choke protection.
    pub bpm_est: f64,
    /// High-BPM prior sustained for at least 8 s.
    pub bpm_high_persist: bool,

    // thresholds (from DoublingConfig)
    pub soft_threshold: f64,
    pub low_threshold: f64,
    pub hist_len: usize,
    pub tol_warm: f64,
    pub tol_cold: f64,
    pub choke_bpm_threshold: f64,
    pub choke_relax_base_sec: f64,
    pub choke_relax_low_bpm_sec: f64,
}

#[derive(Debug, Clone, Default)]
pub struct HarmonicState {
    soft_active: bool,
    soft_consec: i32,
    soft_start_ts: f64,
    soft_last_true_ts: f64,
    half_f0_hist: VecDeque<f64>,

    doubling_active: bool,
    doubling_last_true_ts: f64,
    doubling_hold_until: f64,
    doubling_long_rr_ms: f64,
    hard_fallback_until: f64,

    last_clear_bad_start: f64,

    hint_active: bool,
    hint_last_true_ts: f64,
    hint_start_ts: f64,
    hint_hold_until: f64,
    last_hint_bad_start: f64,
    psd_lo_start: f64,

    choke_relax_until: f64,
    choke_start_ts: f64,

    rr_fallback_consec: i32,
    rr_fallback_driving_hint: bool,
    rr_fallback_mode_active: bool,
}

impl HarmonicState {
    pub fn soft_active(&self) -> bool {
        self.soft_active
    }
    pub fn hard_active(&self) -> bool {
        self.doubling_active
    }
    pub fn hint_active(&self) -> bool {
        self.hint_active
    }
    pub fn rr_fallback_mode_active(&self) -> bool {
        self.rr_fallback_mode_active
    }
    pub fn long_rr_ms(&self) -> f64 {
        self.doubling_long_rr_ms
    }
    pub fn hard_fallback_until(&self) -> f64 {
        self.hard_fallback_until
    }
    pub fn doubling_hold_until(&self) -> f64 {
        self.doubling_hold_until
    }
    pub fn choke_relax_until(&self) -> f64 {
        self.choke_relax_until
    }
    pub fn soft_streak(&self) -> i32 {
        self.soft_consec
    }
    pub fn soft_secs(&self, now: f64) -> f64 {
        if self.soft_active {
            now - self.soft_start_ts
        } else {
            0.0
        }
    }
    pub fn hint_secs(&self, now: f64) -> f64 {
        if self.hint_active && self.hint_start_ts > 0.0 {
            now - self.hint_start_ts
        } else {
            0.0
        }
    }

    /// Hard fallback refractory applies only inside its bounded window.
    pub fn hard_fallback_engaged(&self, now: f64) -> bool {
        self.doubling_active && now <= self.hard_fallback_until
    }

    /// Timestamp of the most recent frame on which any flag was true.
    fn last_active_ts(&self) -> f64 {
        let mut t: f64 = 0.0;
        if self.soft_last_true_ts > 0.0 {
            t = t.max(self.soft_last_true_ts);
        }
        if self.doubling_last_true_ts > 0.0 {
            t = t.max(self.doubling_last_true_ts);
        }
        if self.hint_last_true_ts > 0.0 {
            t = t.max(self.hint_last_true_ts);
        }
        t
    }

    /// Remap persists for 5 s past the last active frame to keep the SNR and
    /// confidence mapping stable while flags settle.
    pub fn remap_active(&self, now: f64) -> bool {
        if self.soft_active || self.doubling_active || self.hint_active {
            return true;
        }
        let last = self.last_active_ts();
        last > 0.0 && (now - last) <= 5.0
    }

    /// Reset the soft streak and the half-f0 history on the warm-up edge.
    pub fn on_warmup_edge(&mut self) {
        self.soft_consec = 0;
        self.half_f0_hist.clear();
    }

    fn half_stable(&self, tol: f64) -> bool {
        if self.half_f0_hist.len() < 2 {
            return false;
        }
        let fmin = self.half_f0_hist.iter().cloned().fold(f64::INFINITY, f64::min);
        let fmax = self.half_f0_hist.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        fmax - fmin <= tol
    }

    /// Advance only the violation clock, for frames without a usable PSD.
    /// Soft/hard drop once the clock reaches five seconds.
    pub fn violation_tick(&mut self, now: f64) {
        if self.last_clear_bad_start <= 0.0 {
            self.last_clear_bad_start = now;
        }
        if (now - self.last_clear_bad_start) >= 5.0 {
            self.soft_active = false;
            self.doubling_active = false;
        }
    }

    /// Run one PSD frame through the state machine. Returns whether the
    /// half-f0 history was stable this frame.
    pub fn update(&mut self, inp: &HarmonicInputs) -> bool {
        let now = inp.now;

        // half-f0 history
        let hist_len = inp.hist_len.max(2);
        if inp.half_f0_hz > 0.0 {
            self.half_f0_hist.push_back(inp.half_f0_hz);
            while self.half_f0_hist.len() > hist_len {
                self.half_f0_hist.pop_front();
            }
        } else {
            self.half_f0_hist.clear();
        }
        let drift_tol = if inp.warmup_passed { inp.tol_warm } else { inp.tol_cold };
        let half_stable = self.half_stable(drift_tol);
        let soft_guards = inp.rejection_rate <= 0.05 && inp.rr_cv <= 0.30 && inp.warmup_passed;

        // Soft: immediate activation post warm-up on PSD dominance.
        let soft_pass =
            inp.warmup_passed && inp.ratio_half_fund >= inp.soft_threshold && half_stable && soft_guards;
        if soft_pass {
            if !self.soft_active {
                debug!(now, ratio = inp.ratio_half_fund, "soft doubling activated");
                self.soft_start_ts = now;
            }
            self.soft_active = true;
            self.soft_consec = 2;
            self.soft_last_true_ts = now;
        } else {
            // soft itself only clears through the 5 s violation path below;
            // the streak resets immediately
            self.soft_consec = 0;
        }

        // Hard: soft persisted >= 8 s plus PSD dominance and a high prior.
        let persist_high_bpm =
            inp.bpm_ema_valid && inp.bpm_ema > 120.0 && inp.ma_perc_active < 25.0;
        let psd_persists = inp.ratio_half_fund >= 2.0 && half_stable;
        let hard_stable = inp.rejection_rate <= 0.05 && inp.rr_cv <= 0.20;
        if self.soft_active
            && (now - self.soft_start_ts) >= 8.0
            && psd_persists
            && persist_high_bpm
            && hard_stable
        {
            if !self.doubling_active {
                debug!(now, "hard doubling activated");
            }
            self.doubling_active = true;
            self.doubling_hold_until = self.doubling_hold_until.max(now + 5.0);
            self.doubling_last_true_ts = now;
            if inp.long_rr_ms > 0.0 {
                self.doubling_long_rr_ms = inp.long_rr_ms;
            }
            let hard_remain = (self.doubling_hold_until - now).max(0.0);
            self.hard_fallback_until = now + hard_remain.min(3.0);
        }
        let hard_guards_ok = inp.ratio_half_fund >= 1.5
            && half_stable
            && inp.rejection_rate <= 0.05
            && inp.rr_cv <= 0.20;
        if self.doubling_active {
            if hard_guards_ok {
                self.doubling_last_true_ts = now;
            }
            if (now - self.doubling_last_true_ts) >= 5.0 && now >= self.doubling_hold_until {
                debug!(now, "hard doubling cleared");
                self.doubling_active = false;
            }
        }

        // Choke protection: active doubling pushing the live estimate under
        // the floor arms a gating relaxation.
        let dbl_active = self.hint_active || self.soft_active || self.doubling_active;
        if dbl_active && now >= 20.0 && inp.bpm_est > 0.0 && inp.bpm_est < inp.choke_bpm_threshold {
            if self.choke_start_ts <= 0.0 {
                self.choke_start_ts = now;
            }
            if (now - self.choke_start_ts) >= 3.0 {
                let recovery = if inp.bpm_est < inp.choke_bpm_threshold {
                    inp.choke_relax_low_bpm_sec
                } else {
                    inp.choke_relax_base_sec
                };
                self.choke_relax_until = now + recovery;
            }
        } else {
            self.choke_start_ts = 0.0;
        }

        // Hint paths.
        let psd_hint_pass = inp.warmup_passed
            && inp.ratio_half_fund >= inp.soft_threshold
            && half_stable
            && inp.rejection_rate <= 0.05
            && inp.rr_cv <= 0.30;

        let half_stable_loose = self.half_stable(0.08);
        let psd_lo_now = inp.warmup_passed
            && inp.ratio_half_fund >= inp.low_threshold
            && half_stable_loose
            && inp.rejection_rate <= 0.05
            && inp.rr_cv <= 0.20;
        let mut psd_lo_hold = false;
        if psd_lo_now {
            if self.psd_lo_start <= 0.0 {
                self.psd_lo_start = now;
            }
            if (now - self.psd_lo_start) >= 6.0 {
                psd_lo_hold = true;
            }
        } else {
            self.psd_lo_start = 0.0;
        }

        let rr_band = (370.0..=450.0).contains(&inp.rr_median_ms);
        let rr_clean = inp.rr_cv <= 0.10 && inp.rejection_rate <= 0.03;
        let rr_fallback_now = inp.warmup_passed && inp.bpm_high_persist && rr_clean && rr_band;
        if rr_fallback_now {
            self.rr_fallback_consec += 1;
        } else {
            self.rr_fallback_consec = 0;
        }
        let rr_hint_pass = self.rr_fallback_consec >= 3;

        if psd_hint_pass || psd_lo_hold || rr_hint_pass {
            let hold = if psd_hint_pass { 12.0 } else { 8.0 };
            if !self.hint_active {
                debug!(now, psd = psd_hint_pass, rr = rr_hint_pass, "doubling hint activated");
                self.hint_hold_until = now + hold;
                self.hint_start_ts = now;
            }
            self.hint_active = true;
            self.hint_last_true_ts = now;
            self.last_hint_bad_start = 0.0;
            if rr_hint_pass && !(psd_hint_pass || psd_lo_hold) {
                self.rr_fallback_driving_hint = true;
            }
        } else if self.hint_active {
            if self.last_hint_bad_start <= 0.0 {
                self.last_hint_bad_start = now;
            }
            if (now - self.last_hint_bad_start) >= 2.0 && now >= self.hint_hold_until {
                debug!(now, "doubling hint cleared");
                self.hint_active = false;
            }
        }
        if !self.hint_active {
            self.rr_fallback_driving_hint = false;
        }
        self.rr_fallback_mode_active = self.rr_fallback_driving_hint;

        // Auto-clear: a persistent violation drops soft and hard together.
        // The ratio bound sits at 3/4 of the activation threshold so a ratio
        // hovering just under activation does not immediately start the clock.
        let clear_violate = inp.ratio_half_fund < 0.75 * inp.soft_threshold
            || !half_stable
            || inp.rr_cv > 0.20
            || inp.rejection_rate > 0.05;
        if clear_violate {
            if self.last_clear_bad_start <= 0.0 {
                self.last_clear_bad_start = now;
            }
            if (now - self.last_clear_bad_start) >= 5.0 {
                self.soft_active = false;
                self.doubling_active = false;
            }
        } else {
            self.last_clear_bad_start = 0.0;
        }

        half_stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs(now: f64) -> HarmonicInputs {
        HarmonicInputs {
            now,
            warmup_passed: true,
            ratio_half_fund: 2.5,
            half_f0_hz: 1.0,
            rejection_rate: 0.0,
            rr_cv: 0.05,
            bpm_ema: 130.0,
            bpm_ema_valid: true,
            ma_perc_active: 0.0,
            long_rr_ms: 1000.0,
            rr_median_ms: 500.0,
            bpm_est: 120.0,
            bpm_high_persist: false,
            soft_threshold: 1.5,
            low_threshold: 1.25,
            hist_len: 5,
            tol_warm: 0.06,
            tol_cold: 0.10,
            choke_bpm_threshold: 35.0,
            choke_relax_base_sec: 5.0,
            choke_relax_low_bpm_sec: 7.0,
        }
    }

    fn drive(state: &mut HarmonicState, t0: f64, t1: f64, step: f64, f: impl Fn(f64) -> HarmonicInputs) {
        let mut t = t0;
        while t <= t1 {
            state.update(&f(t));
            t += step;
        }
    }

    #[test]
    fn soft_needs_stable_half_history() {
        let mut s = HarmonicState::default();
        s.update(&base_inputs(16.0));
        // single history entry: not yet stable
        assert!(!s.soft_active());
        s.update(&base_inputs(18.0));
        assert!(s.soft_active());
    }

    #[test]
    fn soft_blocked_during_warmup() {
        let mut s = HarmonicState::default();
        let mut inp = base_inputs(5.0);
        inp.warmup_passed = false;
        s.update(&inp);
        let mut inp = base_inputs(7.0);
        inp.warmup_passed = false;
        s.update(&inp);
        assert!(!s.soft_active());
    }

    #[test]
    fn hard_requires_eight_seconds_of_soft() {
        let mut s = HarmonicState::default();
        drive(&mut s, 16.0, 22.0, 2.0, base_inputs);
        assert!(s.soft_active());
        assert!(!s.hard_active(), "hard too early");
        drive(&mut s, 24.0, 26.0, 2.0, base_inputs);
        assert!(s.hard_active());
        assert!(s.hard_fallback_engaged(26.5));
        assert!(!s.hard_fallback_engaged(31.0));
    }

    #[test]
    fn hard_holds_then_clears_after_violations() {
        let mut s = HarmonicState::default();
        drive(&mut s, 16.0, 26.0, 2.0, base_inputs);
        assert!(s.hard_active());
        let hold_until = s.doubling_hold_until();
        // now feed violating frames
        let bad = |t: f64| {
            let mut i = base_inputs(t);
            i.ratio_half_fund = 0.2;
            i.rr_cv = 0.5;
            i
        };
        drive(&mut s, 27.0, hold_until + 5.5, 1.0, bad);
        assert!(!s.hard_active());
        assert!(!s.soft_active());
    }

    #[test]
    fn soft_clear_has_five_second_hysteresis() {
        let mut s = HarmonicState::default();
        drive(&mut s, 16.0, 20.0, 2.0, base_inputs);
        assert!(s.soft_active());
        let bad = |t: f64| {
            let mut i = base_inputs(t);
            i.ratio_half_fund = 0.2;
            i
        };
        // violations shorter than 5 s leave soft armed
        drive(&mut s, 21.0, 24.0, 1.0, bad);
        assert!(s.soft_active(), "soft must linger through brief violations");
        // one clean frame resets the violation clock
        s.update(&base_inputs(25.0));
        assert!(s.soft_active());
        // a full 5 s of violations finally clears it
        drive(&mut s, 26.0, 31.5, 1.0, bad);
        assert!(!s.soft_active());
    }

    #[test]
    fn hint_via_rr_only_path_needs_three_polls() {
        let mut s = HarmonicState::default();
        let rr_only = |t: f64| {
            let mut i = base_inputs(t);
            i.ratio_half_fund = 0.0; // PSD says nothing
            i.half_f0_hz = 0.0;
            i.rr_median_ms = 410.0;
            i.rr_cv = 0.05;
            i.rejection_rate = 0.0;
            i.bpm_high_persist = true;
            i
        };
        s.update(&rr_only(20.0));
        s.update(&rr_only(22.0));
        assert!(!s.hint_active());
        s.update(&rr_only(24.0));
        assert!(s.hint_active());
        assert!(s.rr_fallback_mode_active());
    }

    #[test]
    fn loose_psd_hint_requires_six_seconds() {
        let mut s = HarmonicState::default();
        let lo = |t: f64| {
            let mut i = base_inputs(t);
            i.ratio_half_fund = 1.3; // below soft, above low
            i.rr_cv = 0.1;
            i
        };
        drive(&mut s, 16.0, 21.0, 1.0, lo);
        assert!(!s.hint_active());
        drive(&mut s, 22.0, 23.0, 1.0, lo);
        assert!(s.hint_active());
        assert!(!s.rr_fallback_mode_active());
    }

    #[test]
    fn choke_arms_relaxation_when_suppressed_too_far() {
        let mut s = HarmonicState::default();
        drive(&mut s, 16.0, 24.0, 2.0, base_inputs);
        assert!(s.soft_active());
        let choked = |t: f64| {
            let mut i = base_inputs(t);
            i.bpm_est = 30.0;
            i
        };
        drive(&mut s, 25.0, 29.0, 1.0, choked);
        assert!(s.choke_relax_until() > 29.0);
    }

    #[test]
    fn remap_reports_half_until_hold_expires() {
        let mut s = HarmonicState::default();
        drive(&mut s, 16.0, 26.0, 2.0, base_inputs);
        assert!(s.hard_active());
        // while hard is active the remap must hold
        assert!(s.remap_active(27.0));
        assert!(s.remap_active(s.doubling_hold_until() - 0.1));
    }
}
