//! Natural cubic spline interpolation and the RR tachogram smoothers.

/// Natural cubic spline over strictly increasing knots.
#[derive(Debug, Clone, Default)]
pub struct CubicSpline {
    x: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    d: Vec<f64>,
    ok: bool,
}

impl CubicSpline {
    /// Build via the standard tridiagonal solve; needs at least three knots.
    pub fn natural(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len();
        if n < 3 || ys.len() != n {
            return Self { x: xs.to_vec(), a: ys.to_vec(), ..Default::default() };
        }
        let h: Vec<f64> = (0..n - 1).map(|i| xs[i + 1] - xs[i]).collect();
        let mut alpha = vec![0.0; n];
        for i in 1..n - 1 {
            alpha[i] = 3.0 * ((ys[i + 1] - ys[i]) / h[i] - (ys[i] - ys[i - 1]) / h[i - 1]);
        }
        let mut l = vec![0.0; n];
        let mut mu = vec![0.0; n];
        let mut z = vec![0.0; n];
        l[0] = 1.0;
        for i in 1..n - 1 {
            l[i] = 2.0 * (xs[i + 1] - xs[i - 1]) - h[i - 1] * mu[i - 1];
            mu[i] = h[i] / l[i];
            z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
        }
        l[n - 1] = 1.0;
        z[n - 1] = 0.0;
        let mut c = vec![0.0; n];
        let mut b = vec![0.0; n - 1];
        let mut d = vec![0.0; n - 1];
        for j in (0..n - 1).rev() {
            c[j] = z[j] - mu[j] * c[j + 1];
            b[j] = (ys[j + 1] - ys[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
            d[j] = (c[j + 1] - c[j]) / (3.0 * h[j]);
        }
        Self { x: xs.to_vec(), a: ys.to_vec(), b, c, d, ok: true }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Evaluate at `xx`; extrapolates with the boundary polynomial.
    pub fn eval(&self, xx: f64) -> f64 {
        let n = self.x.len();
        if !self.ok || n < 2 {
            return 0.0;
        }
        let lo = if xx <= self.x[0] {
            0
        } else if xx >= self.x[n - 1] {
            n - 2
        } else {
            // binary search for the knot interval
            let mut lo = 0usize;
            let mut hi = n - 1;
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.x[mid] > xx {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            lo
        };
        let dx = xx - self.x[lo];
        self.a[lo] + self.b[lo] * dx + self.c[lo] * dx * dx + self.d[lo] * dx * dx * dx
    }
}

/// Box-car average with a symmetric window.
pub fn boxcar_smooth(y: &[f64], win: usize) -> Vec<f64> {
    if win <= 1 || y.is_empty() {
        return y.to_vec();
    }
    let n = y.len();
    let hw = win / 2;
    let mut out = vec![0.0; n];
    for i in 0..n {
        let a = i.saturating_sub(hw);
        let b = (i + hw).min(n - 1);
        let sum: f64 = y[a..=b].iter().sum();
        out[i] = sum / (b - a + 1) as f64;
    }
    out
}

/// Apply `(I + lambda * L^T L) v` where `L` is the second-difference operator.
fn apply_smoothing_matrix(v: &[f64], lambda: f64, out: &mut Vec<f64>) {
    let n = v.len();
    out.clear();
    out.resize(n, 0.0);
    if n == 0 {
        return;
    }
    let mut u = vec![0.0; n];
    if n >= 3 {
        for k in 0..n - 2 {
            let w = v[k] - 2.0 * v[k + 1] + v[k + 2];
            u[k] += w;
            u[k + 1] += -2.0 * w;
            u[k + 2] += w;
        }
    }
    for i in 0..n {
        out[i] = v[i] + lambda * u[i];
    }
}

/// Solve `(I + lambda * L^T L) y = rr` by conjugate gradients.
pub fn smooth_rr_cg(rr: &[f64], lambda: f64) -> Vec<f64> {
    smooth_rr_cg_bounded(rr, lambda, 200, 1e-6)
}

fn smooth_rr_cg_bounded(rr: &[f64], lambda: f64, max_iters: usize, tol: f64) -> Vec<f64> {
    let n = rr.len();
    if n < 3 || lambda <= 0.0 {
        return rr.to_vec();
    }
    let mut x = rr.to_vec();
    let mut ax = Vec::with_capacity(n);
    apply_smoothing_matrix(&x, lambda, &mut ax);
    let mut r: Vec<f64> = rr.iter().zip(ax.iter()).map(|(b, a)| b - a).collect();
    let mut p = r.clone();
    let mut ap = Vec::with_capacity(n);
    let mut rsold: f64 = r.iter().map(|v| v * v).sum();
    let bnorm = rr.iter().map(|v| v * v).sum::<f64>().max(1e-12).sqrt();
    for _ in 0..max_iters {
        apply_smoothing_matrix(&p, lambda, &mut ap);
        let pap: f64 = p.iter().zip(ap.iter()).map(|(a, b)| a * b).sum();
        if pap.abs() < 1e-18 {
            break;
        }
        let alpha = rsold / pap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }
        let rsnew: f64 = r.iter().map(|v| v * v).sum();
        if rsnew.sqrt() < tol * bnorm {
            break;
        }
        let beta = rsnew / rsold.max(1e-18);
        for i in 0..n {
            p[i] = r[i] + beta * p[i];
        }
        rsold = rsnew;
    }
    x
}

/// Reinsch-style smoothing: bisect lambda until the residual SSE reaches
/// `target_sse`.
pub fn smooth_rr_target_sse(rr: &[f64], target_sse: f64) -> Vec<f64> {
    if rr.len() < 3 || target_sse <= 0.0 {
        return rr.to_vec();
    }
    let sse_for = |lambda: f64| -> (f64, Vec<f64>) {
        let yhat = smooth_rr_cg(rr, lambda);
        let sse = rr.iter().zip(yhat.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        (sse, yhat)
    };
    let mut lo = 0.0f64;
    let mut hi = 1.0f64;
    let (sse0, y0) = sse_for(lo);
    if sse0 >= target_sse {
        return y0;
    }
    let mut best = y0;
    for _ in 0..40 {
        let (sse, y) = sse_for(hi);
        best = y;
        if sse >= target_sse {
            break;
        }
        hi *= 2.0;
        if hi > 1e12 {
            break;
        }
    }
    for _ in 0..40 {
        let mid = 0.5 * (lo + hi);
        let (sse, y) = sse_for(mid);
        best = y;
        if sse > target_sse {
            hi = mid;
        } else {
            lo = mid;
        }
        if (sse - target_sse).abs() / target_sse.max(1.0) < 1e-3 {
            break;
        }
    }
    best
}
