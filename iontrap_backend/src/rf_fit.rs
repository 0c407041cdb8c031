//! RF-correlation fitter: estimates the micromotion modulation of the fluorescence from many
//! short trigger-to-detector time differences.
//!
//! The pipeline is a pure function of the pooled differences (in seconds), so identical input
//! always gives identical output:
//!
//! 1. [`iqr_filter`]: drop everything outside `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]`.
//! 2. [`histogram`]: `no_bins` equal-width bins spanning `[0, max]`.
//! 3. [`fit_sine`]: Levenberg-Marquardt fit of `y = A sin(2 pi f x + phi) + offset` to the bin
//!    centers, started from 4 and from 8 cycles across the bin range; the lower residual wins.
//! 4. [`SineFit::normalized`]: phase folded into `[0, pi)`.

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::f64::consts::PI;

/// Initial guesses for the number of modulation periods across the histogram range
pub const INITIAL_CYCLES: [f64; 2] = [4., 8.];

const MAX_ITERATIONS: usize = 200;
const TOLERANCE: f64 = 1e-10;

/// Parameters of `y = amplitude * sin(2 pi frequency x + phase) + offset`
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SineFit {
    pub amplitude: f64,
    pub frequency: f64,
    pub phase: f64,
    pub offset: f64,
}

impl SineFit {
    fn from_params(p: &Array1<f64>) -> Self {
        Self {
            amplitude: p[0],
            frequency: p[1],
            phase: p[2],
            offset: p[3],
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.amplitude * (2. * PI * self.frequency * x + self.phase).sin() + self.offset
    }

    pub fn residual_sum_of_squares(&self, x: &[f64], y: &[f64]) -> f64 {
        x.iter()
            .zip(y)
            .map(|(&xi, &yi)| (yi - self.eval(xi)).powi(2))
            .sum()
    }

    /// Folds the phase into `[0, pi)`. A shift by an odd multiple of pi flips the sign of the
    /// amplitude so that the curve itself is unchanged.
    pub fn normalized(mut self) -> Self {
        let mut folded = self.phase.rem_euclid(PI);
        if folded >= PI {
            folded = 0.;
        }
        let turns = ((self.phase - folded) / PI).round() as i64;
        if turns % 2 != 0 {
            self.amplitude = -self.amplitude;
        }
        self.phase = folded;
        self
    }
}

/// Result of an RF-correlation measurement.
///
/// With no usable data all three fields are empty/`None`; this is not an error.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RfCorrelation {
    pub fit: Option<SineFit>,
    pub histogram: Vec<f64>,
    pub bin_edges: Vec<f64>,
}

impl RfCorrelation {
    pub fn is_empty(&self) -> bool {
        self.fit.is_none() && self.histogram.is_empty() && self.bin_edges.is_empty()
    }
}

/// Quantile with linear interpolation between order statistics. `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Removes outliers with the 1.5 IQR rule, keeping the original order of the survivors.
pub fn iqr_filter(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let (low, high) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
    values
        .iter()
        .copied()
        .filter(|v| (low..=high).contains(v))
        .collect()
}

/// Bins `values` into `no_bins` equal-width bins over `[0, max(values)]`.
///
/// Returns `(counts, edges)` with `edges.len() == no_bins + 1`. The last bin includes its right
/// edge. A zero maximum falls back to the range `[0, 1]`.
pub fn histogram(values: &[f64], no_bins: usize) -> (Vec<f64>, Vec<f64>) {
    if values.is_empty() || no_bins == 0 {
        return (Vec::new(), Vec::new());
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let upper = if max > 0. { max } else { 1. };
    let width = upper / no_bins as f64;
    let edges: Vec<f64> = (0..=no_bins).map(|i| i as f64 * width).collect();
    let mut counts = vec![0.; no_bins];
    for &v in values {
        if !(0. ..=upper).contains(&v) {
            continue;
        }
        let bin = std::cmp::min((v / width) as usize, no_bins - 1);
        counts[bin] += 1.;
    }
    (counts, edges)
}

/// Solves the damped normal equations `(JᵀJ + λ diag) step = Jᵀr` of one iteration.
fn lm_step(jtj: &Array2<f64>, jtr: &Array1<f64>, lambda: f64) -> Option<Array1<f64>> {
    let damped = Matrix4::from_fn(|i, j| {
        if i == j {
            jtj[[i, i]] + lambda * jtj[[i, i]].max(1e-12)
        } else {
            jtj[[i, j]]
        }
    });
    let rhs = Vector4::from_fn(|i, _| jtr[i]);
    let step = damped.lu().solve(&rhs)?;
    if step.iter().all(|v| v.is_finite()) {
        Some(step.iter().copied().collect())
    } else {
        None
    }
}

fn residuals(p: &Array1<f64>, x: &Array1<f64>, y: &Array1<f64>) -> Array1<f64> {
    let model = SineFit::from_params(p);
    y - &x.mapv(|xi| model.eval(xi))
}

fn jacobian(p: &Array1<f64>, x: &Array1<f64>) -> Array2<f64> {
    let mut jac = Array2::zeros((x.len(), 4));
    for (i, &xi) in x.iter().enumerate() {
        let theta = 2. * PI * p[1] * xi + p[2];
        let (sin, cos) = theta.sin_cos();
        jac[[i, 0]] = sin;
        jac[[i, 1]] = p[0] * cos * 2. * PI * xi;
        jac[[i, 2]] = p[0] * cos;
        jac[[i, 3]] = 1.;
    }
    jac
}

/// Levenberg-Marquardt least squares from the initial parameters `p0`.
/// Returns `None` when the iteration breaks down numerically.
fn levenberg_marquardt(x: &Array1<f64>, y: &Array1<f64>, p0: Array1<f64>) -> Option<SineFit> {
    let mut p = p0;
    let mut lambda = 1e-3;
    let mut r = residuals(&p, x, y);
    let mut cost = r.dot(&r);

    for _ in 0..MAX_ITERATIONS {
        let jac = jacobian(&p, x);
        let jtj = jac.t().dot(&jac);
        let jtr = jac.t().dot(&r);
        let step = lm_step(&jtj, &jtr, lambda)?;
        let candidate = &p + &step;
        let r_new = residuals(&candidate, x, y);
        let cost_new = r_new.dot(&r_new);
        if !cost_new.is_finite() {
            return None;
        }
        if cost_new < cost {
            let converged = (cost - cost_new) <= TOLERANCE * cost.max(1e-300);
            p = candidate;
            r = r_new;
            cost = cost_new;
            lambda = (lambda / 10.).max(1e-12);
            if converged {
                break;
            }
        } else {
            lambda *= 10.;
            if lambda > 1e12 {
                break;
            }
        }
    }
    if p.iter().all(|v| v.is_finite()) {
        Some(SineFit::from_params(&p))
    } else {
        None
    }
}

/// Fits a sinusoid to `(x, y)`, trying each of [`INITIAL_CYCLES`] as frequency guess.
///
/// A start that fails numerically scores an infinite residual; if every start fails the
/// all-zero [`SineFit::default`] is returned.
pub fn fit_sine(x: &[f64], y: &[f64]) -> SineFit {
    if x.is_empty() || x.len() != y.len() {
        return SineFit::default();
    }
    let span = x.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        - x.iter().copied().fold(f64::INFINITY, f64::min);
    let span = if span > 0. { span } else { 1. };
    let y_max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let y_min = y.iter().copied().fold(f64::INFINITY, f64::min);
    let mean = y.iter().sum::<f64>() / y.len() as f64;
    let xa = Array1::from(x.to_vec());
    let ya = Array1::from(y.to_vec());

    INITIAL_CYCLES
        .iter()
        .map(|cycles| {
            let p0 = Array1::from(vec![(y_max - y_min) / 2., cycles / span, 0., mean]);
            match levenberg_marquardt(&xa, &ya, p0) {
                Some(fit) => (fit.residual_sum_of_squares(x, y), fit),
                None => {
                    log::debug!("Sine fit starting at {cycles} cycles did not converge");
                    (f64::INFINITY, SineFit::default())
                }
            }
        })
        .filter(|(rss, _)| rss.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, fit)| fit)
        .unwrap_or_default()
}

/// Runs the full pipeline on pooled time differences in seconds.
pub fn fit_rf_correlation(diffs: &[f64], no_bins: usize) -> RfCorrelation {
    let filtered = iqr_filter(diffs);
    if filtered.is_empty() || no_bins == 0 {
        return RfCorrelation::default();
    }
    let (histogram, bin_edges) = histogram(&filtered, no_bins);
    let centers: Vec<f64> = bin_edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    let fit = fit_sine(&centers, &histogram).normalized();
    RfCorrelation {
        fit: Some(fit),
        histogram,
        bin_edges,
    }
}
