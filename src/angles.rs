
// Rotation angle estimation: fit a skewed periodic model to calibration points,
// then project the fitted signal onto a sinusoid to read off the angles.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::error::ReelError;
use crate::modality::Modality;
use crate::rotation::SpacingCalibration;
use crate::sino::SinogramView;


/// `y0 + a*sin(w*x - x0 + sum_n b_n*sin((n+1)*w*x - c_n))`, with `w = 2pi/period`
#[derive(Debug, Clone, PartialEq)]
pub struct SkewedPeriodic {
	pub period: f64,
	pub x0: f64,
	pub y0: f64,
	pub a: f64,
	/// (b_n, c_n) for each skew term
	pub skew: Vec<(f64,f64)>
}

impl SkewedPeriodic {

	pub fn omega(&self) -> f64 {
		2.0*PI/self.period
	}

	fn phase(&self, x: f64) -> f64 {
		let w = self.omega();
		let modulation = self.skew.iter()
			.enumerate()
			.map(|(n, (b, c))| b*((n + 1) as f64*w*x - c).sin())
			.sum::<f64>();
		w*x - self.x0 + modulation
	}

	pub fn eval(&self, x: f64) -> f64 {
		self.y0 + self.a*self.phase(x).sin()
	}

	pub fn eval_all(&self, x: &[f64]) -> Vec<f64> {
		x.iter()
			.map(|x| self.eval(*x))
			.collect()
	}

	/// The resolved parameters by name: `f`, `x0`, `y0`, `a`, then `b0`, `c0`, `b1`, ...
	pub fn params(&self) -> BTreeMap<String,f64> {
		let mut out = BTreeMap::new();
		out.insert("f".to_string(), 1.0/self.period);
		out.insert("x0".to_string(), self.x0);
		out.insert("y0".to_string(), self.y0);
		out.insert("a".to_string(), self.a);
		for (n, (b, c)) in self.skew.iter().enumerate() {
			out.insert(format!("b{}", n), *b);
			out.insert(format!("c{}", n), *c);
		}
		out
	}

	/// free parameters in fit order: x0, y0, a, b0, c0, b1, c1, ...
	fn to_vector(&self) -> DVector<f64> {
		let mut v = vec![self.x0, self.y0, self.a];
		for (b, c) in &self.skew {
			v.push(*b);
			v.push(*c);
		}
		DVector::from_vec(v)
	}

	fn set_vector(&mut self, v: &DVector<f64>) {
		self.x0 = v[0];
		self.y0 = v[1];
		self.a = v[2];
		for (n, term) in self.skew.iter_mut().enumerate() {
			*term = (v[3 + 2*n], v[4 + 2*n]);
		}
	}

	/// Partial derivatives of the model at `x`, in fit order.
	fn gradient(&self, x: f64, out: &mut [f64]) {
		let w = self.omega();
		let cos = self.phase(x).cos();
		out[0] = -self.a*cos;
		out[1] = 1.0;
		out[2] = self.phase(x).sin();
		for (n, (b, c)) in self.skew.iter().enumerate() {
			let arg = (n + 1) as f64*w*x - c;
			out[3 + 2*n] = self.a*cos*arg.sin();
			out[4 + 2*n] = -self.a*cos*b*arg.cos();
		}
	}
}


/// A fitted model, and how well it fit.
#[derive(Debug, Clone)]
pub struct PeriodicFit {
	pub model: SkewedPeriodic,
	/// sum of squared residuals
	pub cost: f64,
	pub iterations: usize
}


/// Inclusive bounds for each free parameter, in fit order.
type Bounds = Vec<(f64,f64)>;


const MAX_ITERATIONS: usize = 2000;
const FTOL: f64 = 1e-12;
const LAMBDA_START: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e16;


/// Fits a skewed periodic model to `(x, y)` points by nonlinear least squares.
///
/// The period is held fixed. A first pass fits only `x0`, `y0`, `a`, starting from `y0` (or the mean of `y`)
/// and with `a` kept within 20% of the peak above that offset. A second pass adds the skew terms,
/// starting at zero, on top of the first pass result.
pub fn fit_skewed_periodic(x: &[f64], y: &[f64], period: f64, skew_terms: usize, y0: Option<f64>) -> Result<PeriodicFit> {

	if x.len() != y.len() {
		return Err(ReelError::fit(format!("Got {} x values but {} y values", x.len(), y.len())).into());
	}
	if !(period > 0.0) || !period.is_finite() {
		return Err(ReelError::fit(format!("Period must be positive, not {}", period)).into());
	}
	let free = 3 + 2*skew_terms;
	if x.len() < free {
		return Err(ReelError::fit(format!(
			"Need at least {} points to fit {} skew terms, got {}",
			free, skew_terms, x.len()
		)).into());
	}

	let y0 = y0.unwrap_or_else(|| y.iter().sum::<f64>()/y.len() as f64);
	let ymax = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
	let amp = ymax - y0;
	let (amp_lo, amp_hi) = if amp >= 0.0 {
		(0.8*amp, 1.2*amp)
	} else {
		(1.2*amp, 0.8*amp)
	};

	// stage 1: baseline without skew
	let mut bounds: Bounds = vec![
		(-2.0*PI, 2.0*PI),
		(f64::NEG_INFINITY, f64::INFINITY),
		(amp_lo, amp_hi)
	];
	let start = SkewedPeriodic {
		period,
		x0: 0.0,
		y0,
		a: amp,
		skew: vec![]
	};
	let baseline = minimize(start, x, y, &bounds)?;
	debug!("Baseline fit: cost={:e} after {} iterations, {:?}", baseline.cost, baseline.iterations, baseline.model.params());

	if skew_terms == 0 {
		return Ok(baseline);
	}

	// stage 2: add the skew terms
	let mut start = baseline.model.clone();
	start.skew = vec![(0.0, 0.0); skew_terms];
	for _ in 0 .. skew_terms {
		bounds.push((f64::NEG_INFINITY, f64::INFINITY));
		bounds.push((f64::NEG_INFINITY, f64::INFINITY));
	}
	let fit = minimize(start, x, y, &bounds)?;
	debug!("Skewed fit: cost={:e} after {} iterations, {:?}", fit.cost, fit.iterations, fit.model.params());

	Ok(fit)
}


fn cost(model: &SkewedPeriodic, x: &[f64], y: &[f64]) -> f64 {
	x.iter()
		.zip(y)
		.map(|(x, y)| (model.eval(*x) - y).powi(2))
		.sum()
}


/// Bounded Levenberg-Marquardt: damped normal equations, with each step projected back into the bounds.
fn minimize(mut model: SkewedPeriodic, x: &[f64], y: &[f64], bounds: &Bounds) -> Result<PeriodicFit> {

	let m = x.len();
	let p = bounds.len();

	let mut params = model.to_vector();
	for (i, (lo, hi)) in bounds.iter().enumerate() {
		params[i] = params[i].clamp(*lo, *hi);
	}
	model.set_vector(&params);

	let mut current = cost(&model, x, y);
	if !current.is_finite() {
		return Err(ReelError::fit("Initial parameters give a non-finite residual").into());
	}

	let mut lambda = LAMBDA_START;
	let mut grad = vec![0.0; p];

	for iteration in 1 ..= MAX_ITERATIONS {

		// build the jacobian and residuals
		let mut jac = DMatrix::<f64>::zeros(m, p);
		let mut res = DVector::<f64>::zeros(m);
		for i in 0 .. m {
			model.gradient(x[i], &mut grad);
			for (j, g) in grad.iter().enumerate() {
				jac[(i, j)] = *g;
			}
			res[i] = model.eval(x[i]) - y[i];
		}
		let jtj = jac.transpose()*&jac;
		let jtr = jac.transpose()*&res;

		// parameters with no influence still need a little damping to keep the system solvable
		let max_diag = jtj.diagonal().max().max(f64::MIN_POSITIVE);

		// try increasingly damped steps until one improves the fit
		let mut improved = false;
		while lambda <= LAMBDA_MAX {

			let mut damped = jtj.clone();
			for j in 0 .. p {
				damped[(j, j)] += lambda*jtj[(j, j)].max(1e-9*max_diag);
			}

			let Some(chol) = damped.cholesky() else {
				lambda *= 10.0;
				continue;
			};
			let step = chol.solve(&(-&jtr));

			let mut candidate = &params + step;
			for (i, (lo, hi)) in bounds.iter().enumerate() {
				candidate[i] = candidate[i].clamp(*lo, *hi);
			}
			let mut trial = model.clone();
			trial.set_vector(&candidate);
			let trial_cost = cost(&trial, x, y);

			if trial_cost.is_finite() && trial_cost < current {

				let reduction = current - trial_cost;
				params = candidate;
				model = trial;
				current = trial_cost;
				lambda = (lambda/10.0).max(1e-12);
				improved = true;
				trace!("iteration {}: cost={:e}, lambda={:e}", iteration, current, lambda);

				if reduction <= FTOL*current || current <= f64::MIN_POSITIVE {
					return Ok(PeriodicFit { model, cost: current, iterations: iteration });
				}
				break;
			}

			lambda *= 10.0;
		}

		// no damping improves the fit any more: we're at a minimum
		if !improved {
			return Ok(PeriodicFit { model, cost: current, iterations: iteration });
		}
	}

	Err(ReelError::fit(format!("No convergence after {} iterations, cost={:e}", MAX_ITERATIONS, current)).into())
}


/// Recovers a continuous angle trajectory from a signal that traces one full sinusoidal cycle.
///
/// The signal is normalized with `offset` and `amplitude`. Its maximum is angle 0 and its minimum is angle pi.
/// Samples between the maximum and the minimum read as `arccos(y)`, the rest as `arccos(-y) + pi`,
/// and the result is unwrapped. If the signal doesn't have exactly one maximum and one minimum
/// per cycle, the angles will be wrong, but no error is raised.
pub fn angle_project_2pi(signal: &[f64], offset: f64, amplitude: f64) -> Vec<f64> {

	let n = signal.len();
	if n == 0 {
		return vec![];
	}

	let y = signal.iter()
		.map(|s| ((s - offset)/amplitude).clamp(-1.0, 1.0))
		.collect::<Vec<_>>();

	// roll so the max comes first
	let idmax = argmax(&y);
	let mut rolled = y.clone();
	rolled.rotate_left(idmax);
	let idmin = argmin(&rolled);

	let mut angles = rolled.iter()
		.enumerate()
		.map(|(i, v)| {
			if i < idmin {
				v.acos()
			} else {
				(-v).acos() + PI
			}
		})
		.collect::<Vec<_>>();
	angles.rotate_right(idmax);

	unwrap(&angles)
}


/// index of the first maximum, NaN loses to everything
fn argmax(values: &[f64]) -> usize {
	let mut best = 0;
	for (i, v) in values.iter().enumerate() {
		if *v > values[best] || values[best].is_nan() {
			best = i;
		}
	}
	best
}

/// index of the first minimum, NaN loses to everything
fn argmin(values: &[f64]) -> usize {
	let mut best = 0;
	for (i, v) in values.iter().enumerate() {
		if *v < values[best] || values[best].is_nan() {
			best = i;
		}
	}
	best
}


/// Removes jumps larger than pi by adding multiples of 2pi.
pub fn unwrap(phases: &[f64]) -> Vec<f64> {

	let mut out = Vec::with_capacity(phases.len());
	let mut correction = 0.0;
	for (i, phase) in phases.iter().enumerate() {
		if i > 0 {
			let d = phase - phases[i - 1];
			let mut wrapped = (d + PI).rem_euclid(2.0*PI) - PI;
			// keep the sign of jumps of exactly pi
			if wrapped == -PI && d > 0.0 {
				wrapped = PI;
			}
			if d.abs() >= PI {
				correction += wrapped - d;
			}
		}
		out.push(phase + correction);
	}
	out
}


/// Rotation angles for the frames of `sino` within the calibration's time window.
///
/// The calibration points are fitted as intensity over time, the fit is evaluated at the frame times
/// (relative to the calibration's reference time) and projected onto a sinusoid.
pub fn compute_angles_from_spacing(calibration: &SpacingCalibration, sino: &SinogramView, modality: Modality) -> Result<Vec<f64>> {

	let (intensities, times): (Vec<f64>, Vec<f64>) = calibration.points.iter()
		.copied()
		.unzip();
	let fit = fit_skewed_periodic(&times, &intensities, calibration.period, calibration.num_skw, calibration.y0)?;

	let range = sino.get_time_slice(calibration.t_start, calibration.t_end, modality)?;
	let xp = sino.get_times(modality)?[range]
		.iter()
		.map(|t| t - calibration.t0)
		.collect::<Vec<_>>();

	let signal = fit.model.eval_all(&xp);
	Ok(angle_project_2pi(&signal, fit.model.y0, fit.model.a))
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	fn grid(n: usize) -> Vec<f64> {
		(0 .. n)
			.map(|i| 2.0*PI*i as f64/n as f64)
			.collect()
	}


	#[test]
	fn project_clean_cosine() {
		for n in [8, 36, 100] {
			for (offset, amplitude) in [(0.0, 1.0), (5.0, 2.5), (-3.0, 0.1)] {
				let truth = grid(n);
				let signal = truth.iter()
					.map(|t| offset + amplitude*t.cos())
					.collect::<Vec<_>>();
				let angles = angle_project_2pi(&signal, offset, amplitude);
				for (a, t) in angles.iter().zip(&truth) {
					assert_that!(&((a - t).abs() < 1e-6), eq(true));
				}
			}
		}
	}

	#[test]
	fn project_shifted_start() {

		// start the signal a quarter turn in: the recovered angles are the true ones, up to a constant
		let truth = grid(36).into_iter()
			.map(|t| t + PI/2.0)
			.collect::<Vec<_>>();
		let signal = truth.iter()
			.map(|t| t.cos())
			.collect::<Vec<_>>();
		let angles = angle_project_2pi(&signal, 0.0, 1.0);

		let shift = angles[0] - truth[0];
		for (a, t) in angles.iter().zip(&truth) {
			assert_that!(&((a - t - shift).abs() < 1e-6), eq(true));
		}
	}

	#[test]
	fn project_empty() {
		assert_that!(&angle_project_2pi(&[], 0.0, 1.0), eq(vec![]));
	}

	#[test]
	fn unwrap_jumps() {
		let wrapped = [0.0, 3.0, -3.0, -0.5, 2.8, -3.1];
		let unwrapped = unwrap(&wrapped);
		for w in unwrapped.windows(2) {
			assert_that!(&((w[1] - w[0]).abs() <= PI), eq(true));
		}
		assert_that!(&unwrapped[0], eq(0.0));
		assert_that!(&((unwrapped[2] - (2.0*PI - 3.0)).abs() < 1e-12), eq(true));
	}

	#[test]
	fn fit_sinusoid() {

		let truth = SkewedPeriodic {
			period: 4.0,
			x0: 0.3,
			y0: 10.0,
			a: 2.0,
			skew: vec![]
		};
		let x = (0 .. 12).map(|i| i as f64*0.33).collect::<Vec<_>>();
		let y = truth.eval_all(&x);

		let fit = fit_skewed_periodic(&x, &y, 4.0, 0, None)
			.expect("Failed to fit");

		assert_that!(&(fit.cost < 1e-12), eq(true));
		assert_that!(&((fit.model.x0 - truth.x0).abs() < 1e-5), eq(true));
		assert_that!(&((fit.model.y0 - truth.y0).abs() < 1e-5), eq(true));
		assert_that!(&((fit.model.a - truth.a).abs() < 1e-5), eq(true));
		assert_that!(&fit.model.params().get("f").copied(), eq(Some(0.25)));
	}

	#[test]
	fn fit_skewed() {

		let truth = SkewedPeriodic {
			period: 6.0,
			x0: -0.4,
			y0: 1.0,
			a: 0.5,
			skew: vec![(0.3, 0.2)]
		};
		let x = (0 .. 24).map(|i| i as f64*0.25).collect::<Vec<_>>();
		let y = truth.eval_all(&x);

		let baseline = fit_skewed_periodic(&x, &y, 6.0, 0, None)
			.expect("Failed to fit baseline");
		let skewed = fit_skewed_periodic(&x, &y, 6.0, 1, None)
			.expect("Failed to fit skew");

		assert_that!(&(skewed.cost <= baseline.cost), eq(true));
		assert_that!(&skewed.model.skew.len(), eq(1));
	}

	#[test]
	fn fit_underdetermined() {

		// 2 skew terms make 7 free parameters
		let x = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
		let y = [0.0, 1.0, 0.0, -1.0, 0.0, 1.0];

		let e = fit_skewed_periodic(&x, &y, 4.0, 2, None)
			.expect_err("fit should fail");
		assert_that!(&matches!(crate::error::categorize(&e), Some(ReelError::FitConvergence(_))), eq(true));
	}
}
