
// Resampling of frame stacks along arbitrary in-plane directions.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};


/// Samples a frame at fractional pixel coordinates with bilinear interpolation.
///
/// `y` indexes the first frame axis and `x` the second. Samples outside the frame read as `None`.
pub fn bilinear(frame: ArrayView2<f32>, y: f64, x: f64) -> Option<f32> {

	let (ny, nx) = frame.dim();
	if ny == 0 || nx == 0 || !y.is_finite() || !x.is_finite() {
		return None;
	}

	// allow a tiny overshoot at the far edge, so exact edge coordinates still sample
	const EPS: f64 = 1e-9;
	if y < -EPS || x < -EPS || y > (ny - 1) as f64 + EPS || x > (nx - 1) as f64 + EPS {
		return None;
	}
	let y = y.clamp(0.0, (ny - 1) as f64);
	let x = x.clamp(0.0, (nx - 1) as f64);

	let y0 = (y.floor() as usize).min(ny - 1);
	let x0 = (x.floor() as usize).min(nx - 1);
	let y1 = (y0 + 1).min(ny - 1);
	let x1 = (x0 + 1).min(nx - 1);
	let fy = y - y0 as f64;
	let fx = x - x0 as f64;

	let v00 = frame[[y0, x0]] as f64;
	let v01 = frame[[y0, x1]] as f64;
	let v10 = frame[[y1, x0]] as f64;
	let v11 = frame[[y1, x1]] as f64;

	let v = v00*(1.0 - fy)*(1.0 - fx)
		+ v01*(1.0 - fy)*fx
		+ v10*fy*(1.0 - fx)
		+ v11*fy*fx;
	Some(v as f32)
}


/// Extracts a planar slice through a (frames, ny, nx) stack.
///
/// The slice plane contains the frame axis and the in-plane line through `position` (x, y)
/// at `angle` degrees, shifted sideways by `offset` pixels. The result has shape (frames, ny):
/// one row per frame, sampled every pixel along the line starting at the frame edge.
/// Samples outside the frames are 0, and when `fillval` is non-zero, every 0 is replaced by it.
pub fn get_slice(position: [f64; 2], angle: f64, data: ArrayView3<f32>, offset: f64, fillval: f32) -> Array2<f32> {

	let (frames, ny, nx) = data.dim();
	let angle = angle.to_radians();
	let (sin, cos) = angle.sin_cos();

	// rotation center, in (y, x) order
	let center = [(ny as f64 - 1.0)/2.0, (nx as f64 - 1.0)/2.0];

	// move the picked point into the rotated frame, keep its cross-line coordinate,
	// and start the line at the frame edge
	let p = [position[1] - center[0], position[0] - center[1]];
	let rotated = [cos*p[0] + sin*p[1], -sin*p[0] + cos*p[1]];
	let start = [-center[0], rotated[1] + offset];
	let origin = [
		cos*start[0] - sin*start[1] + center[0],
		sin*start[0] + cos*start[1] + center[1]
	];

	let mut out = Array2::<f32>::zeros((frames, ny));
	for (i, frame) in data.axis_iter(Axis(0)).enumerate() {
		for j in 0 .. ny {
			let y = origin[0] + j as f64*cos;
			let x = origin[1] + j as f64*sin;
			out[[i, j]] = bilinear(frame, y, x)
				.unwrap_or(0.0);
		}
	}

	if fillval != 0.0 {
		out.mapv_inplace(|v| if v == 0.0 { fillval } else { v });
	}

	out
}


/// Rotates every frame of a stack around its center so the tilted axis lines up with the frame axis.
///
/// The rotation angle is `atan2(axis[0], axis[1])`. The output keeps the input shape and
/// pixels that map outside the source frame read as `fillval`.
pub fn rotate_sinogram(data: ArrayView3<f32>, tilted_axis: [f64; 3], fillval: f32) -> Array3<f32> {

	let (frames, ny, nx) = data.dim();
	let angle = tilted_axis[0].atan2(tilted_axis[1]);
	let (sin, cos) = angle.sin_cos();
	let cy = (ny as f64 - 1.0)/2.0;
	let cx = (nx as f64 - 1.0)/2.0;

	let mut out = Array3::<f32>::from_elem((frames, ny, nx), fillval);
	for (frame, mut dst) in data.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
		for ((oy, ox), v) in dst.indexed_iter_mut() {
			// map each output pixel back into the source frame
			let dy = oy as f64 - cy;
			let dx = ox as f64 - cx;
			let sy = cos*dy + sin*dx + cy;
			let sx = -sin*dy + cos*dx + cx;
			if let Some(sample) = bilinear(frame, sy, sx) {
				*v = sample;
			}
		}
	}

	out
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};
	use ndarray::Array3;

	use super::*;


	fn ramp(frames: usize, ny: usize, nx: usize) -> Array3<f32> {
		Array3::from_shape_fn((frames, ny, nx), |(i, y, x)| (i*100 + y*10 + x) as f32 + 1.0)
	}


	#[test]
	fn bilinear_midpoints() {
		let frame = ndarray::arr2(&[[0.0f32, 2.0], [4.0, 6.0]]);
		assert_that!(&bilinear(frame.view(), 0.5, 0.5), eq(Some(3.0)));
		assert_that!(&bilinear(frame.view(), 1.0, 1.0), eq(Some(6.0)));
		assert_that!(&bilinear(frame.view(), 1.5, 0.0), eq(None));
	}

	#[test]
	fn empty_frame() {
		let frame = Array2::<f32>::zeros((0, 4));
		assert_that!(&bilinear(frame.view(), 0.0, 0.0), eq(None));
		let frame = Array2::<f32>::zeros((3, 0));
		assert_that!(&bilinear(frame.view(), 0.0, 0.0), eq(None));
	}

	#[test]
	fn slice_at_zero_degrees_is_a_column() {

		let data = ramp(3, 5, 5);
		let slice = get_slice([3.0, 2.0], 0.0, data.view(), 0.0, 0.0);

		assert_that!(&slice.dim(), eq((3, 5)));
		for i in 0 .. 3 {
			for j in 0 .. 5 {
				assert_that!(&slice[[i, j]], eq(data[[i, j, 3]]));
			}
		}
	}

	#[test]
	fn slice_fill() {

		let data = Array3::<f32>::zeros((2, 4, 4));
		let slice = get_slice([1.0, 1.0], 30.0, data.view(), 0.0, -1.0);

		assert_that!(&slice.iter().all(|v| *v == -1.0), eq(true));
	}

	#[test]
	fn rotate_identity() {

		let data = ramp(2, 4, 6);
		// atan2(0, 1) = 0
		let rotated = rotate_sinogram(data.view(), [0.0, 1.0, 0.0], 0.0);

		assert_that!(&rotated, eq(data));
	}

	#[test]
	fn rotate_half_turn() {

		let data = ramp(1, 3, 3);
		// atan2(0, -1) = pi
		let rotated = rotate_sinogram(data.view(), [0.0, -1.0, 0.0], 0.0);

		for y in 0 .. 3 {
			for x in 0 .. 3 {
				let expected = data[[0, 2 - y, 2 - x]];
				assert_that!(&((rotated[[0, y, x]] - expected).abs() < 1e-4), eq(true));
			}
		}
	}
}
