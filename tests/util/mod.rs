
// not every test binary uses every helper
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use assert_fs::TempDir;
use ndarray::Array3;
use num_complex::Complex64;

use sinoreel::algorithm::{Corrector, Kernel, KernelRequest};
use sinoreel::codec::Metadata;
use sinoreel::container::{self, FlSeries, QpiSeries, SeriesMeta, SinogramFile};
use sinoreel::progress::ProgressSink;
use sinoreel::rotation::{RotationConfiguration, RotationRegistry};
use sinoreel::session::Kernels;


pub const FRAMES: usize = 36;
pub const NY: usize = 8;
pub const NX: usize = 6;

/// name of the full-turn uniform rotation in test sessions
pub const FULL_TURN: &str = "full turn";


pub fn bin_path() -> &'static Path {
	let bin_path = Path::new(env!("CARGO_BIN_EXE_sinoreel"));
	if !bin_path.exists() {
		panic!("Target binary not found at: {:?}", bin_path);
	}
	bin_path
}


pub fn meta() -> SeriesMeta {
	SeriesMeta {
		wavelength: 550e-9,
		pixel_size: 0.1e-6,
		medium_index: 1.335
	}
}


/// frame i at time i*0.1 s, so 3.6 s for the whole turn
pub fn times() -> Vec<f64> {
	(0 .. FRAMES)
		.map(|i| i as f64*0.1)
		.collect()
}


pub fn sinogram(with_qpi: bool, with_fl: bool) -> SinogramFile {

	let qpi = with_qpi.then(|| QpiSeries {
		meta: meta(),
		times: times(),
		phase: Array3::from_shape_fn((FRAMES, NY, NX), |(i, y, x)| {
			0.01*((i + y*x) as f32).sin()
		}),
		amplitude: Array3::from_elem((FRAMES, NY, NX), 1.0)
	});

	let fl = with_fl.then(|| FlSeries {
		meta: meta(),
		times: times(),
		intensity: Array3::from_shape_fn((FRAMES, NY, NX), |(i, y, x)| {
			(i + y + x) as f32
		})
	});

	SinogramFile { qpi, fl }
}


pub fn write_sinogram(path: impl AsRef<Path>, with_qpi: bool, with_fl: bool) {
	sinogram(with_qpi, with_fl)
		.write(path)
		.expect("Failed to write sinogram");
}


/// A session folder with a raw sinogram and a uniform full-turn rotation.
pub fn session_dir(with_qpi: bool, with_fl: bool) -> TempDir {

	let dir = TempDir::new()
		.expect("Failed to create temp dir");
	write_sinogram(raw_sinogram_path(dir.path()), with_qpi, with_fl);

	let mut registry = RotationRegistry::open(dir.path())
		.expect("Failed to open registry");
	registry.set_rotation(FULL_TURN, RotationConfiguration::uniform(0.0, 3.6))
		.expect("Failed to add rotation");
	registry.save()
		.expect("Failed to save registry");

	dir
}


pub fn raw_sinogram_path(dir: impl AsRef<Path>) -> PathBuf {
	dir.as_ref().join(format!("sinogram.{}", container::EXTENSION))
}


/// Returns a small constant object function, counting calls and reporting progress like a real kernel.
#[derive(Default)]
pub struct CountingKernel {
	calls: AtomicUsize,
	fail: bool
}

impl CountingKernel {

	pub fn failing() -> Self {
		Self {
			calls: AtomicUsize::new(0),
			fail: true
		}
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl Kernel for CountingKernel {

	fn reconstruct(&self, request: &KernelRequest, progress: &dyn ProgressSink) -> Result<(Array3<Complex64>,Metadata)> {

		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail {
			bail!("solver diverged");
		}

		for _ in 0 .. request.sinogram.frames() {
			progress.advance(request.algorithm.units_per_frame());
		}

		let data = Array3::from_shape_fn((4, NY, NX), |(z, y, x)| {
			Complex64::new(1e-4*(z + y + x) as f64, -1e-5*z as f64)
		});
		let mut meta = Metadata::new();
		meta.insert("frames".to_string(), (request.sinogram.frames() as i64).into());
		meta.insert("angles".to_string(), request.angles.clone().into());
		Ok((data, meta))
	}
}


/// Leaves the object function alone, but says it did something.
pub struct NoopCorrector;

impl Corrector for NoopCorrector {

	fn correct(&self, f: &Array3<Complex64>, method: &str, _meta: &SeriesMeta, progress: &dyn ProgressSink) -> Result<(Array3<Complex64>,Metadata)> {
		progress.expect(1);
		let mut meta = Metadata::new();
		meta.insert("corrector".to_string(), format!("noop {}", method).into());
		progress.advance(1);
		Ok((f.clone(), meta))
	}
}


/// Fails every correction.
pub struct FailingCorrector;

impl Corrector for FailingCorrector {

	fn correct(&self, _f: &Array3<Complex64>, method: &str, _meta: &SeriesMeta, progress: &dyn ProgressSink) -> Result<(Array3<Complex64>,Metadata)> {
		progress.expect(1);
		bail!("no {} correction today", method)
	}
}


pub fn kernels(kernel: Arc<CountingKernel>) -> Kernels {
	Kernels {
		refractive_index: kernel.clone(),
		fluorescence: kernel,
		corrector: Some(Arc::new(NoopCorrector))
	}
}
