
use std::f64::consts::PI;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use anyhow::Result;
use ndarray::{s, Array3};
use num_complex::Complex64;

use crate::codec::{Metadata, MetaValue};
use crate::container::SeriesMeta;
use crate::error::ReelError;
use crate::modality::Modality;
use crate::progress::ProgressSink;
use crate::resample;
use crate::sino::SinogramView;


/// The reconstruction algorithms, each backed by an external kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
	/// backpropagation of the Rytov field (refractive index)
	Bpg,
	/// backprojection of the phase (refractive index)
	Bpj,
	/// backprojection of fluorescence intensity
	FlBpj
}

/// What a kernel gets to reconstruct from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
	Rytov,
	Phase,
	Fluorescence
}

/// A named set of tuning parameters for a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheme {
	pub name: &'static str,
	pub params: Metadata
}

pub const STANDARD: &str = "standard";


impl Algorithm {

	pub const REFRACTIVE_INDEX: [Algorithm; 2] = [Algorithm::Bpg, Algorithm::Bpj];
	pub const FLUORESCENCE: [Algorithm; 1] = [Algorithm::FlBpj];

	/// stable identifier, used in cache file names
	pub fn id(&self) -> &'static str {
		match self {
			Self::Bpg => "BPGodtbrain",
			Self::Bpj => "BPJradontea",
			Self::FlBpj => "FLBPJradontea"
		}
	}

	/// display name, unique within refractive-index or fluorescence algorithms
	pub fn name(&self) -> &'static str {
		match self {
			Self::Bpg => "BPG (ODTbrain)",
			Self::Bpj | Self::FlBpj => "BPJ (radontea)"
		}
	}

	pub fn input(&self) -> InputKind {
		match self {
			Self::Bpg => InputKind::Rytov,
			Self::Bpj => InputKind::Phase,
			Self::FlBpj => InputKind::Fluorescence
		}
	}

	/// the modality whose frames and times drive the reconstruction
	pub fn modality(&self) -> Modality {
		match self.input() {
			InputKind::Rytov | InputKind::Phase => Modality::Phase,
			InputKind::Fluorescence => Modality::Fluorescence
		}
	}

	/// Progress units a kernel reports per frame: QPI frames hold two fields, fluorescence frames one.
	pub fn units_per_frame(&self) -> u32 {
		if self.modality().is_qpi() {
			2
		} else {
			1
		}
	}

	pub fn schemes(&self) -> Vec<Scheme> {
		match self {

			Self::Bpg => vec![
				bpg_scheme("low precision", true, [false, false], 1.0, "edge".into(), 0, "float32"),
				bpg_scheme(STANDARD, true, [true, true], 1.75, "edge".into(), 1, "float32"),
				bpg_scheme("high precision", false, [true, true], 2.1, 0.0f64.into(), 2, "float64")
			],

			Self::Bpj | Self::FlBpj => vec![
				Scheme {
					name: STANDARD,
					params: Metadata::new()
				}
			]
		}
	}

	pub fn scheme(&self, name: &str) -> Result<Scheme> {
		self.schemes()
			.into_iter()
			.find(|scheme| scheme.name == name)
			.ok_or_else(|| ReelError::config(format!("{} has no scheme named {}", self.name(), name)).into())
	}

	/// Gathers the kernel input from the frames in `range`.
	///
	/// Projection algorithms get frames rotated so the tilted axis lines up with the frame axis.
	pub fn sinogram(&self, sino: &SinogramView, range: Range<usize>, tilted_axis: [f64; 3]) -> Result<SinogramInput> {
		match self.input() {
			InputKind::Rytov => Ok(SinogramInput::Rytov(sino.rytov(range)?)),
			InputKind::Phase => {
				let frames = frames(sino, Modality::Phase, range)?;
				Ok(SinogramInput::Phase(resample::rotate_sinogram(frames.view(), tilted_axis, 0.0)))
			}
			InputKind::Fluorescence => {
				let frames = frames(sino, Modality::Fluorescence, range)?;
				Ok(SinogramInput::Fluorescence(resample::rotate_sinogram(frames.view(), tilted_axis, 0.0)))
			}
		}
	}

	/// Converts a raw object function into the physical quantity: refractive index, or fluorescence intensity.
	pub fn post_process(&self, f: &Array3<Complex64>, meta: &SeriesMeta) -> Array3<Complex64> {
		match self {
			Self::Bpg => odt_to_ri(f, meta.resolution(), meta.medium_index),
			Self::Bpj => opt_to_ri(f, meta.resolution(), meta.medium_index),
			Self::FlBpj => f.clone()
		}
	}

	/// Records the value range of a final volume.
	pub fn summarize(&self, volume: &Array3<Complex64>, info: &mut Metadata) {
		let (re_min, re_max) = extrema(volume.iter().map(|v| v.re));
		match self.modality() {
			Modality::Fluorescence => {
				info.insert("max".to_string(), re_max.into());
				info.insert("min".to_string(), re_min.into());
			}
			_ => {
				let (im_min, im_max) = extrema(volume.iter().map(|v| v.im));
				info.insert("real max".to_string(), re_max.into());
				info.insert("real min".to_string(), re_min.into());
				info.insert("imag max".to_string(), im_max.into());
				info.insert("imag min".to_string(), im_min.into());
			}
		}
	}
}

impl fmt::Display for Algorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.id())
	}
}

impl FromStr for Algorithm {
	type Err = ReelError;

	fn from_str(s: &str) -> Result<Self,Self::Err> {
		[Self::Bpg, Self::Bpj, Self::FlBpj]
			.into_iter()
			.find(|alg| alg.id() == s)
			.ok_or_else(|| ReelError::config(format!("Unknown algorithm: {}", s)))
	}
}


fn bpg_scheme(name: &'static str, onlyreal: bool, padding: [bool; 2], padfac: f64, padval: MetaValue, intp_order: i64, dtype: &str) -> Scheme {
	let mut params = Metadata::new();
	params.insert("onlyreal".to_string(), onlyreal.into());
	params.insert("padding".to_string(), padding.iter().map(|p| if *p { 1.0 } else { 0.0 }).collect::<Vec<_>>().into());
	params.insert("padfac".to_string(), padfac.into());
	params.insert("padval".to_string(), padval);
	params.insert("intp_order".to_string(), intp_order.into());
	params.insert("dtype".to_string(), dtype.into());
	Scheme { name, params }
}


fn frames(sino: &SinogramView, modality: Modality, range: Range<usize>) -> Result<Array3<f32>> {
	let data = sino.get_data(modality)?;
	let count = data.dim().0;
	if range.start > range.end || range.end > count {
		return Err(ReelError::data(format!("Frame range {:?} outside of {} {} frames", range, count, modality)).into());
	}
	Ok(data.slice(s![range, .., ..]).to_owned())
}


fn extrema(values: impl Iterator<Item=f64>) -> (f64,f64) {
	values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}


/// Refractive index from a diffraction tomography object function.
///
/// `n = nm*sqrt(f/km^2 + 1)` with `km = 2pi*nm/res`, taking the root with non-negative real part.
pub fn odt_to_ri(f: &Array3<Complex64>, res: f64, nm: f64) -> Array3<Complex64> {
	let km = 2.0*PI*nm/res;
	f.mapv(|f| {
		let ri = nm*(f/(km*km) + 1.0).sqrt();
		if ri.re < 0.0 {
			-ri
		} else {
			ri
		}
	})
}


/// Refractive index from an optical projection tomography object function: `n = nm + f*res/(2pi)`.
pub fn opt_to_ri(f: &Array3<Complex64>, res: f64, nm: f64) -> Array3<Complex64> {
	f.mapv(|f| nm + f*res/(2.0*PI))
}


/// Kernel input for one reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub enum SinogramInput {
	/// (frames, ny, nx) Rytov field
	Rytov(Array3<Complex64>),
	/// (frames, ny, nx) phase [rad]
	Phase(Array3<f32>),
	/// (frames, ny, nx) intensity
	Fluorescence(Array3<f32>)
}

impl SinogramInput {

	pub fn frames(&self) -> usize {
		match self {
			Self::Rytov(data) => data.dim().0,
			Self::Phase(data) | Self::Fluorescence(data) => data.dim().0
		}
	}
}


pub struct KernelRequest {
	pub algorithm: Algorithm,
	pub sinogram: SinogramInput,
	/// [rad], one per frame
	pub angles: Vec<f64>,
	pub scheme: Scheme,
	pub meta: SeriesMeta,
	pub tilted_axis: [f64; 3]
}


/// An external reconstruction kernel, eg a backpropagation or backprojection solver.
///
/// Implementations must report `units_per_frame` progress units for each frame they process,
/// but must not announce them: the pipeline does that before the call.
pub trait Kernel: Send + Sync {
	fn reconstruct(&self, request: &KernelRequest, progress: &dyn ProgressSink) -> Result<(Array3<Complex64>,Metadata)>;
}


/// Filling of the missing frequency cone ("apple core") of limited-angle reconstructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppleCore {
	Keep,
	/// nearest-neighbor fill
	FillNn,
	/// spherical-harmonics fill
	FillSh
}

impl AppleCore {

	pub const ALL: [AppleCore; 3] = [AppleCore::Keep, AppleCore::FillNn, AppleCore::FillSh];

	pub fn name(&self) -> &'static str {
		match self {
			Self::Keep => "Keep Apple Core",
			Self::FillNn => "Fill Apple Core (NN)",
			Self::FillSh => "Fill Apple Core (SH)"
		}
	}

	/// the correction method, or `None` when nothing gets corrected
	pub fn method(&self) -> Option<&'static str> {
		match self {
			Self::Keep => None,
			Self::FillNn => Some("nn"),
			Self::FillSh => Some("sh")
		}
	}
}

impl FromStr for AppleCore {
	type Err = ReelError;

	fn from_str(s: &str) -> Result<Self,Self::Err> {
		Self::ALL.into_iter()
			.find(|c| c.name() == s || c.method() == Some(s) || (s == "keep" && *c == Self::Keep))
			.ok_or_else(|| ReelError::config(format!("Unknown apple core correction: {}", s)))
	}
}


/// An external post-processing correction for the apple core artifact.
///
/// Implementations report their own progress, announcing and finishing their units.
pub trait Corrector: Send + Sync {
	fn correct(&self, f: &Array3<Complex64>, method: &str, meta: &SeriesMeta, progress: &dyn ProgressSink) -> Result<(Array3<Complex64>,Metadata)>;
}
