
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3, ArrayView3, Zip};
use num_complex::Complex64;
use tracing::{debug, trace};

use crate::container::{ContainerHeader, SeriesMeta, SinogramFile};
use crate::digest;
use crate::error::ReelError;
use crate::modality::Modality;
use crate::progress::ProgressSink;
use crate::resample;


/// Mean frame rate of a series, with its coefficient of variation as a data-quality hint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRate {
	/// [1/s]
	pub rate: f64,
	/// coefficient of variation of the per-interval rates [%]
	pub variation: f64
}


/// Values computed from the loaded frames on first use, forgotten on reload.
#[derive(Debug, Default)]
struct Derived {
	hash: OnceLock<String>,
	qpi_rate: OnceLock<FrameRate>,
	fl_rate: OnceLock<FrameRate>
}

impl Derived {

	fn rate(&self, modality: Modality) -> &OnceLock<FrameRate> {
		if modality.is_qpi() {
			&self.qpi_rate
		} else {
			&self.fl_rate
		}
	}
}


/// An in-memory view of a sinogram container.
///
/// Phase and amplitude come from the QPI series and share its times and metadata.
/// Fluorescence has its own.
#[derive(Debug)]
pub struct SinogramView {
	path: PathBuf,
	file: SinogramFile,
	derived: Derived
}

impl SinogramView {

	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let file = SinogramFile::read(path)?;
		Self::from_file(path, file)
	}

	/// Loads the sinogram, announcing and then counting two units per QPI frame and one per fluorescence frame.
	pub fn load_with_progress(path: impl AsRef<Path>, progress: &dyn ProgressSink) -> Result<Self> {

		let path = path.as_ref();
		progress.expect(load_units(&SinogramFile::read_header(path)?));

		let file = SinogramFile::read_with_progress(path, |units| progress.advance(units))?;
		Self::from_file(path, file)
	}

	fn from_file(path: &Path, file: SinogramFile) -> Result<Self> {

		if let Some(qpi) = &file.qpi {
			check_times(&qpi.times, Modality::Phase)?;
		}
		if let Some(fl) = &file.fl {
			check_times(&fl.times, Modality::Fluorescence)?;
		}

		debug!(
			"Loaded sinogram {}: QPI frames={:?}, fluorescence frames={:?}",
			path.to_string_lossy(),
			file.qpi.as_ref().map(|s| s.times.len()),
			file.fl.as_ref().map(|s| s.times.len())
		);

		Ok(Self {
			path: path.to_path_buf(),
			file,
			derived: Derived::default()
		})
	}

	/// Re-reads the backing file and drops every derived value.
	pub fn reload(&mut self) -> Result<()> {
		let fresh = Self::load(&self.path)?;
		*self = fresh;
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn has_qpi(&self) -> bool {
		self.file.qpi.is_some()
	}

	pub fn has_fli(&self) -> bool {
		self.file.fl.is_some()
	}

	pub fn has(&self, modality: Modality) -> bool {
		if modality.is_qpi() {
			self.has_qpi()
		} else {
			self.has_fli()
		}
	}

	fn missing(&self, modality: Modality) -> anyhow::Error {
		let series = if modality.is_qpi() { "QPI" } else { "fluorescence" };
		ReelError::data(format!(
			"No {} data in {}, can't get {}",
			series, self.path.to_string_lossy(), modality
		)).into()
	}

	pub fn get_data(&self, modality: Modality) -> Result<ArrayView3<f32>> {
		let data = match modality {
			Modality::Phase => self.file.qpi.as_ref().map(|s| s.phase.view()),
			Modality::Amplitude => self.file.qpi.as_ref().map(|s| s.amplitude.view()),
			Modality::Fluorescence => self.file.fl.as_ref().map(|s| s.intensity.view())
		};
		data.ok_or_else(|| self.missing(modality))
	}

	/// capture times of the frames [s]
	pub fn get_times(&self, modality: Modality) -> Result<&[f64]> {
		let times = if modality.is_qpi() {
			self.file.qpi.as_ref().map(|s| s.times.as_slice())
		} else {
			self.file.fl.as_ref().map(|s| s.times.as_slice())
		};
		times.ok_or_else(|| self.missing(modality))
	}

	pub fn get_meta(&self, modality: Modality) -> Result<SeriesMeta> {
		let meta = if modality.is_qpi() {
			self.file.qpi.as_ref().map(|s| s.meta)
		} else {
			self.file.fl.as_ref().map(|s| s.meta)
		};
		meta.ok_or_else(|| self.missing(modality))
	}

	/// number of frames
	pub fn get_size(&self, modality: Modality) -> Result<usize> {
		Ok(self.get_times(modality)?.len())
	}

	/// (frames, ny, nx)
	pub fn shape(&self, modality: Modality) -> Result<(usize,usize,usize)> {
		Ok(self.get_data(modality)?.dim())
	}

	pub fn get_frame_rate(&self, modality: Modality) -> Result<FrameRate> {

		let cell = self.derived.rate(modality);
		if let Some(rate) = cell.get() {
			return Ok(*rate);
		}

		let rate = frame_rate(self.get_times(modality)?)
			.with_context(|| format!("Failed to estimate frame rate for {}", modality))?;
		trace!("{} frame rate: {:.4} Hz, variation {:.2}%", modality, rate.rate, rate.variation);

		Ok(*cell.get_or_init(|| rate))
	}

	/// Maps times [s] to (fractional) frame indices, assuming a constant frame rate.
	pub fn convert_time_to_index(&self, times: &[f64], modality: Modality, integer: bool) -> Result<Vec<f64>> {
		let t0 = self.first_time(modality)?;
		let rate = self.get_frame_rate(modality)?.rate;
		Ok(times.iter()
			.map(|t| {
				let index = (t - t0)*rate;
				if integer {
					index.round()
				} else {
					index
				}
			})
			.collect())
	}

	/// The inverse of [Self::convert_time_to_index].
	pub fn convert_index_to_time(&self, indices: &[f64], modality: Modality) -> Result<Vec<f64>> {
		let t0 = self.first_time(modality)?;
		let rate = self.get_frame_rate(modality)?.rate;
		Ok(indices.iter()
			.map(|i| t0 + i/rate)
			.collect())
	}

	fn first_time(&self, modality: Modality) -> Result<f64> {
		self.get_times(modality)?
			.first()
			.copied()
			.ok_or_else(|| self.missing(modality))
	}

	/// The frames captured within `[t_start, t_end]`.
	pub fn get_time_slice(&self, t_start: f64, t_end: f64, modality: Modality) -> Result<Range<usize>> {
		Ok(time_slice(self.get_times(modality)?, t_start, t_end))
	}

	/// See [resample::get_slice].
	pub fn get_slice(&self, position: [f64; 2], angle: f64, data: ArrayView3<f32>, offset: f64, fillval: f32) -> Array2<f32> {
		resample::get_slice(position, angle, data, offset, fillval)
	}

	/// SHA-256 of the whole backing file, computed once per load.
	pub fn get_hash(&self) -> Result<String> {
		if let Some(hash) = self.derived.hash.get() {
			return Ok(hash.clone());
		}
		let hash = digest::hash_file(&self.path)?;
		Ok(self.derived.hash.get_or_init(|| hash).clone())
	}

	/// The QPI frames in `range` as a Rytov field, `ln(amplitude) + i*phase`.
	pub fn rytov(&self, range: Range<usize>) -> Result<Array3<Complex64>> {

		let phase = self.get_data(Modality::Phase)?;
		let amplitude = self.get_data(Modality::Amplitude)?;
		let frames = phase.dim().0;
		if range.start > range.end || range.end > frames {
			return Err(ReelError::data(format!("Frame range {:?} outside of {} QPI frames", range, frames)).into());
		}

		let phase = phase.slice(s![range.clone(), .., ..]);
		let amplitude = amplitude.slice(s![range, .., ..]);
		if let Some(bad) = amplitude.iter().find(|a| !(**a > 0.0)) {
			return Err(ReelError::data(format!("Amplitude must be positive for the Rytov approximation, found {}", bad)).into());
		}

		let mut out = Array3::<Complex64>::zeros(phase.dim());
		Zip::from(&mut out)
			.and(&phase)
			.and(&amplitude)
			.for_each(|o, p, a| *o = Complex64::new((*a as f64).ln(), *p as f64));
		Ok(out)
	}
}


/// progress units needed to load a container
pub fn load_units(header: &ContainerHeader) -> u32 {
	let qpi = header.qpi.map(|(dims, _)| dims.frames.saturating_mul(2)).unwrap_or(0);
	let fl = header.fl.map(|(dims, _)| dims.frames).unwrap_or(0);
	u32::try_from(qpi.saturating_add(fl)).unwrap_or(u32::MAX)
}


fn check_times(times: &[f64], modality: Modality) -> Result<()> {
	if let Some(i) = times.iter().position(|t| !t.is_finite()) {
		return Err(ReelError::data(format!("{} frame {} has a non-finite time", modality, i)).into());
	}
	if let Some(i) = times.windows(2).position(|w| w[1] < w[0]) {
		return Err(ReelError::data(format!(
			"{} times go backwards at frame {}: {} -> {}",
			modality, i + 1, times[i], times[i + 1]
		)).into());
	}
	Ok(())
}


/// Mean of `1/dt` over the non-zero time steps.
pub fn frame_rate(times: &[f64]) -> Result<FrameRate> {

	let rates = times.windows(2)
		.map(|w| w[1] - w[0])
		.filter(|dt| *dt != 0.0)
		.map(|dt| 1.0/dt)
		.collect::<Vec<_>>();
	if rates.is_empty() {
		return Err(ReelError::data(format!("Need at least two distinct frame times, got {}", times.len())).into());
	}

	let n = rates.len() as f64;
	let mean = rates.iter().sum::<f64>()/n;
	let var = rates.iter()
		.map(|r| (r - mean).powi(2))
		.sum::<f64>()/n;

	Ok(FrameRate {
		rate: mean,
		variation: var.sqrt()/mean*100.0
	})
}


/// Frames from the first one not before `t_start` up to the last one not after `t_end`.
pub fn time_slice(times: &[f64], t_start: f64, t_end: f64) -> Range<usize> {
	let start = times.iter().filter(|t| **t < t_start).count();
	let end = times.len() - times.iter().filter(|t| **t > t_end).count();
	start .. end.max(start)
}
