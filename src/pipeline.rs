
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use ndarray::Array3;
use num_complex::Complex64;
use tracing::{debug, info, trace};

use crate::algorithm::{Algorithm, AppleCore, Corrector, Kernel, KernelRequest};
use crate::cache::{CacheEntry, CacheKey, ReconstructionCache};
use crate::codec::Metadata;
use crate::container::SeriesMeta;
use crate::error::ReelError;
use crate::progress::{Progress, ProgressSink};
use crate::rotation::{RotationConfiguration, RotationRegistry};
use crate::sino::SinogramView;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Pending,
	Reconstructing,
	PostProcessing,
	Done,
	Failed
}

impl State {

	fn id(&self) -> u8 {
		match self {
			Self::Pending => 0,
			Self::Reconstructing => 1,
			Self::PostProcessing => 2,
			Self::Done => 3,
			Self::Failed => 4
		}
	}

	fn from_id(id: u8) -> Self {
		match id {
			1 => Self::Reconstructing,
			2 => Self::PostProcessing,
			3 => Self::Done,
			4 => Self::Failed,
			_ => Self::Pending
		}
	}
}

impl fmt::Display for State {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Pending => "pending",
			Self::Reconstructing => "reconstructing",
			Self::PostProcessing => "post-processing",
			Self::Done => "done",
			Self::Failed => "failed"
		};
		f.write_str(name)
	}
}


/// What a run shares with whoever watches it.
///
/// Each stage has its own counter pair, written only by the worker.
#[derive(Debug, Default)]
pub struct RunProgress {
	pub reconstruction: Progress,
	pub post: Progress,
	state: AtomicU8
}

impl RunProgress {

	pub fn state(&self) -> State {
		State::from_id(self.state.load(Ordering::Acquire))
	}

	fn set_state(&self, state: State) {
		trace!("state: {}", state);
		self.state.store(state.id(), Ordering::Release);
	}

	/// both stages have done all the work they announced
	pub fn is_complete(&self) -> bool {
		self.reconstruction.is_complete() && self.post.is_complete()
	}
}


/// The result of one run.
#[derive(Debug, Clone)]
pub struct RunOutput {
	pub algorithm: Algorithm,
	pub scheme: String,
	/// refractive index, or fluorescence intensity
	pub volume: Array3<Complex64>,
	pub info: Metadata,
	/// [rad]
	pub angles: Vec<f64>,
	/// the frames that were reconstructed
	pub range: Range<usize>,
	pub elapsed: Duration
}


/// Reconstructs one modality of a sinogram under one rotation.
pub struct ReconstructionPipeline {
	algorithm: Algorithm,
	sino: Arc<SinogramView>,
	rotation: RotationConfiguration,
	sino_hash: String,
	rotation_hash: String,
	meta: SeriesMeta,
	angles: Vec<f64>,
	range: Range<usize>,
	cache: Arc<ReconstructionCache>,
	hash_prefix: usize,
	kernel: Arc<dyn Kernel>,
	corrector: Option<Arc<dyn Corrector>>
}

impl ReconstructionPipeline {

	/// Resolves everything about the inputs up front, so bad inputs fail before any work starts.
	pub fn new(
		algorithm: Algorithm,
		sino: Arc<SinogramView>,
		registry: &RotationRegistry,
		rotation_name: &str,
		cache: Arc<ReconstructionCache>,
		hash_prefix: usize,
		kernel: Arc<dyn Kernel>
	) -> Result<Self> {

		let modality = algorithm.modality();
		let rotation = registry.rotation(rotation_name)?.clone();
		let rotation_hash = registry.get_hash(rotation_name)?;
		let sino_hash = sino.get_hash()?;
		let meta = sino.get_meta(modality)?;
		let (angles, range) = registry.compute_angles(rotation_name, &sino, modality)
			.context(format!("Failed to compute angles for rotation {}", rotation_name))?;
		if angles.is_empty() {
			return Err(ReelError::config(format!(
				"Rotation {} contains no {} frames", rotation_name, modality
			)).into());
		}

		Ok(Self {
			algorithm,
			sino,
			rotation,
			sino_hash,
			rotation_hash,
			meta,
			angles,
			range,
			cache,
			hash_prefix,
			kernel,
			corrector: None
		})
	}

	pub fn with_corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
		self.corrector = Some(corrector);
		self
	}

	pub fn algorithm(&self) -> Algorithm {
		self.algorithm
	}

	pub fn sino_hash(&self) -> &str {
		&self.sino_hash
	}

	pub fn rotation_hash(&self) -> &str {
		&self.rotation_hash
	}

	pub fn rotation(&self) -> &RotationConfiguration {
		&self.rotation
	}

	pub fn meta(&self) -> &SeriesMeta {
		&self.meta
	}

	pub fn angles(&self) -> &[f64] {
		&self.angles
	}

	pub fn range(&self) -> Range<usize> {
		self.range.clone()
	}

	pub fn cache_key(&self, scheme: &str) -> CacheKey {
		CacheKey::new(self.algorithm, &self.sino_hash, &self.rotation_hash, scheme, self.hash_prefix)
	}

	/// Runs the reconstruction on this thread, reporting through `progress`.
	pub fn run(&self, scheme: &str, apple_core: AppleCore, progress: &RunProgress) -> Result<RunOutput> {
		let result = self.run_stages(scheme, apple_core, progress);
		progress.set_state(match result {
			Ok(_) => State::Done,
			Err(_) => State::Failed
		});
		result
	}

	#[tracing::instrument(skip_all, level = 5, name = "Reconstruction", fields(algorithm = %self.algorithm, scheme = %scheme))]
	fn run_stages(&self, scheme: &str, apple_core: AppleCore, progress: &RunProgress) -> Result<RunOutput> {

		let started = Instant::now();

		// reject bad options before the expensive part
		let scheme = self.algorithm.scheme(scheme)?;
		let correction = match apple_core.method() {
			None => None,
			Some(method) => {
				if !self.algorithm.modality().is_qpi() {
					return Err(ReelError::config(format!("{} can't be corrected for the apple core", self.algorithm.name())).into());
				}
				let corrector = self.corrector.clone()
					.ok_or_else(|| ReelError::config("Apple core correction requested, but no corrector is available"))?;
				Some((corrector, method))
			}
		};

		// stage 1: the raw object function, through the cache
		progress.set_state(State::Reconstructing);
		progress.reconstruction.expect(1);
		let key = self.cache_key(scheme.name);
		let entry = self.cache.get_or_compute(&key, || {

			let frames = self.range.len() as u32;
			progress.reconstruction.expect(self.algorithm.units_per_frame()*frames);

			let tilted_axis = self.rotation.tilted_axis();
			let request = KernelRequest {
				algorithm: self.algorithm,
				sinogram: self.algorithm.sinogram(&self.sino, self.range.clone(), tilted_axis)?,
				angles: self.angles.clone(),
				scheme: scheme.clone(),
				meta: self.meta,
				tilted_axis
			};

			info!("Reconstructing {} frames with {}, scheme {}", frames, self.algorithm.name(), scheme.name);
			let (data, meta) = self.kernel.reconstruct(&request, &progress.reconstruction)
				.map_err(|e| ReelError::kernel("reconstruction", format!("{:#}", e)))?;
			if data.iter().any(|v| !v.re.is_finite() || !v.im.is_finite()) {
				return Err(ReelError::kernel("reconstruction", "object function has non-finite values").into());
			}
			Ok(CacheEntry { data, meta })
		})?;
		progress.reconstruction.advance(1);
		progress.reconstruction.complete();

		// stage 2: optional correction, then conversion to the physical quantity
		progress.set_state(State::PostProcessing);
		progress.post.expect(1);
		let mut info = entry.meta;
		let corrected = match correction {
			None => entry.data,
			Some((corrector, method)) => {
				debug!("Correcting apple core: {}", method);
				let (corrected, meta) = corrector.correct(&entry.data, method, &self.meta, &progress.post)
					.map_err(|e| ReelError::kernel("apple core correction", format!("{:#}", e)))?;
				info.extend(meta);
				info.insert("apple core correction".to_string(), format!("apple-{}", method.to_uppercase()).into());
				corrected
			}
		};
		let volume = self.algorithm.post_process(&corrected, &self.meta);
		self.algorithm.summarize(&volume, &mut info);
		progress.post.advance(1);
		progress.post.complete();

		let elapsed = started.elapsed();
		info!("Finished {} in {:.2} s", self.algorithm.name(), elapsed.as_secs_f64());

		Ok(RunOutput {
			algorithm: self.algorithm,
			scheme: scheme.name.to_string(),
			volume,
			info,
			angles: self.angles.clone(),
			range: self.range.clone(),
			elapsed
		})
	}

	/// Starts the run on a background thread.
	pub fn spawn(self: Arc<Self>, scheme: impl Into<String>, apple_core: AppleCore) -> Result<Job> {

		let scheme = scheme.into();
		let progress = Arc::new(RunProgress::default());

		let handle = thread::Builder::new()
			.name(format!("reconstruct-{}", self.algorithm.id()))
			.spawn({
				let progress = progress.clone();
				move || self.run(&scheme, apple_core, &progress)
			})
			.context("Failed to start reconstruction thread")?;

		Ok(Job {
			progress,
			handle
		})
	}
}


/// A run on a background thread.
pub struct Job {
	progress: Arc<RunProgress>,
	handle: JoinHandle<Result<RunOutput>>
}

impl Job {

	pub fn progress(&self) -> &RunProgress {
		&self.progress
	}

	/// Polls the counters until both stages finish, then joins the thread.
	///
	/// `tick` sees the counters once per poll.
	pub fn wait(self, poll_interval: Duration, mut tick: impl FnMut(&RunProgress)) -> Result<RunOutput> {

		for stage in [&self.progress.reconstruction, &self.progress.post] {
			while !stage.is_complete() && !self.handle.is_finished() {
				tick(&self.progress);
				thread::sleep(poll_interval);
			}
		}
		tick(&self.progress);

		self.handle.join()
			.map_err(|_| anyhow!(ReelError::kernel("worker", "reconstruction thread panicked")))?
	}
}
