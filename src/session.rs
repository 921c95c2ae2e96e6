
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::algorithm::{Algorithm, AppleCore, Corrector, Kernel, STANDARD};
use crate::artifact::{self, ResultArtifact, VolumeSection};
use crate::cache::ReconstructionCache;
use crate::codec::Metadata;
use crate::config::SessionConfig;
use crate::container;
use crate::error::ReelError;
use crate::modality::Modality;
use crate::pipeline::{ReconstructionPipeline, RunOutput, RunProgress};
use crate::progress::ProgressSink;
use crate::rotation::RotationRegistry;
use crate::sino::SinogramView;


pub const RAW_SINOGRAM: &str = "Raw Sinogram";
const SINOGRAM_STEM: &str = "sinogram";


/// The external computations a session delegates to.
#[derive(Clone)]
pub struct Kernels {
	pub refractive_index: Arc<dyn Kernel>,
	pub fluorescence: Arc<dyn Kernel>,
	pub corrector: Option<Arc<dyn Corrector>>
}


/// Everything the user picks for one "compute" action.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRequest {
	/// name of the result
	pub name: String,
	/// name of the sinogram, see [Session::sinograms]
	pub sinogram: String,
	pub rotation: String,
	/// refractive index algorithm, fluorescence always uses its only one
	pub algorithm: Algorithm,
	pub scheme: String,
	pub apple_core: AppleCore
}


/// A session folder: sinograms, rotations, cache, and reconstructions.
pub struct Session {
	dir: PathBuf,
	config: SessionConfig,
	registry: RotationRegistry,
	cache: Arc<ReconstructionCache>
}

impl Session {

	pub fn open(dir: impl AsRef<Path>) -> Result<Self> {

		let dir = dir.as_ref().to_path_buf();
		let is_dir = fs::metadata(&dir)
			.map(|m| m.is_dir())
			.context(format!("Failed to open session folder: {}", dir.to_string_lossy()))?;
		if !is_dir {
			return Err(ReelError::config(format!("Session path is not a folder: {}", dir.to_string_lossy())).into());
		}

		let config = SessionConfig::read(&dir)?;
		let registry = RotationRegistry::open(&dir)?;
		let cache = ReconstructionCache::open(config.cache_dir(&dir))?;
		debug!("Opened session {}", dir.to_string_lossy());

		Ok(Self {
			dir,
			config,
			registry,
			cache: Arc::new(cache)
		})
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn config(&self) -> &SessionConfig {
		&self.config
	}

	pub fn registry(&self) -> &RotationRegistry {
		&self.registry
	}

	pub fn registry_mut(&mut self) -> &mut RotationRegistry {
		&mut self.registry
	}

	pub fn cache(&self) -> &Arc<ReconstructionCache> {
		&self.cache
	}

	/// The raw sinogram, then derived `sinogram_<name>` sinograms, oldest first.
	pub fn sinograms(&self) -> Result<Vec<(String,PathBuf)>> {

		let mut out = vec![(
			RAW_SINOGRAM.to_string(),
			self.dir.join(format!("{}.{}", SINOGRAM_STEM, container::EXTENSION))
		)];

		let prefix = format!("{}_", SINOGRAM_STEM);
		let mut derived = Vec::new();
		let entries = fs::read_dir(&self.dir)
			.context(format!("Failed to list session folder: {}", self.dir.to_string_lossy()))?;
		for entry in entries {
			let path = entry?.path();
			if path.extension().and_then(|e| e.to_str()) != Some(container::EXTENSION) {
				continue;
			}
			let Some(name) = path.file_stem()
				.and_then(|s| s.to_str())
				.and_then(|s| s.strip_prefix(&prefix))
				.map(|s| s.to_string())
				else { continue; };
			let modified = fs::metadata(&path)
				.and_then(|m| m.modified())
				.context(format!("Failed to get modification time: {}", path.to_string_lossy()))?;
			derived.push((modified, name, path));
		}
		derived.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

		out.extend(derived.into_iter().map(|(_, name, path)| (name, path)));
		Ok(out)
	}

	pub fn sinogram_path(&self, name: &str) -> Result<PathBuf> {
		self.sinograms()?
			.into_iter()
			.find(|(n, _)| n == name)
			.map(|(_, path)| path)
			.ok_or_else(|| ReelError::config(format!("Unknown sinogram: {}", name)).into())
	}

	pub fn load_sinogram(&self, name: &str, progress: &dyn ProgressSink) -> Result<SinogramView> {
		SinogramView::load_with_progress(self.sinogram_path(name)?, progress)
	}

	/// `(name, path)` of the finished reconstructions, oldest first.
	pub fn reconstructions(&self) -> Result<Vec<(String,PathBuf)>> {
		artifact::list(&self.dir)
	}

	fn pipeline(&self, algorithm: Algorithm, sino: &Arc<SinogramView>, rotation: &str, kernels: &Kernels) -> Result<ReconstructionPipeline> {
		let kernel = if algorithm.modality().is_qpi() {
			kernels.refractive_index.clone()
		} else {
			kernels.fluorescence.clone()
		};
		let pipeline = ReconstructionPipeline::new(
			algorithm,
			sino.clone(),
			&self.registry,
			rotation,
			self.cache.clone(),
			self.config.cache.hash_prefix,
			kernel
		)?;
		Ok(match &kernels.corrector {
			Some(corrector) => pipeline.with_corrector(corrector.clone()),
			None => pipeline
		})
	}

	fn run(&self, pipeline: ReconstructionPipeline, scheme: &str, apple_core: AppleCore, tick: &mut impl FnMut(Algorithm, &RunProgress)) -> Result<RunOutput> {
		let algorithm = pipeline.algorithm();
		let job = Arc::new(pipeline).spawn(scheme, apple_core)?;
		job.wait(self.config.progress.poll_interval, |progress| tick(algorithm, progress))
	}

	/// Reconstructs fluorescence and refractive index, whichever the sinogram has, and writes the result.
	///
	/// Each reconstruction runs on a background thread while this one polls its progress.
	#[tracing::instrument(skip_all, level = 5, name = "Compute")]
	pub fn compute(&self, request: &ComputeRequest, kernels: &Kernels, mut tick: impl FnMut(Algorithm, &RunProgress)) -> Result<PathBuf> {

		// check the request before loading anything
		if !Algorithm::REFRACTIVE_INDEX.contains(&request.algorithm) {
			return Err(ReelError::config(format!("{} is not a refractive index algorithm", request.algorithm)).into());
		}
		request.algorithm.scheme(&request.scheme)?;
		let rotation = self.registry.rotation(&request.rotation)?.clone();

		let started = Instant::now();
		let sino = Arc::new(SinogramView::load(self.sinogram_path(&request.sinogram)?)?);

		let mut fluorescence = None;
		if sino.has_fli() {
			let pipeline = self.pipeline(Algorithm::FlBpj, &sino, &request.rotation, kernels)?;
			let output = self.run(pipeline, STANDARD, AppleCore::Keep, &mut tick)
				.context("Fluorescence reconstruction failed")?;
			fluorescence = Some(VolumeSection::from(output));
		}

		let mut refractive_index = None;
		if sino.has_qpi() {
			let pipeline = self.pipeline(request.algorithm, &sino, &request.rotation, kernels)?;
			let output = self.run(pipeline, &request.scheme, request.apple_core, &mut tick)
				.context("Refractive index reconstruction failed")?;
			refractive_index = Some(VolumeSection::from(output));
		}

		let meta = if sino.has_qpi() {
			sino.get_meta(Modality::Phase)?
		} else {
			sino.get_meta(Modality::Fluorescence)?
		};

		let mut attributes = Metadata::new();
		attributes.insert("sinogram hash".to_string(), sino.get_hash()?.into());
		attributes.insert("rotation hash".to_string(), self.registry.get_hash(&request.rotation)?.into());
		attributes.insert("wavelength".to_string(), meta.wavelength.into());
		attributes.insert("pixel size".to_string(), meta.pixel_size.into());
		attributes.insert("medium index".to_string(), meta.medium_index.into());
		attributes.insert("reconstruction scheme".to_string(), request.scheme.clone().into());
		attributes.insert("reconstruction time".to_string(), started.elapsed().as_secs_f64().into());
		attributes.insert("sinoreel version".to_string(), env!("CARGO_PKG_VERSION").into());

		let mut rotation_meta = Metadata::new();
		rotation_meta.insert("Start".to_string(), rotation.start.into());
		rotation_meta.insert("End".to_string(), rotation.end.into());
		rotation_meta.insert("Roll".to_string(), rotation.roll.into());
		rotation_meta.insert("Spacing".to_string(), String::from(rotation.spacing.clone()).into());

		let artifact = ResultArtifact {
			name: request.name.clone(),
			attributes,
			rotation: rotation_meta,
			refractive_index,
			fluorescence
		};
		let path = artifact.write(&self.dir)?;
		info!("Computed {} in {:.2} s", request.name, started.elapsed().as_secs_f64());

		Ok(path)
	}
}
