
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::angles;
use crate::codec;
use crate::digest::FieldHasher;
use crate::error::ReelError;
use crate::logging::ResultExt;
use crate::modality::Modality;
use crate::sino::SinogramView;


pub const ROTATIONS_FILENAME: &str = "rotations.json";
pub const SPACINGS_FILENAME: &str = "spacings.json";

/// how uniform spacing is spelled in the rotation store
pub const UNIFORM: &str = "2PI uniform";


/// How angles are distributed over a rotation's time interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Spacing {
	/// one full turn, spread evenly over time
	Uniform,
	/// angles from a named spacing calibration
	Calibration(String)
}

impl From<String> for Spacing {
	fn from(value: String) -> Self {
		if value == UNIFORM {
			Self::Uniform
		} else {
			Self::Calibration(value)
		}
	}
}

impl From<Spacing> for String {
	fn from(value: Spacing) -> Self {
		match value {
			Spacing::Uniform => UNIFORM.to_string(),
			Spacing::Calibration(name) => name
		}
	}
}


/// A named description of one sample rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationConfiguration {
	/// [s]
	#[serde(rename = "Start")]
	pub start: f64,
	/// [s]
	#[serde(rename = "End")]
	pub end: f64,
	/// tilt of the rotation axis [deg]
	#[serde(rename = "Roll")]
	pub roll: f64,
	#[serde(rename = "Spacing")]
	pub spacing: Spacing
}

impl RotationConfiguration {

	pub fn uniform(start: f64, end: f64) -> Self {
		Self {
			start,
			end,
			roll: 0.0,
			spacing: Spacing::Uniform
		}
	}

	/// unit vector of the rotation axis, for a roll around the optical axis
	pub fn tilted_axis(&self) -> [f64; 3] {
		let roll = self.roll.to_radians();
		[roll.cos(), -roll.sin(), 0.0]
	}

	fn validate(&self) -> Result<()> {
		if !self.start.is_finite() || !self.end.is_finite() || !self.roll.is_finite() {
			return Err(ReelError::config(format!("Rotation parameters must be finite: {:?}", self)).into());
		}
		if self.start >= self.end {
			return Err(ReelError::config(format!(
				"Rotation must start before it ends: Start={}, End={}", self.start, self.end
			)).into());
		}
		Ok(())
	}
}


/// Calibration points picked by the user, and how to fit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpacingCalibration {
	/// (intensity, time [s])
	pub points: Vec<(f64,f64)>,
	/// [s]
	pub period: f64,
	pub num_skw: usize,
	/// starting offset for the fit, or the mean intensity if absent
	pub y0: Option<f64>,
	/// the time the calibration points are measured from [s]
	pub t0: f64,
	/// [s]
	pub t_start: f64,
	/// [s]
	pub t_end: f64,
	/// index of the slice the points were picked on
	pub user_slice: usize,
	/// modality the points were picked on
	pub user_mode: Modality
}

impl SpacingCalibration {

	fn validate(&self) -> Result<()> {
		if !(self.period > 0.0) || !self.period.is_finite() {
			return Err(ReelError::config(format!("Calibration period must be positive, not {}", self.period)).into());
		}
		if !(self.t_start < self.t_end) {
			return Err(ReelError::config(format!(
				"Calibration window must start before it ends: t_start={}, t_end={}", self.t_start, self.t_end
			)).into());
		}
		Ok(())
	}

	/// Folds the calibration content into a digest, fields in name order.
	fn hash_into(&self, hasher: &mut FieldHasher) {
		hasher
			.field("num_skw", &self.num_skw)
			.field("period", &self.period)
			.field("points", &self.points)
			.field("t0", &self.t0)
			.field("t_end", &self.t_end)
			.field("t_start", &self.t_start)
			.field("user_mode", &self.user_mode.name().to_string())
			.field("user_slice", &self.user_slice)
			.field("y0", &self.y0);
	}
}


/// The rotation configurations and spacing calibrations of a session.
///
/// Both stores are read whole on open and written whole on save.
#[derive(Debug, Clone)]
pub struct RotationRegistry {
	dir: PathBuf,
	rotations: BTreeMap<String,RotationConfiguration>,
	calibrations: BTreeMap<String,SpacingCalibration>
}

impl RotationRegistry {

	pub fn open(session_dir: impl AsRef<Path>) -> Result<Self> {

		let dir = session_dir.as_ref().to_path_buf();
		let rotations = read_store(&dir.join(ROTATIONS_FILENAME))?;
		let calibrations = read_store(&dir.join(SPACINGS_FILENAME))?;

		let registry = Self {
			dir,
			rotations,
			calibrations
		};
		registry.check()?;
		debug!("Opened rotation registry with {} rotations, {} calibrations",
			registry.rotations.len(), registry.calibrations.len());

		Ok(registry)
	}

	/// Holds stored records to the same rules as the setters, including calibration references.
	fn check(&self) -> Result<()> {

		for (name, calibration) in &self.calibrations {
			if name == UNIFORM {
				return Err(ReelError::config(format!("Calibration name is reserved: {}", name)).into());
			}
			calibration.validate()
				.with_context(|| format!("Invalid stored calibration: {}", name))?;
		}

		for (name, rotation) in &self.rotations {
			rotation.validate()
				.with_context(|| format!("Invalid stored rotation: {}", name))?;
			if let Spacing::Calibration(calibration) = &rotation.spacing {
				self.calibration(calibration)
					.with_context(|| format!("Stored rotation {} refers to a missing calibration", name))?;
			}
		}

		Ok(())
	}

	pub fn rotations(&self) -> &BTreeMap<String,RotationConfiguration> {
		&self.rotations
	}

	pub fn rotation(&self, name: &str) -> Result<&RotationConfiguration> {
		self.rotations.get(name)
			.ok_or_else(|| ReelError::config(format!("Unknown rotation: {}", name)).into())
	}

	pub fn set_rotation(&mut self, name: impl Into<String>, rotation: RotationConfiguration) -> Result<()> {
		rotation.validate()?;
		if let Spacing::Calibration(calibration) = &rotation.spacing {
			self.calibration(calibration)?;
		}
		self.rotations.insert(name.into(), rotation);
		Ok(())
	}

	pub fn remove_rotation(&mut self, name: &str) -> Option<RotationConfiguration> {
		self.rotations.remove(name)
	}

	pub fn calibrations(&self) -> &BTreeMap<String,SpacingCalibration> {
		&self.calibrations
	}

	pub fn calibration(&self, name: &str) -> Result<&SpacingCalibration> {
		self.calibrations.get(name)
			.ok_or_else(|| ReelError::config(format!("Unknown spacing calibration: {}", name)).into())
	}

	pub fn set_calibration(&mut self, name: impl Into<String>, calibration: SpacingCalibration) -> Result<()> {
		let name = name.into();
		if name == UNIFORM {
			return Err(ReelError::config(format!("Calibration name is reserved: {}", name)).into());
		}
		calibration.validate()?;
		self.calibrations.insert(name, calibration);
		Ok(())
	}

	/// Removes a calibration, unless a rotation still uses it.
	pub fn remove_calibration(&mut self, name: &str) -> Result<Option<SpacingCalibration>> {
		let users = self.rotations.iter()
			.filter(|(_, r)| r.spacing == Spacing::Calibration(name.to_string()))
			.map(|(n, _)| n.as_str())
			.collect::<Vec<_>>();
		if !users.is_empty() {
			return Err(ReelError::config(format!("Calibration {} is used by rotations: {}", name, users.join(", "))).into());
		}
		Ok(self.calibrations.remove(name))
	}

	/// Replaces both stores on disk with the current state.
	///
	/// Each store is replaced atomically, but not both at once. Calibrations are written first,
	/// including any the old rotation store may still use, so whichever rotation store is on disk
	/// after an interruption only refers to calibrations that exist. Removed calibrations are dropped
	/// from the spacings store last.
	pub fn save(&self) -> Result<()> {

		let spacings_path = self.dir.join(SPACINGS_FILENAME);

		let mut superset = read_store::<SpacingCalibration>(&spacings_path)
			.context("Failed to read the saved calibrations, overwriting them")
			.warn_err()
			.unwrap_or_default();
		superset.retain(|name, _| !self.calibrations.contains_key(name));
		let removed = superset.len();
		superset.extend(self.calibrations.iter().map(|(k, v)| (k.clone(), v.clone())));

		write_store(&spacings_path, &superset)?;
		write_store(&self.dir.join(ROTATIONS_FILENAME), &self.rotations)?;
		if removed > 0 {
			write_store(&spacings_path, &self.calibrations)?;
			debug!("Dropped {} calibrations from the spacings store", removed);
		}

		info!("Saved {} rotations and {} calibrations", self.rotations.len(), self.calibrations.len());
		Ok(())
	}

	/// A digest of everything that determines the rotation's angles.
	///
	/// A calibration contributes its content, not its name.
	pub fn get_hash(&self, name: &str) -> Result<String> {

		let rotation = self.rotation(name)?;

		let mut hasher = FieldHasher::new();
		hasher
			.field("Start", &rotation.start)
			.field("End", &rotation.end)
			.field("Roll", &rotation.roll);
		match &rotation.spacing {
			Spacing::Uniform => {
				hasher.field("Spacing", &UNIFORM.to_string());
			}
			Spacing::Calibration(calibration) => {
				self.calibration(calibration)?
					.hash_into(&mut hasher);
			}
		}

		Ok(hasher.finish())
	}

	/// Angles [rad] for the frames of `sino` within the rotation, and which frames those are.
	pub fn compute_angles(&self, name: &str, sino: &SinogramView, modality: Modality) -> Result<(Vec<f64>,Range<usize>)> {

		let rotation = self.rotation(name)?;
		rotation.validate()?;
		let range = sino.get_time_slice(rotation.start, rotation.end, modality)?;

		let angles = match &rotation.spacing {

			Spacing::Uniform => {
				// use the exact interval bounds rather than the nearest frames
				let duration = rotation.end - rotation.start;
				sino.get_times(modality)?[range.clone()]
					.iter()
					.map(|t| (t - rotation.start)/duration*2.0*PI)
					.collect::<Vec<_>>()
			}

			Spacing::Calibration(calibration_name) => {
				let calibration = self.calibration(calibration_name)?;

				// align all modalities to the first phase angle, when there is phase data
				let reference_mode = if sino.has_qpi() {
					Modality::Phase
				} else {
					modality
				};
				let reference = angles::compute_angles_from_spacing(calibration, sino, reference_mode)
					.with_context(|| format!("Failed to compute reference angles for calibration {}", calibration_name))?;
				let Some(first) = reference.first().copied() else {
					return Err(ReelError::data(format!(
						"Calibration {} window has no {} frames", calibration_name, reference_mode
					)).into());
				};

				let angles = angles::compute_angles_from_spacing(calibration, sino, modality)
					.with_context(|| format!("Failed to compute angles for calibration {}", calibration_name))?;
				if angles.len() != range.len() {
					return Err(ReelError::config(format!(
						"Calibration {} covers {} frames but rotation {} covers {}",
						calibration_name, angles.len(), name, range.len()
					)).into());
				}
				angles.into_iter()
					.map(|a| a - first)
					.collect()
			}
		};

		Ok((angles, range))
	}
}


fn read_store<T>(path: &Path) -> Result<BTreeMap<String,T>>
	where
		T: DeserializeOwned
{
	let exists = path.try_exists()
		.with_context(|| format!("Failed to check for store at: {}", path.to_string_lossy()))?;
	if !exists {
		return Ok(BTreeMap::new());
	}

	let json = fs::read_to_string(path)
		.with_context(|| format!("Failed to read store at: {}", path.to_string_lossy()))?;
	serde_json::from_str(&json)
		.map_err(|e| ReelError::config(format!("Malformed store {}: {}", path.to_string_lossy(), e)).into())
}


fn write_store<T>(path: &Path, store: &BTreeMap<String,T>) -> Result<()>
	where
		T: Serialize
{
	let json = serde_json::to_vec_pretty(store)
		.with_context(|| format!("Failed to serialize store: {}", path.to_string_lossy()))?;
	codec::write_staged(path, json)
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn spacing_names() {
		let json = serde_json::to_string(&RotationConfiguration::uniform(0.0, 1.5))
			.expect("Failed to serialize");
		assert_that!(&json.as_str(), eq(r#"{"Start":0.0,"End":1.5,"Roll":0.0,"Spacing":"2PI uniform"}"#));

		let rotation = serde_json::from_str::<RotationConfiguration>(r#"{"Start":0,"End":2,"Roll":5,"Spacing":"cal"}"#)
			.expect("Failed to deserialize");
		assert_that!(&rotation.spacing, eq(Spacing::Calibration("cal".to_string())));
	}

	#[test]
	fn tilted_axis() {
		let mut rotation = RotationConfiguration::uniform(0.0, 1.0);
		assert_that!(&rotation.tilted_axis(), eq([1.0, -0.0, 0.0]));

		rotation.roll = 90.0;
		let axis = rotation.tilted_axis();
		assert_that!(&(axis[0].abs() < 1e-12), eq(true));
		assert_that!(&axis[1], eq(-1.0));
	}
}
