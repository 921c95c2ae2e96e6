
// The named result of one "compute" action: optionally a refractive-index volume
// and a fluorescence volume, with everything needed to tell how they were made.

// layout, all little-endian:
//   magic "REELRSLT", version u32, name, attributes (metadata), rotation (metadata),
//   then for refractive index and fluorescence in turn: present u8, and if present:
//     metadata, angles, sinogram start u32, sinogram stop u32, volume

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use ndarray::Array3;
use num_complex::Complex64;
use tracing::info;

use crate::codec::{self, Metadata, ReadExt, WriteExt};
use crate::container;
use crate::error::ReelError;
use crate::pipeline::RunOutput;


const MAGIC: &[u8; 8] = b"REELRSLT";
const VERSION: u32 = 1;

pub const PREFIX: &str = "reconstruction_";


/// One reconstructed volume and the frames and angles it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSection {
	pub volume: Array3<Complex64>,
	/// [rad]
	pub angles: Vec<f64>,
	/// the sinogram frames used
	pub frames: Range<usize>,
	pub meta: Metadata
}

impl From<RunOutput> for VolumeSection {
	fn from(output: RunOutput) -> Self {
		Self {
			volume: output.volume,
			angles: output.angles,
			frames: output.range,
			meta: output.info
		}
	}
}


#[derive(Debug, Clone, PartialEq)]
pub struct ResultArtifact {
	pub name: String,
	/// hashes, physical parameters, scheme, timing, version
	pub attributes: Metadata,
	/// the parameters of the rotation used
	pub rotation: Metadata,
	pub refractive_index: Option<VolumeSection>,
	pub fluorescence: Option<VolumeSection>
}

impl ResultArtifact {

	/// Writes the artifact to the first free `reconstruction_<n>.reel` in the folder, counting from 1.
	pub fn write(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {

		let dir = dir.as_ref();
		let path = next_free_path(dir)?;

		let mut out = Vec::<u8>::new();
		out.write_all(MAGIC)?;
		out.write_u32::<LE>(VERSION)?;
		out.write_utf8(&self.name)?;
		out.write_metadata(&self.attributes)?;
		out.write_metadata(&self.rotation)?;
		for section in [&self.refractive_index, &self.fluorescence] {
			out.write_bool(section.is_some())?;
			if let Some(section) = section {
				out.write_metadata(&section.meta)?;
				out.write_f64s(&section.angles)?;
				out.write_len(section.frames.start)?;
				out.write_len(section.frames.end)?;
				out.write_complex_volume(&section.volume)?;
			}
		}

		codec::write_staged(&path, out)
			.context(format!("Failed to write reconstruction: {}", path.to_string_lossy()))?;
		info!("Wrote reconstruction {} to {}", self.name, path.to_string_lossy());

		Ok(path)
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let file = File::open(path)
			.context(format!("Failed to open reconstruction: {}", path.to_string_lossy()))?;
		let mut reader = BufReader::new(file);

		read(&mut reader)
			.map_err(|e| ReelError::data(format!("{}: {:#}", path.to_string_lossy(), e)).into())
	}

	/// Reads just the name, without the volumes.
	pub fn read_name(path: impl AsRef<Path>) -> Result<String> {
		let path = path.as_ref();
		let file = File::open(path)
			.context(format!("Failed to open reconstruction: {}", path.to_string_lossy()))?;
		let mut reader = BufReader::new(file);
		read_magic(&mut reader)
			.and_then(|_| reader.read_utf8())
			.map_err(|e| ReelError::data(format!("{}: {:#}", path.to_string_lossy(), e)).into())
	}
}


fn read_magic(reader: &mut impl Read) -> Result<()> {
	let mut magic = [0u8; 8];
	reader.read_exact(&mut magic)
		.context("Failed to read magic bytes")?;
	if &magic != MAGIC {
		bail!("Not a reconstruction");
	}
	let version = reader.read_u32::<LE>()?;
	if version != VERSION {
		bail!("Unsupported reconstruction version: {}", version);
	}
	Ok(())
}


fn read(reader: &mut impl Read) -> Result<ResultArtifact> {

	read_magic(reader)?;
	let name = reader.read_utf8()?;
	let attributes = reader.read_metadata()?;
	let rotation = reader.read_metadata()?;

	let mut sections = Vec::with_capacity(2);
	for label in ["refractive index", "fluorescence"] {
		let section = if reader.read_bool()? {
			let meta = reader.read_metadata()?;
			let angles = reader.read_f64s()?;
			let start = reader.read_len()?;
			let stop = reader.read_len()?;
			let volume = reader.read_complex_volume()
				.context(format!("Failed to read {} volume", label))?;
			Some(VolumeSection {
				volume,
				angles,
				frames: start .. stop,
				meta
			})
		} else {
			None
		};
		sections.push(section);
	}
	let fluorescence = sections.pop().flatten();
	let refractive_index = sections.pop().flatten();

	Ok(ResultArtifact {
		name,
		attributes,
		rotation,
		refractive_index,
		fluorescence
	})
}


fn next_free_path(dir: &Path) -> Result<PathBuf> {
	for n in 1 .. {
		let path = dir.join(format!("{}{}.{}", PREFIX, n, container::EXTENSION));
		let taken = path.try_exists()
			.context(format!("Failed to check for reconstruction: {}", path.to_string_lossy()))?
			|| codec::staging_path(&path)?.try_exists()?;
		if !taken {
			return Ok(path);
		}
	}
	bail!("No free reconstruction file name in {}", dir.to_string_lossy())
}


/// The reconstructions in a session folder as `(name, path)`, oldest first.
pub fn list(dir: impl AsRef<Path>) -> Result<Vec<(String,PathBuf)>> {

	let dir = dir.as_ref();
	let mut found = Vec::new();
	let entries = fs::read_dir(dir)
		.context(format!("Failed to list session folder: {}", dir.to_string_lossy()))?;
	for entry in entries {
		let path = entry?.path();
		let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
			continue;
		};
		if !filename.starts_with(PREFIX) || path.extension().and_then(|e| e.to_str()) != Some(container::EXTENSION) {
			continue;
		}
		let modified = fs::metadata(&path)
			.and_then(|m| m.modified())
			.context(format!("Failed to get modification time: {}", path.to_string_lossy()))?;
		let name = ResultArtifact::read_name(&path)?;
		found.push((modified, name, path));
	}

	found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));
	Ok(found.into_iter()
		.map(|(_, name, path)| (name, path))
		.collect())
}
