
// The sinogram container: one file holding an optional quantitative phase imaging (QPI) series
// (phase + amplitude per frame) and an optional fluorescence series.

// layout, all little-endian:
//   magic "SINOREEL", version u32, has_qpi u8, has_fl u8
//   for each present series (QPI first): frames u32, ny u32, nx u32,
//     wavelength f64 [m], pixel size f64 [m], medium index f64
//   QPI frames: time f64 [s], phase f32 * ny*nx, amplitude f32 * ny*nx
//   FL frames: time f64 [s], intensity f32 * ny*nx

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use ndarray::{Array3, Axis};

use crate::codec::{self, ReadExt, WriteExt};
use crate::error::ReelError;


pub const MAGIC: &[u8; 8] = b"SINOREEL";
pub const VERSION: u32 = 1;

/// file extension of sinograms and result artifacts
pub const EXTENSION: &str = "reel";


/// Physical acquisition parameters shared by every frame of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesMeta {
	/// [m]
	pub wavelength: f64,
	/// [m]
	pub pixel_size: f64,
	pub medium_index: f64
}

impl SeriesMeta {

	/// wavelength in pixels
	pub fn resolution(&self) -> f64 {
		self.wavelength/self.pixel_size
	}
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesHeader {
	pub frames: usize,
	pub ny: usize,
	pub nx: usize
}


#[derive(Debug, Clone, PartialEq)]
pub struct QpiSeries {
	pub meta: SeriesMeta,
	pub times: Vec<f64>,
	/// (frames, ny, nx)
	pub phase: Array3<f32>,
	/// (frames, ny, nx)
	pub amplitude: Array3<f32>
}


#[derive(Debug, Clone, PartialEq)]
pub struct FlSeries {
	pub meta: SeriesMeta,
	pub times: Vec<f64>,
	/// (frames, ny, nx)
	pub intensity: Array3<f32>
}


#[derive(Debug, Clone, PartialEq, Default)]
pub struct SinogramFile {
	pub qpi: Option<QpiSeries>,
	pub fl: Option<FlSeries>
}


/// Describes the series in a container without reading any frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerHeader {
	pub qpi: Option<(SeriesHeader,SeriesMeta)>,
	pub fl: Option<(SeriesHeader,SeriesMeta)>
}


impl ContainerHeader {

	/// magic, version, and the two series flags
	const PREAMBLE_BYTES: u64 = 8 + 4 + 1 + 1;
	/// frames, ny, nx, then three f64 of metadata
	const SERIES_BYTES: u64 = 3*4 + 3*8;

	/// Total size in bytes of a container with this header, or None if it doesn't fit in a u64.
	pub fn file_size(&self) -> Option<u64> {

		fn series(dims: &SeriesHeader, planes: u64) -> Option<u64> {
			let plane = (dims.ny as u64)
				.checked_mul(dims.nx as u64)?
				.checked_mul(4)?;
			let frame = plane
				.checked_mul(planes)?
				.checked_add(8)?;
			frame
				.checked_mul(dims.frames as u64)?
				.checked_add(ContainerHeader::SERIES_BYTES)
		}

		let mut size = Self::PREAMBLE_BYTES;
		if let Some((dims, _)) = &self.qpi {
			size = size.checked_add(series(dims, 2)?)?;
		}
		if let Some((dims, _)) = &self.fl {
			size = size.checked_add(series(dims, 1)?)?;
		}
		Some(size)
	}
}


impl SinogramFile {

	pub fn read_header(path: impl AsRef<Path>) -> Result<ContainerHeader> {
		let path = path.as_ref();
		let mut reader = open(path)?;
		read_header(&mut reader)
			.map_err(|e| integrity(path, e))
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		Self::read_with_progress(path, |_| {})
	}

	/// Reads the whole container, reporting one unit per plane read (two per QPI frame, one per FL frame).
	pub fn read_with_progress(path: impl AsRef<Path>, mut tick: impl FnMut(u32)) -> Result<Self> {

		let path = path.as_ref();
		let mut reader = open(path)?;

		let result = (|| -> Result<SinogramFile> {

			let header = read_header(&mut reader)?;

			// check the sizes against the file before allocating anything
			let len = reader.get_ref().metadata()
				.context("Failed to read sinogram size")?
				.len();
			match header.file_size() {
				Some(expected) if expected == len => (),
				Some(expected) => bail!("Header describes {} bytes, but the file has {}", expected, len),
				None => bail!("Header describes an impossibly large file")
			}

			let qpi = match header.qpi {
				Some((dims, meta)) => {
					let mut times = Vec::with_capacity(dims.frames);
					let mut phase = Array3::<f32>::zeros((dims.frames, dims.ny, dims.nx));
					let mut amplitude = Array3::<f32>::zeros((dims.frames, dims.ny, dims.nx));
					for i in 0 .. dims.frames {
						times.push(reader.read_f64::<LE>()
							.context(format!("Failed to read time of QPI frame {}", i))?);
						read_plane(&mut reader, &mut phase, i)
							.context(format!("Failed to read phase of frame {}", i))?;
						read_plane(&mut reader, &mut amplitude, i)
							.context(format!("Failed to read amplitude of frame {}", i))?;
						tick(2);
					}
					Some(QpiSeries { meta, times, phase, amplitude })
				}
				None => None
			};

			let fl = match header.fl {
				Some((dims, meta)) => {
					let mut times = Vec::with_capacity(dims.frames);
					let mut intensity = Array3::<f32>::zeros((dims.frames, dims.ny, dims.nx));
					for i in 0 .. dims.frames {
						times.push(reader.read_f64::<LE>()
							.context(format!("Failed to read time of fluorescence frame {}", i))?);
						read_plane(&mut reader, &mut intensity, i)
							.context(format!("Failed to read fluorescence frame {}", i))?;
						tick(1);
					}
					Some(FlSeries { meta, times, intensity })
				}
				None => None
			};

			// anything left over means the header lied about the sizes
			let mut extra = [0u8; 1];
			if reader.read(&mut extra)? > 0 {
				bail!("Unexpected trailing bytes after the last frame");
			}

			Ok(SinogramFile { qpi, fl })
		})();

		result.map_err(|e| integrity(path, e))
	}

	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {

		let path = path.as_ref();

		let qpi_dims = match &self.qpi {
			Some(qpi) => {
				let dims = check_series("QPI", &qpi.times, &qpi.phase)?;
				if qpi.amplitude.dim() != qpi.phase.dim() {
					return Err(ReelError::data(format!(
						"Amplitude shape {:?} doesn't match phase shape {:?}",
						qpi.amplitude.dim(), qpi.phase.dim()
					)).into());
				}
				Some(dims)
			}
			None => None
		};
		let fl_dims = match &self.fl {
			Some(fl) => Some(check_series("fluorescence", &fl.times, &fl.intensity)?),
			None => None
		};

		let mut out = Vec::<u8>::new();
		out.write_all(MAGIC)?;
		out.write_u32::<LE>(VERSION)?;
		out.write_bool(self.qpi.is_some())?;
		out.write_bool(self.fl.is_some())?;
		if let (Some(qpi), Some(dims)) = (&self.qpi, qpi_dims) {
			write_series_header(&mut out, dims, &qpi.meta)?;
		}
		if let (Some(fl), Some(dims)) = (&self.fl, fl_dims) {
			write_series_header(&mut out, dims, &fl.meta)?;
		}

		if let Some(qpi) = &self.qpi {
			for (i, time) in qpi.times.iter().enumerate() {
				out.write_f64::<LE>(*time)?;
				write_plane(&mut out, &qpi.phase, i)?;
				write_plane(&mut out, &qpi.amplitude, i)?;
			}
		}
		if let Some(fl) = &self.fl {
			for (i, time) in fl.times.iter().enumerate() {
				out.write_f64::<LE>(*time)?;
				write_plane(&mut out, &fl.intensity, i)?;
			}
		}

		codec::write_staged(path, out)
			.context(format!("Failed to write sinogram: {}", path.to_string_lossy()))
	}
}


fn open(path: &Path) -> Result<BufReader<File>> {
	let file = File::open(path)
		.context(format!("Failed to open sinogram: {}", path.to_string_lossy()))?;
	Ok(BufReader::new(file))
}


/// Everything that goes wrong after the file opens is a problem with the data, not the disk.
fn integrity(path: &Path, e: anyhow::Error) -> anyhow::Error {
	if crate::error::categorize(&e).is_some() {
		return e;
	}
	let msg = format!("{}: {:#}", path.to_string_lossy(), e);
	anyhow::Error::new(ReelError::data(msg))
}


fn read_header(reader: &mut impl Read) -> Result<ContainerHeader> {

	let mut magic = [0u8; 8];
	reader.read_exact(&mut magic)
		.context("Failed to read magic bytes")?;
	if &magic != MAGIC {
		bail!("Not a sinogram container");
	}

	let version = reader.read_u32::<LE>()
		.context("Failed to read version")?;
	if version != VERSION {
		bail!("Unsupported container version: {}", version);
	}

	let has_qpi = reader.read_bool()?;
	let has_fl = reader.read_bool()?;
	if !has_qpi && !has_fl {
		bail!("Container holds neither QPI nor fluorescence data");
	}

	let qpi = if has_qpi {
		Some(read_series_header(reader, "QPI")?)
	} else {
		None
	};
	let fl = if has_fl {
		Some(read_series_header(reader, "fluorescence")?)
	} else {
		None
	};

	Ok(ContainerHeader { qpi, fl })
}


fn read_series_header(reader: &mut impl Read, label: &str) -> Result<(SeriesHeader,SeriesMeta)> {

	let frames = reader.read_len()?;
	let ny = reader.read_len()?;
	let nx = reader.read_len()?;
	if frames == 0 || ny == 0 || nx == 0 {
		bail!("Empty {} series: {} frames of {}x{}", label, frames, ny, nx);
	}

	let meta = SeriesMeta {
		wavelength: reader.read_f64::<LE>()?,
		pixel_size: reader.read_f64::<LE>()?,
		medium_index: reader.read_f64::<LE>()?
	};

	Ok((SeriesHeader { frames, ny, nx }, meta))
}


fn write_series_header(out: &mut Vec<u8>, dims: SeriesHeader, meta: &SeriesMeta) -> Result<()> {
	out.write_len(dims.frames)?;
	out.write_len(dims.ny)?;
	out.write_len(dims.nx)?;
	out.write_f64::<LE>(meta.wavelength)?;
	out.write_f64::<LE>(meta.pixel_size)?;
	out.write_f64::<LE>(meta.medium_index)?;
	Ok(())
}


fn check_series(label: &str, times: &[f64], data: &Array3<f32>) -> Result<SeriesHeader> {
	let (frames, ny, nx) = data.dim();
	if frames == 0 || ny == 0 || nx == 0 {
		return Err(ReelError::data(format!("Empty {} series", label)).into());
	}
	if times.len() != frames {
		return Err(ReelError::data(format!(
			"{} series has {} frames but {} times", label, frames, times.len()
		)).into());
	}
	Ok(SeriesHeader { frames, ny, nx })
}


fn read_plane(reader: &mut impl Read, stack: &mut Array3<f32>, i: usize) -> Result<()> {
	let (_, ny, nx) = stack.dim();
	let mut buf = vec![0f32; ny*nx];
	reader.read_f32_into::<LE>(&mut buf)?;
	let mut plane = stack.index_axis_mut(Axis(0), i);
	for (dst, src) in plane.iter_mut().zip(buf) {
		*dst = src;
	}
	Ok(())
}


fn write_plane(out: &mut Vec<u8>, stack: &Array3<f32>, i: usize) -> Result<()> {
	for v in stack.index_axis(Axis(0), i).iter() {
		out.write_f32::<LE>(*v)?;
	}
	Ok(())
}
