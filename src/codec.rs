
// Little-endian binary helpers shared by the sinogram container, cache entries, and result artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use ndarray::Array3;
use num_complex::Complex64;


/// A flat, string-keyed map of annotations attached to volumes.
pub type Metadata = BTreeMap<String,MetaValue>;


#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
	Text(String),
	Float(f64),
	Int(i64),
	Bool(bool),
	Floats(Vec<f64>)
}

impl MetaValue {
	const ID_TEXT: u8 = 1;
	const ID_FLOAT: u8 = 2;
	const ID_INT: u8 = 3;
	const ID_BOOL: u8 = 4;
	const ID_FLOATS: u8 = 5;

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Text(s) => Some(s),
			_ => None
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Float(f) => Some(*f),
			Self::Int(i) => Some(*i as f64),
			_ => None
		}
	}
}

impl fmt::Display for MetaValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Text(s) => write!(f, "{}", s),
			Self::Float(v) => write!(f, "{}", v),
			Self::Int(v) => write!(f, "{}", v),
			Self::Bool(v) => write!(f, "{}", v),
			Self::Floats(v) => write!(f, "{:?}", v)
		}
	}
}

impl From<&str> for MetaValue {
	fn from(value: &str) -> Self {
		Self::Text(value.to_string())
	}
}

impl From<String> for MetaValue {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl From<f64> for MetaValue {
	fn from(value: f64) -> Self {
		Self::Float(value)
	}
}

impl From<i64> for MetaValue {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<bool> for MetaValue {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

impl From<Vec<f64>> for MetaValue {
	fn from(value: Vec<f64>) -> Self {
		Self::Floats(value)
	}
}


pub trait WriteExt {
	fn write_bool(&mut self, b: bool) -> Result<()>;
	fn write_bytes(&mut self, bytes: impl AsRef<[u8]>) -> Result<()>;
	fn write_utf8(&mut self, s: impl AsRef<str>) -> Result<()>;
	fn write_len(&mut self, len: usize) -> Result<()>;
	fn write_f64s(&mut self, values: &[f64]) -> Result<()>;
	fn write_metadata(&mut self, meta: &Metadata) -> Result<()>;
	fn write_complex_volume(&mut self, volume: &Array3<Complex64>) -> Result<()>;
}

impl<W> WriteExt for W
	where
		W: Write
{
	fn write_bool(&mut self, b: bool) -> Result<()> {
		self.write_u8(if b { 1 } else { 0 })
			.context("Failed to write bool")
	}

	fn write_bytes(&mut self, bytes: impl AsRef<[u8]>) -> Result<()> {
		let bytes = bytes.as_ref();
		self.write_len(bytes.len())?;
		self.write_all(bytes)
			.context("Failed to write bytes")
	}

	fn write_utf8(&mut self, s: impl AsRef<str>) -> Result<()> {
		self.write_bytes(s.as_ref().as_bytes())
	}

	fn write_len(&mut self, len: usize) -> Result<()> {
		let len: u32 = len.try_into()
			.map_err(|_| anyhow!("Length too large: {}, max of {}", len, u32::MAX))?;
		self.write_u32::<LE>(len)
			.context("Failed to write length")
	}

	fn write_f64s(&mut self, values: &[f64]) -> Result<()> {
		self.write_len(values.len())?;
		for v in values {
			self.write_f64::<LE>(*v)?;
		}
		Ok(())
	}

	fn write_metadata(&mut self, meta: &Metadata) -> Result<()> {
		self.write_len(meta.len())?;
		for (key, value) in meta {
			self.write_utf8(key)?;
			match value {
				MetaValue::Text(s) => {
					self.write_u8(MetaValue::ID_TEXT)?;
					self.write_utf8(s)?;
				}
				MetaValue::Float(f) => {
					self.write_u8(MetaValue::ID_FLOAT)?;
					self.write_f64::<LE>(*f)?;
				}
				MetaValue::Int(i) => {
					self.write_u8(MetaValue::ID_INT)?;
					self.write_i64::<LE>(*i)?;
				}
				MetaValue::Bool(b) => {
					self.write_u8(MetaValue::ID_BOOL)?;
					self.write_bool(*b)?;
				}
				MetaValue::Floats(v) => {
					self.write_u8(MetaValue::ID_FLOATS)?;
					self.write_f64s(v)?;
				}
			}
		}
		Ok(())
	}

	fn write_complex_volume(&mut self, volume: &Array3<Complex64>) -> Result<()> {
		let (nz, ny, nx) = volume.dim();
		for n in [nz, ny, nx] {
			self.write_len(n)?;
		}
		// logical (row-major) order, regardless of the array's memory layout
		for v in volume.iter() {
			self.write_f64::<LE>(v.re)?;
			self.write_f64::<LE>(v.im)?;
		}
		Ok(())
	}
}


pub trait ReadExt {
	fn read_bool(&mut self) -> Result<bool>;
	fn read_bytes(&mut self) -> Result<Vec<u8>>;
	fn read_utf8(&mut self) -> Result<String>;
	fn read_len(&mut self) -> Result<usize>;
	fn read_f64s(&mut self) -> Result<Vec<f64>>;
	fn read_metadata(&mut self) -> Result<Metadata>;
	fn read_complex_volume(&mut self) -> Result<Array3<Complex64>>;
}

impl<R> ReadExt for R
	where
		R: Read
{
	fn read_bool(&mut self) -> Result<bool> {
		let i = self.read_u8()
			.context("Failed to read bool")?;
		match i {
			0 => Ok(false),
			1 => Ok(true),
			_ => bail!("Unexpected bool encoding: {}", i)
		}
	}

	fn read_bytes(&mut self) -> Result<Vec<u8>> {
		let len = self.read_len()?;
		let mut buf = vec![0u8; len];
		self.read_exact(buf.as_mut())
			.context("Failed to read bytes")?;
		Ok(buf)
	}

	fn read_utf8(&mut self) -> Result<String> {
		let bytes = self.read_bytes()?;
		String::from_utf8(bytes)
			.context("String was not UTF-8")
	}

	fn read_len(&mut self) -> Result<usize> {
		let len = self.read_u32::<LE>()
			.context("Failed to read length")?;
		Ok(len as usize)
	}

	fn read_f64s(&mut self) -> Result<Vec<f64>> {
		let len = self.read_len()?;
		let mut out = Vec::with_capacity(len.min(1 << 16));
		for _ in 0 .. len {
			out.push(self.read_f64::<LE>()?);
		}
		Ok(out)
	}

	fn read_metadata(&mut self) -> Result<Metadata> {
		let len = self.read_len()?;
		let mut meta = Metadata::new();
		for _ in 0 .. len {
			let key = self.read_utf8()?;
			let type_id = self.read_u8()
				.context("Failed to read metadata type")?;
			let value = match type_id {
				MetaValue::ID_TEXT => MetaValue::Text(self.read_utf8()?),
				MetaValue::ID_FLOAT => MetaValue::Float(self.read_f64::<LE>()?),
				MetaValue::ID_INT => MetaValue::Int(self.read_i64::<LE>()?),
				MetaValue::ID_BOOL => MetaValue::Bool(self.read_bool()?),
				MetaValue::ID_FLOATS => MetaValue::Floats(self.read_f64s()?),
				_ => bail!("Unrecognized metadata type {} for key {}", type_id, key)
			};
			meta.insert(key, value);
		}
		Ok(meta)
	}

	fn read_complex_volume(&mut self) -> Result<Array3<Complex64>> {
		let nz = self.read_len()?;
		let ny = self.read_len()?;
		let nx = self.read_len()?;
		let count = nz.checked_mul(ny)
			.and_then(|n| n.checked_mul(nx))
			.context("Volume dimensions overflow")?;
		let mut values = Vec::with_capacity(count.min(1 << 24));
		for _ in 0 .. count {
			let re = self.read_f64::<LE>()?;
			let im = self.read_f64::<LE>()?;
			values.push(Complex64::new(re, im));
		}
		Array3::from_shape_vec((nz, ny, nx), values)
			.context("Failed to shape volume")
	}
}


/// Writes a file so readers see either nothing or the complete contents.
///
/// The bytes go to a hidden sibling first, get synced, then get renamed over the destination.
pub fn write_staged(path: impl AsRef<Path>, bytes: impl AsRef<[u8]>) -> Result<()> {

	let path = path.as_ref();
	let staging = staging_path(path)?;

	let result = (|| -> Result<()> {
		let mut file = fs::File::create(&staging)
			.with_context(|| format!("Failed to create staging file: {}", staging.to_string_lossy()))?;
		file.write_all(bytes.as_ref())
			.with_context(|| format!("Failed to write staging file: {}", staging.to_string_lossy()))?;
		file.sync_all()
			.with_context(|| format!("Failed to sync staging file: {}", staging.to_string_lossy()))?;
		fs::rename(&staging, path)
			.with_context(|| format!("Failed to move {} into place", path.to_string_lossy()))
	})();

	if result.is_err() {
		// don't leave partial files behind, and keep the first error
		let _ = fs::remove_file(&staging);
	}

	result
}


pub fn staging_path(path: &Path) -> Result<PathBuf> {
	let filename = path.file_name()
		.context(format!("Path has no filename: {}", path.to_string_lossy()))?;
	Ok(path.with_file_name(format!(".{}.partial", filename.to_string_lossy())))
}


#[cfg(test)]
mod test {

	use std::io::Cursor;

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn metadata() {

		let mut meta = Metadata::new();
		meta.insert("library".to_string(), "ODTbrain".into());
		meta.insert("kw padfac".to_string(), 1.75f64.into());
		meta.insert("kw intp_order".to_string(), 1i64.into());
		meta.insert("kw onlyreal".to_string(), true.into());
		meta.insert("kw padding".to_string(), vec![1.0, 0.0].into());

		let mut buf = Vec::<u8>::new();
		buf.write_metadata(&meta)
			.expect("Failed to write");
		let meta2 = Cursor::new(buf).read_metadata()
			.expect("Failed to read");

		assert_that!(&meta2, eq(meta));
	}

	#[test]
	fn truncated_volume() {

		let volume = Array3::<Complex64>::zeros((2, 3, 4));
		let mut buf = Vec::<u8>::new();
		buf.write_complex_volume(&volume)
			.expect("Failed to write");
		buf.truncate(buf.len() - 3);

		assert_that!(&Cursor::new(buf).read_complex_volume().is_err(), eq(true));
	}
}
