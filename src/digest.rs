
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use byteorder::{WriteBytesExt, LE};
use sha2::{Digest, Sha256};


/// files are hashed in chunks of this many bytes
const CHUNK_SIZE: usize = 64*1024;


/// SHA-256 of a whole file, as lowercase hex.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {

	let path = path.as_ref();
	let mut file = File::open(path)
		.context(format!("Failed to open file for hashing: {}", path.to_string_lossy()))?;

	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; CHUNK_SIZE];
	loop {
		let size = file.read(&mut buf)
			.context(format!("Failed to read file for hashing: {}", path.to_string_lossy()))?;
		if size == 0 {
			break;
		}
		hasher.update(&buf[.. size]);
	}

	Ok(format!("{:x}", hasher.finalize()))
}


pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> [u8; 32] {
	Sha256::digest(bytes.as_ref()).into()
}


/// Builds a digest over named fields.
///
/// Every field is written as its length-prefixed name followed by its length-prefixed value,
/// so adjacent values can't run together and collide.
pub struct FieldHasher {
	hasher: Sha256
}

impl FieldHasher {

	pub fn new() -> Self {
		Self {
			hasher: Sha256::new()
		}
	}

	fn chunk(&mut self, bytes: &[u8]) {
		let mut len = Vec::with_capacity(8);
		// writing to a Vec can't fail
		let _ = len.write_u64::<LE>(bytes.len() as u64);
		self.hasher.update(&len);
		self.hasher.update(bytes);
	}

	pub fn field(&mut self, name: &str, value: &impl CanonicalBytes) -> &mut Self {
		self.chunk(name.as_bytes());
		self.chunk(&value.canonical_bytes());
		self
	}

	pub fn finish(self) -> String {
		format!("{:x}", self.hasher.finalize())
	}
}


/// A stable byte representation used for content hashing.
pub trait CanonicalBytes {
	fn canonical_bytes(&self) -> Vec<u8>;
}

impl CanonicalBytes for f64 {
	fn canonical_bytes(&self) -> Vec<u8> {
		// collapse -0 into 0 so equal values always hash equally
		let v = if *self == 0.0 { 0.0 } else { *self };
		v.to_bits().to_le_bytes().to_vec()
	}
}

impl CanonicalBytes for u32 {
	fn canonical_bytes(&self) -> Vec<u8> {
		self.to_le_bytes().to_vec()
	}
}

impl CanonicalBytes for usize {
	fn canonical_bytes(&self) -> Vec<u8> {
		(*self as u64).to_le_bytes().to_vec()
	}
}

impl CanonicalBytes for str {
	fn canonical_bytes(&self) -> Vec<u8> {
		self.as_bytes().to_vec()
	}
}

impl CanonicalBytes for String {
	fn canonical_bytes(&self) -> Vec<u8> {
		self.as_bytes().to_vec()
	}
}

impl<T> CanonicalBytes for Option<T>
	where
		T: CanonicalBytes
{
	fn canonical_bytes(&self) -> Vec<u8> {
		match self {
			None => vec![0],
			Some(v) => {
				let mut out = vec![1];
				out.extend(v.canonical_bytes());
				out
			}
		}
	}
}

impl<A,B> CanonicalBytes for (A,B)
	where
		A: CanonicalBytes,
		B: CanonicalBytes
{
	fn canonical_bytes(&self) -> Vec<u8> {
		let mut out = self.0.canonical_bytes();
		out.extend(self.1.canonical_bytes());
		out
	}
}

impl<T> CanonicalBytes for Vec<T>
	where
		T: CanonicalBytes
{
	fn canonical_bytes(&self) -> Vec<u8> {
		let mut out = (self.len() as u64).to_le_bytes().to_vec();
		for item in self {
			out.extend(item.canonical_bytes());
		}
		out
	}
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn fields_dont_run_together() {

		let mut a = FieldHasher::new();
		a.field("x", &"12".to_string())
			.field("y", &"3".to_string());

		let mut b = FieldHasher::new();
		b.field("x", &"1".to_string())
			.field("y", &"23".to_string());

		assert_that!(&(a.finish() == b.finish()), eq(false));
	}

	#[test]
	fn negative_zero() {
		assert_that!(&(-0.0f64).canonical_bytes(), eq(0.0f64.canonical_bytes()));
	}
}
