
// On-disk cache of raw reconstructions, one file per key.

// entry layout, all little-endian:
//   magic "REELOBJF", version u32, metadata, volume (nz, ny, nx, then re/im f64 pairs),
//   then the SHA-256 of everything before it

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use ndarray::Array3;
use num_complex::Complex64;
use tracing::{debug, info, warn};

use crate::algorithm::Algorithm;
use crate::codec::{self, Metadata, ReadExt, WriteExt};
use crate::digest;
use crate::error::ReelError;


pub const EXTENSION: &str = "cache";

const MAGIC: &[u8; 8] = b"REELOBJF";
const VERSION: u32 = 1;
const CHECKSUM_SIZE: usize = 32;


/// Identifies a raw reconstruction by everything that went into it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub algorithm: String,
	/// leading hex characters of the sinogram hash
	pub sino: String,
	/// leading hex characters of the rotation hash
	pub rotation: String,
	pub scheme: String
}

impl CacheKey {

	pub fn new(algorithm: Algorithm, sino_hash: &str, rotation_hash: &str, scheme: &str, prefix: usize) -> Self {
		Self {
			algorithm: algorithm.id().to_string(),
			sino: truncate(sino_hash, prefix),
			rotation: truncate(rotation_hash, prefix),
			scheme: scheme.to_string()
		}
	}

	/// eg `BPGodtbrain_1a2b3_4c5d6_standard.cache`
	pub fn file_name(&self) -> String {
		format!("{}.{}", self, EXTENSION)
	}
}

impl fmt::Display for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}_{}_{}_{}", self.algorithm, self.sino, self.rotation, self.scheme)
	}
}

fn truncate(hash: &str, prefix: usize) -> String {
	hash.chars()
		.take(prefix)
		.collect()
}


/// A raw object function and what the kernel said about it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
	pub data: Array3<Complex64>,
	pub meta: Metadata
}

impl CacheEntry {

	pub fn encode(&self) -> Result<Vec<u8>> {
		let mut out = Vec::<u8>::new();
		out.write_all(MAGIC)?;
		out.write_u32::<LE>(VERSION)?;
		out.write_metadata(&self.meta)?;
		out.write_complex_volume(&self.data)?;
		let checksum = digest::hash_bytes(&out);
		out.write_all(&checksum)?;
		Ok(out)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {

		if bytes.len() < CHECKSUM_SIZE {
			bail!("Only {} bytes, too short for a checksum", bytes.len());
		}
		let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
		if digest::hash_bytes(body) != checksum {
			bail!("Checksum mismatch");
		}

		let mut reader = Cursor::new(body);
		let mut magic = [0u8; 8];
		reader.read_exact(&mut magic)
			.context("Failed to read magic bytes")?;
		if &magic != MAGIC {
			bail!("Not a cache entry");
		}
		let version = reader.read_u32::<LE>()?;
		if version != VERSION {
			bail!("Unsupported cache entry version: {}", version);
		}
		let meta = reader.read_metadata()?;
		let data = reader.read_complex_volume()?;
		if (reader.position() as usize) != body.len() {
			bail!("Unexpected trailing bytes");
		}

		Ok(Self { data, meta })
	}
}


/// Content-addressed store of raw reconstructions, scoped to one session.
///
/// Entries are created once and never modified. Calls for the same key in this process take turns,
/// so a key is only ever computed once, but there's no protection against other processes.
pub struct ReconstructionCache {
	dir: PathBuf,
	locks: KeyLocks
}

impl ReconstructionCache {

	pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir)
			.context(format!("Failed to create cache folder: {}", dir.to_string_lossy()))?;
		Ok(Self {
			dir,
			locks: KeyLocks::default()
		})
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn path(&self, key: &CacheKey) -> PathBuf {
		self.dir.join(key.file_name())
	}

	/// Reads the entry for the key, if there's a trustworthy one.
	///
	/// An entry that fails validation is logged, deleted, and reported as missing.
	/// Failing to read the file at all is an error, and the file stays.
	pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {

		let path = self.path(key);
		let exists = path.try_exists()
			.context(format!("Failed to check for cache entry: {}", path.to_string_lossy()))?;
		if !exists {
			return Ok(None);
		}

		// a read failure says nothing about the entry, only a bad decode does
		let bytes = fs::read(&path)
			.context(format!("Failed to read cache entry: {}", path.to_string_lossy()))?;
		match CacheEntry::decode(&bytes) {
			Ok(entry) => Ok(Some(entry)),
			Err(e) => {
				let corruption = ReelError::CacheCorruption {
					key: key.to_string(),
					reason: format!("{:#}", e)
				};
				warn!("{}, recomputing", corruption);
				if let Err(e) = fs::remove_file(&path) {
					// the new entry will replace it anyway
					warn!("Failed to remove corrupt cache entry {}: {}", path.to_string_lossy(), e);
				}
				Ok(None)
			}
		}
	}

	/// Returns the cached entry for the key, or computes and stores it.
	///
	/// `compute` runs at most once per key, and a failed computation leaves nothing behind.
	#[tracing::instrument(skip_all, level = 5, name = "Cache", fields(key = %key))]
	pub fn get_or_compute<F>(&self, key: &CacheKey, compute: F) -> Result<CacheEntry>
		where
			F: FnOnce() -> Result<CacheEntry>
	{
		let _guard = self.locks.lock(key)?;

		if let Some(entry) = self.get(key)? {
			debug!("Cache hit");
			return Ok(entry);
		}

		debug!("Cache miss, computing");
		let entry = compute()?;

		let path = self.path(key);
		let bytes = entry.encode()
			.context(format!("Failed to encode cache entry {}", key))?;
		codec::write_staged(&path, bytes)
			.context(format!("Failed to write cache entry {}", key))?;
		info!("Cached {}", path.to_string_lossy());

		Ok(entry)
	}
}


/// Keys currently being looked up or computed in this process.
#[derive(Default)]
struct KeyLocks {
	held: Mutex<HashSet<CacheKey>>,
	released: Condvar
}

impl KeyLocks {

	fn lock(&self, key: &CacheKey) -> Result<KeyGuard<'_>> {
		let mut held = self.held()?;
		while held.contains(key) {
			debug!("Waiting for another computation of {}", key);
			held = self.released.wait(held)
				.map_err(|_| anyhow!("Cache key lock poisoned"))?;
		}
		held.insert(key.clone());
		Ok(KeyGuard {
			locks: self,
			key: key.clone()
		})
	}

	fn held(&self) -> Result<MutexGuard<'_,HashSet<CacheKey>>> {
		self.held.lock()
			.map_err(|_| anyhow!("Cache key lock poisoned"))
	}
}

struct KeyGuard<'a> {
	locks: &'a KeyLocks,
	key: CacheKey
}

impl Drop for KeyGuard<'_> {
	fn drop(&mut self) {
		// release even if another thread panicked while holding the set
		let mut held = match self.locks.held.lock() {
			Ok(held) => held,
			Err(poisoned) => poisoned.into_inner()
		};
		held.remove(&self.key);
		self.locks.released.notify_all();
	}
}
