
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use assert_fs::TempDir;
use galvanic_assert::{assert_that, matchers::*};
use ndarray::Array3;
use num_complex::Complex64;

use sinoreel::algorithm::Algorithm;
use sinoreel::cache::{CacheEntry, CacheKey, ReconstructionCache};
use sinoreel::codec::{self, Metadata};
use sinoreel::logging;


fn key() -> CacheKey {
	CacheKey::new(Algorithm::Bpg, "0123456789abcdef", "fedcba9876543210", "standard", 5)
}

fn entry(value: f64) -> CacheEntry {
	let mut meta = Metadata::new();
	meta.insert("value".to_string(), value.into());
	CacheEntry {
		data: Array3::from_elem((3, 4, 5), Complex64::new(value, -value)),
		meta
	}
}

fn open() -> (TempDir, ReconstructionCache) {
	let dir = TempDir::new()
		.expect("Failed to create temp dir");
	let cache = ReconstructionCache::open(dir.path().join("cache"))
		.expect("Failed to open cache");
	(dir, cache)
}


#[test]
fn computes_once() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	let calls = AtomicUsize::new(0);
	let compute = || {
		calls.fetch_add(1, Ordering::SeqCst);
		Ok(entry(1.0))
	};

	let first = cache.get_or_compute(&key(), compute)
		.expect("Failed to compute");
	let second = cache.get_or_compute(&key(), compute)
		.expect("Failed to compute");

	assert_that!(&calls.load(Ordering::SeqCst), eq(1));
	assert_that!(&first, eq(entry(1.0)));
	assert_that!(&second, eq(first));
	assert_that!(&cache.path(&key()).file_name().unwrap().to_string_lossy().to_string(),
		eq("BPGodtbrain_01234_fedcb_standard.cache".to_string()));
}


#[test]
fn reopened_cache_hits() {
	let _logging = logging::init_test();

	let (dir, cache) = open();
	cache.get_or_compute(&key(), || Ok(entry(2.0)))
		.expect("Failed to compute");
	drop(cache);

	let cache = ReconstructionCache::open(dir.path().join("cache"))
		.expect("Failed to reopen cache");
	let hit = cache.get_or_compute(&key(), || bail!("should have been cached"))
		.expect("Failed to read cache");
	assert_that!(&hit, eq(entry(2.0)));
}


#[test]
fn failed_compute_leaves_nothing() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	let result = cache.get_or_compute(&key(), || bail!("out of memory"));
	assert_that!(&result.is_err(), eq(true));

	assert_that!(&cache.path(&key()).exists(), eq(false));
	assert_that!(&codec::staging_path(&cache.path(&key())).unwrap().exists(), eq(false));
	assert_that!(&cache.get(&key()).unwrap(), eq(None));
}


#[test]
fn partial_write_is_a_miss() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	let path = cache.path(&key());

	// an interrupted write leaves only the staging file
	let bytes = entry(3.0).encode().unwrap();
	fs::write(codec::staging_path(&path).unwrap(), &bytes[.. bytes.len()/2])
		.expect("Failed to write");
	assert_that!(&cache.get(&key()).unwrap(), eq(None));

	let computed = cache.get_or_compute(&key(), || Ok(entry(3.0)))
		.expect("Failed to compute");
	assert_that!(&computed, eq(entry(3.0)));
	assert_that!(&cache.get(&key()).unwrap(), eq(Some(entry(3.0))));
}


#[test]
fn corrupt_entry_is_recomputed() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	cache.get_or_compute(&key(), || Ok(entry(4.0)))
		.expect("Failed to compute");

	// flip a byte in the middle of the volume
	let path = cache.path(&key());
	let mut bytes = fs::read(&path).unwrap();
	let i = bytes.len()/2;
	bytes[i] ^= 0xff;
	fs::write(&path, bytes).unwrap();

	assert_that!(&cache.get(&key()).unwrap(), eq(None));
	assert_that!(&path.exists(), eq(false));

	let calls = AtomicUsize::new(0);
	let recomputed = cache.get_or_compute(&key(), || {
		calls.fetch_add(1, Ordering::SeqCst);
		Ok(entry(5.0))
	}).expect("Failed to recompute");
	assert_that!(&calls.load(Ordering::SeqCst), eq(1));
	assert_that!(&recomputed, eq(entry(5.0)));
}


#[test]
fn unreadable_entry_is_an_error() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();

	// a folder where the entry should be can't be read as a file
	let path = cache.path(&key());
	fs::create_dir_all(&path).unwrap();

	assert_that!(&cache.get(&key()).is_err(), eq(true));
	let calls = AtomicUsize::new(0);
	let result = cache.get_or_compute(&key(), || {
		calls.fetch_add(1, Ordering::SeqCst);
		Ok(entry(6.0))
	});
	assert_that!(&result.is_err(), eq(true));
	assert_that!(&calls.load(Ordering::SeqCst), eq(0));
	assert_that!(&path.is_dir(), eq(true));
}


#[test]
fn concurrent_same_key() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	let calls = AtomicUsize::new(0);

	let results = thread::scope(|scope| {
		let handles = (0 .. 4)
			.map(|_| scope.spawn(|| {
				cache.get_or_compute(&key(), || {
					calls.fetch_add(1, Ordering::SeqCst);
					thread::sleep(Duration::from_millis(50));
					Ok(entry(6.0))
				})
			}))
			.collect::<Vec<_>>();
		handles.into_iter()
			.map(|h| h.join().expect("Thread panicked"))
			.collect::<Vec<_>>()
	});

	assert_that!(&calls.load(Ordering::SeqCst), eq(1));
	for result in results {
		assert_that!(&result.expect("Failed to compute"), eq(entry(6.0)));
	}
}


#[test]
fn different_keys_dont_collide() {
	let _logging = logging::init_test();

	let (_dir, cache) = open();
	let other = CacheKey::new(Algorithm::Bpg, "0123456789abcdef", "fedcba9876543210", "high precision", 5);

	cache.get_or_compute(&key(), || Ok(entry(7.0))).unwrap();
	let value = cache.get_or_compute(&other, || Ok(entry(8.0))).unwrap();
	assert_that!(&value, eq(entry(8.0)));
	assert_that!(&cache.get(&key()).unwrap(), eq(Some(entry(7.0))));
}
