
mod util;


use std::fs;

use assert_fs::TempDir;
use galvanic_assert::{assert_that, matchers::*};

use sinoreel::container::{self, SinogramFile};
use sinoreel::error::{self, ReelError};
use sinoreel::logging;
use sinoreel::modality::Modality;
use sinoreel::progress::{Progress, ProgressSink};
use sinoreel::sino::{self, SinogramView};


fn temp_sinogram(with_qpi: bool, with_fl: bool) -> TempDir {
	let dir = TempDir::new()
		.expect("Failed to create temp dir");
	util::write_sinogram(util::raw_sinogram_path(dir.path()), with_qpi, with_fl);
	dir
}


#[test]
fn load() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, true);
	let sino = SinogramView::load(util::raw_sinogram_path(dir.path()))
		.expect("Failed to load");

	assert_that!(&sino.has_qpi(), eq(true));
	assert_that!(&sino.has_fli(), eq(true));
	for modality in Modality::ALL {
		assert_that!(&sino.shape(modality).unwrap(), eq((util::FRAMES, util::NY, util::NX)));
		assert_that!(&sino.get_meta(modality).unwrap(), eq(util::meta()));
	}
	assert_that!(&sino.get_times(Modality::Phase).unwrap().to_vec(), eq(util::times()));

	let written = util::sinogram(true, true);
	let Some(qpi) = written.qpi else { panic!("no QPI") };
	assert_that!(&sino.get_data(Modality::Phase).unwrap().to_owned(), eq(qpi.phase));

	let rate = sino.get_frame_rate(Modality::Fluorescence)
		.expect("Failed to get frame rate");
	assert_that!(&((rate.rate - 10.0).abs() < 1e-9), eq(true));
	assert_that!(&(rate.variation < 1e-6), eq(true));
}


#[test]
fn load_progress() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, true);
	let path = util::raw_sinogram_path(dir.path());

	let header = SinogramFile::read_header(&path)
		.expect("Failed to read header");
	assert_that!(&sino::load_units(&header), eq((2*util::FRAMES + util::FRAMES) as u32));

	let progress = Progress::new();
	SinogramView::load_with_progress(&path, &progress)
		.expect("Failed to load");
	assert_that!(&progress.total(), eq((3*util::FRAMES) as u32));
	assert_that!(&progress.is_complete(), eq(true));
}


#[test]
fn hash_follows_content() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, false);
	let path = util::raw_sinogram_path(dir.path());
	let copy = dir.path().join("copy.reel");
	fs::copy(&path, &copy)
		.expect("Failed to copy");

	let hash = SinogramView::load(&path).unwrap().get_hash().unwrap();
	assert_that!(&hash.len(), eq(64));
	assert_that!(&SinogramView::load(&path).unwrap().get_hash().unwrap(), eq(hash.clone()));
	assert_that!(&SinogramView::load(&copy).unwrap().get_hash().unwrap(), eq(hash.clone()));

	// another sinogram hashes differently
	util::write_sinogram(&copy, true, true);
	assert_that!(&(SinogramView::load(&copy).unwrap().get_hash().unwrap() != hash), eq(true));
}


#[test]
fn missing_modality() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, false);
	let sino = SinogramView::load(util::raw_sinogram_path(dir.path()))
		.expect("Failed to load");

	assert_that!(&sino.has(Modality::Fluorescence), eq(false));
	let e = sino.get_data(Modality::Fluorescence)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));
	let e = sino.get_frame_rate(Modality::Fluorescence)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));
}


#[test]
fn garbage_file() {
	let _logging = logging::init_test();

	let dir = TempDir::new()
		.expect("Failed to create temp dir");
	let path = util::raw_sinogram_path(dir.path());
	fs::write(&path, b"definitely not a sinogram")
		.expect("Failed to write");

	let e = SinogramView::load(&path)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));
}


#[test]
fn header_sizes_must_match_the_file() {
	let _logging = logging::init_test();

	let dir = TempDir::new()
		.expect("Failed to create temp dir");
	let path = util::raw_sinogram_path(dir.path());

	// a tiny file claiming the largest possible QPI series
	let mut bytes = Vec::<u8>::new();
	bytes.extend_from_slice(container::MAGIC);
	bytes.extend_from_slice(&container::VERSION.to_le_bytes());
	bytes.extend_from_slice(&[1, 0]);
	for _ in 0 .. 3 {
		bytes.extend_from_slice(&u32::MAX.to_le_bytes());
	}
	for v in [633e-9f64, 0.1e-6, 1.333] {
		bytes.extend_from_slice(&v.to_le_bytes());
	}
	fs::write(&path, &bytes)
		.expect("Failed to write");

	let e = SinogramView::load(&path)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));

	let progress = Progress::new();
	let e = SinogramView::load_with_progress(&path, &progress)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));

	// a real file, cut short
	util::write_sinogram(&path, true, false);
	let header = SinogramFile::read_header(&path)
		.expect("Failed to read header");
	let len = fs::metadata(&path)
		.expect("Failed to stat")
		.len();
	assert_that!(&header.file_size(), eq(Some(len)));
	let bytes = fs::read(&path)
		.expect("Failed to read");
	fs::write(&path, &bytes[.. bytes.len() - 10])
		.expect("Failed to write");
	let e = SinogramView::load(&path)
		.err()
		.expect("Expected an error");
	assert_that!(&matches!(error::categorize(&e), Some(ReelError::DataIntegrity(_))), eq(true));
}


#[test]
fn reload() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, false);
	let path = util::raw_sinogram_path(dir.path());
	let mut sino = SinogramView::load(&path)
		.expect("Failed to load");
	let before = sino.get_hash().unwrap();

	util::write_sinogram(&path, true, true);
	sino.reload()
		.expect("Failed to reload");

	assert_that!(&sino.has_fli(), eq(true));
	assert_that!(&(sino.get_hash().unwrap() != before), eq(true));
}


#[test]
fn time_conversions() {
	let _logging = logging::init_test();

	let dir = temp_sinogram(true, false);
	let sino = SinogramView::load(util::raw_sinogram_path(dir.path()))
		.expect("Failed to load");

	let range = sino.get_time_slice(1.0, 2.0, Modality::Phase)
		.expect("Failed to slice");
	let times = sino.get_times(Modality::Phase).unwrap();
	assert_that!(&(times[range.start] >= 1.0 - 1e-9), eq(true));
	assert_that!(&(times[range.end - 1] <= 2.0 + 1e-9), eq(true));
	assert_that!(&(range.len() >= 10), eq(true));

	let indices = sino.convert_time_to_index(&[0.0, 0.5, 3.5], Modality::Phase, true)
		.expect("Failed to convert");
	assert_that!(&indices, eq(vec![0.0, 5.0, 35.0]));
	let back = sino.convert_index_to_time(&indices, Modality::Phase)
		.expect("Failed to convert");
	for (t, expected) in back.iter().zip([0.0, 0.5, 3.5]) {
		assert_that!(&((t - expected).abs() < 1e-9), eq(true));
	}
}
