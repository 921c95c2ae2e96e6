
mod util;


use assert_cmd::Command;
use galvanic_assert::{assert_that, matchers::*};
use predicates::prelude::*;

use sinoreel::logging;


fn sinoreel() -> Command {
	Command::new(util::bin_path())
}


#[test]
fn help() {
	let _logging = logging::init_test();
	sinoreel()
		.args(["--help"])
		.assert()
		.success()
		.stdout(predicate::str::contains("rotations"));
}


#[test]
fn no_command() {
	let _logging = logging::init_test();
	sinoreel()
		.assert()
		.failure();
}


#[test]
fn info() {
	let _logging = logging::init_test();

	let dir = util::session_dir(true, true);
	let path = util::raw_sinogram_path(dir.path());

	let output = sinoreel()
		.args(["info"])
		.arg(&path)
		.output()
		.expect("Failed to run");
	assert_that!(&output.status.success(), eq(true));

	let stdout = String::from_utf8_lossy(&output.stdout);
	for expected in ["hash:", "phase:", "amplitude:", "fluorescence:", "36 of 8x6", "10.0000 Hz"] {
		assert_that!(&stdout.contains(expected), eq(true));
	}
}


#[test]
fn info_missing_file() {
	let _logging = logging::init_test();
	sinoreel()
		.args(["info", "/nonexistent/sinogram.reel"])
		.assert()
		.failure();
}


#[test]
fn angles() {
	let _logging = logging::init_test();

	let dir = util::session_dir(true, false);
	sinoreel()
		.args(["angles"])
		.arg(dir.path())
		.arg(util::FULL_TURN)
		.assert()
		.success()
		.stdout(predicate::str::contains("frames: 0 .. 36"))
		.stdout(predicate::str::contains("350.0000 deg"));

	// no fluorescence data in this sinogram
	sinoreel()
		.args(["angles", "--mode", "fluorescence"])
		.arg(dir.path())
		.arg(util::FULL_TURN)
		.assert()
		.failure();
}


#[test]
fn rotations() {
	let _logging = logging::init_test();

	let dir = util::session_dir(true, false);
	sinoreel()
		.args(["--log", "sinoreel=debug", "rotations"])
		.arg(dir.path())
		.assert()
		.success()
		.stdout(predicate::str::contains(util::FULL_TURN))
		.stdout(predicate::str::contains("uniform"));
}
