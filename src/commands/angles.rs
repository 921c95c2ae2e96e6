
use std::path::PathBuf;

use anyhow::Result;
use gumdrop::Options;

use crate::modality::Modality;
use crate::session::Session;
use crate::sino::SinogramView;


#[derive(Options)]
pub struct Args {

	/// imaging modality: phase, amplitude, or fluorescence
	#[options(default = "phase", parse(try_from_str))]
	mode: Modality,

	/// name of the sinogram in the session
	#[options(default = "Raw Sinogram")]
	sinogram: String,

	/// the session folder
	#[options(free, required, parse(try_from_str))]
	pub session: PathBuf,

	/// name of the rotation
	#[options(free, required)]
	rotation: String
}


pub fn run(args: Args) -> Result<()> {

	let session = Session::open(&args.session)?;
	let sino = SinogramView::load(session.sinogram_path(&args.sinogram)?)?;

	let (angles, range) = session.registry()
		.compute_angles(&args.rotation, &sino, args.mode)?;

	println!("rotation: {}", args.rotation);
	println!("frames: {} .. {}", range.start, range.end);
	for (i, angle) in range.zip(&angles) {
		println!("{:>6} {:>10.6} rad {:>10.4} deg", i, angle, angle.to_degrees());
	}

	Ok(())
}
