
use std::path::PathBuf;

use anyhow::Result;
use gumdrop::Options;

use crate::logging::ResultExt;
use crate::modality::Modality;
use crate::sino::SinogramView;


#[derive(Options)]
pub struct Args {

	/// the sinogram file to describe
	#[options(free, required, parse(try_from_str))]
	sinogram: PathBuf
}


pub fn run(args: Args) -> Result<()> {

	let sino = SinogramView::load(&args.sinogram)?;

	println!("sinogram: {}", args.sinogram.to_string_lossy());
	println!("    hash: {}", sino.get_hash()?);

	for modality in Modality::ALL {
		if !sino.has(modality) {
			continue;
		}
		let (frames, ny, nx) = sino.shape(modality)?;
		let meta = sino.get_meta(modality)?;
		println!("{}:", modality);
		println!("    frames: {} of {}x{}", frames, ny, nx);

		// a single frame has no rate, but the rest is still worth showing
		match sino.get_frame_rate(modality).debug_err() {
			Ok(rate) => println!("    frame rate: {:.4} Hz (variation {:.2}%)", rate.rate, rate.variation),
			Err(()) => println!("    frame rate: unknown")
		}
		println!("    wavelength: {:e} m, pixel size: {:e} m, medium index: {}", meta.wavelength, meta.pixel_size, meta.medium_index);
	}

	Ok(())
}
