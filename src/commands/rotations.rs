
use std::path::PathBuf;

use anyhow::Result;
use gumdrop::Options;

use crate::rotation::Spacing;
use crate::session::Session;


#[derive(Options)]
pub struct Args {

	/// the session folder
	#[options(free, required, parse(try_from_str))]
	pub session: PathBuf
}


pub fn run(args: Args) -> Result<()> {

	let session = Session::open(&args.session)?;
	let registry = session.registry();
	let prefix = session.config().cache.hash_prefix;

	if registry.rotations().is_empty() {
		println!("No rotation defined!");
		return Ok(());
	}

	for (name, rotation) in registry.rotations() {
		let hash = registry.get_hash(name)?;
		let spacing = match &rotation.spacing {
			Spacing::Uniform => "uniform".to_string(),
			Spacing::Calibration(calibration) => format!("calibration {}", calibration)
		};
		println!(
			"{}  {}: {} s .. {} s, roll {} deg, {}",
			&hash[.. prefix.min(hash.len())], name, rotation.start, rotation.end, rotation.roll, spacing
		);
	}

	Ok(())
}
