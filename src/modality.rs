
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReelError;


/// The imaging channel a frame stack belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
	Phase,
	Amplitude,
	Fluorescence
}

impl Modality {

	pub const ALL: [Modality; 3] = [Modality::Phase, Modality::Amplitude, Modality::Fluorescence];

	pub fn name(&self) -> &'static str {
		match self {
			Self::Phase => "phase",
			Self::Amplitude => "amplitude",
			Self::Fluorescence => "fluorescence"
		}
	}

	/// phase and amplitude come from the same quantitative phase imaging series
	pub fn is_qpi(&self) -> bool {
		matches!(self, Self::Phase | Self::Amplitude)
	}
}

impl fmt::Display for Modality {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for Modality {
	type Err = ReelError;

	fn from_str(s: &str) -> Result<Self,Self::Err> {
		match s {
			"phase" => Ok(Self::Phase),
			"amplitude" => Ok(Self::Amplitude),
			"fluorescence" => Ok(Self::Fluorescence),
			_ => Err(ReelError::config(format!("Invalid modality: {}", s)))
		}
	}
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn parse() {
		for modality in Modality::ALL {
			assert_that!(&modality.name().parse::<Modality>(), eq(Ok(modality)));
		}
		assert_that!(&"Phase".parse::<Modality>().is_err(), eq(true));
		assert_that!(&"holography".parse::<Modality>(), eq(Err(ReelError::config("Invalid modality: holography"))));
	}
}
