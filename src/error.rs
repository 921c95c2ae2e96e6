
use thiserror::Error;


/// Failure categories raised by the core.
///
/// Operations return `anyhow::Result`, but the root cause is always one of these,
/// so callers can recover it with `err.downcast_ref::<ReelError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReelError {

	/// missing or malformed modality, mismatched frame counts, bad container bytes
	#[error("Data integrity error: {0}")]
	DataIntegrity(String),

	/// underdetermined or non-converging nonlinear fit
	#[error("Fit did not converge: {0}")]
	FitConvergence(String),

	/// a cache entry exists but can't be trusted
	#[error("Corrupt cache entry {key}: {reason}")]
	CacheCorruption {
		key: String,
		reason: String
	},

	/// the external reconstruction kernel or correction failed
	#[error("Computation failed in {stage}: {reason}")]
	KernelComputation {
		stage: String,
		reason: String
	},

	/// rejected input at the API boundary
	#[error("Configuration error: {0}")]
	Configuration(String)
}

impl ReelError {

	pub fn data(msg: impl Into<String>) -> Self {
		Self::DataIntegrity(msg.into())
	}

	pub fn fit(msg: impl Into<String>) -> Self {
		Self::FitConvergence(msg.into())
	}

	pub fn config(msg: impl Into<String>) -> Self {
		Self::Configuration(msg.into())
	}

	pub fn kernel(stage: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::KernelComputation {
			stage: stage.into(),
			reason: reason.into()
		}
	}
}


/// Finds the typed cause of an error, if there is one.
pub fn categorize(e: &anyhow::Error) -> Option<&ReelError> {
	e.chain()
		.find_map(|cause| cause.downcast_ref::<ReelError>())
}
