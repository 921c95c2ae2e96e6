
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;


/// Where numeric code reports how far along it is.
///
/// Writers only ever add to the counters. Each stage has exactly one writer,
/// and any number of threads may read.
pub trait ProgressSink: Send + Sync {

	/// announce more units of work, before doing them
	fn expect(&self, units: u32);

	/// record finished units of work
	fn advance(&self, units: u32);
}


/// A lock-free pair of counters: units done, and units expected.
///
/// Increments use release ordering and reads use acquire ordering, so a reader that sees
/// a count also sees everything the writer did before bumping it.
#[derive(Debug, Default)]
pub struct Progress {
	done: AtomicU32,
	total: AtomicU32
}

impl Progress {

	pub fn new() -> Self {
		Self::default()
	}

	pub fn done(&self) -> u32 {
		self.done.load(Ordering::Acquire)
	}

	pub fn total(&self) -> u32 {
		self.total.load(Ordering::Acquire)
	}

	/// finished once some work was expected and all of it was done
	pub fn is_complete(&self) -> bool {
		let total = self.total();
		total > 0 && self.done() >= total
	}

	/// Fast-forwards to the end, eg when a cached result made the expected work unnecessary.
	pub fn complete(&self) {
		let total = self.total();
		self.done.fetch_max(total, Ordering::AcqRel);
	}

	/// Logs a tqdm-style bar, eg ` 40%|####      | 4/10`.
	pub fn report(&self, label: &str) {
		let done = self.done();
		let total = self.total();
		let percent = if total > 0 {
			(done.min(total) as u64*100/total as u64) as u32
		} else {
			0
		};
		let bar = (0 .. percent/10)
			.map(|_| '#')
			.collect::<String>();
		debug!("{}: {:>3}%|{:<10}| {}/{}", label, percent, bar, done, total);
	}
}

impl ProgressSink for Progress {

	fn expect(&self, units: u32) {
		self.total.fetch_add(units, Ordering::AcqRel);
	}

	fn advance(&self, units: u32) {
		self.done.fetch_add(units, Ordering::AcqRel);
	}
}


/// Discards all reports.
pub struct NoProgress;

impl ProgressSink for NoProgress {
	fn expect(&self, _units: u32) {}
	fn advance(&self, _units: u32) {}
}
