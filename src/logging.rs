
use std::ops::Deref;

use anyhow::{Context, Result};
use display_error_chain::ErrorChainExt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::UtcOffset;
use tracing::dispatcher::DefaultGuard;
use tracing::{debug, error, warn};
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full};
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::{EnvFilter, FmtSubscriber};


pub const DEFAULT_FILTER: &str = "sinoreel=info";

/// overrides the filter of test logs, eg `SINOREEL_TEST_LOG=sinoreel::cache=trace`
pub const TEST_FILTER_VAR: &str = "SINOREEL_TEST_LOG";
const TEST_FILTER: &str = "sinoreel=trace";

type Timer = OffsetTime<&'static [FormatItem<'static>]>;
type Builder = SubscriberBuilder<DefaultFields,Format<Full,Timer>,EnvFilter>;


/// Installs the process-wide subscriber, eg `sinoreel=debug`.
pub fn init(filter: impl AsRef<str>) -> Result<()> {

	let subscriber = builder(parse_filter(filter)?, Timestamps::Dated)
		.finish();

	tracing::subscriber::set_global_default(subscriber)
		.context("Failed to install the logging subscriber")?;

	Ok(())
}


/// Logs this crate into the test harness output, until the guard drops.
pub fn init_test() -> DefaultGuard {

	let filter = test_filter(std::env::var(TEST_FILTER_VAR).ok());

	let subscriber = builder(filter, Timestamps::Clock)
		.with_test_writer()
		.finish();

	tracing::subscriber::set_default(subscriber)
}


fn test_filter(requested: Option<String>) -> EnvFilter {
	requested
		.and_then(|filter| {
			parse_filter(&filter)
				.map_err(|e| eprintln!("Ignoring {}: {:#}", TEST_FILTER_VAR, e))
				.ok()
		})
		.unwrap_or_else(|| EnvFilter::new(TEST_FILTER))
}


fn parse_filter(filter: impl AsRef<str>) -> Result<EnvFilter> {
	let filter = filter.as_ref();
	EnvFilter::builder()
		.parse(filter)
		.context(format!("Failed to parse log filter: {}", filter))
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timestamps {
	/// date, time, and UTC offset
	Dated,
	/// time of day only
	Clock
}


/// Reconstructions run on named worker threads, so events carry the thread name.
fn builder(filter: EnvFilter, timestamps: Timestamps) -> Builder {
	FmtSubscriber::builder()
		.with_env_filter(filter)
		.event_format(event_format(timestamps))
}


fn event_format(timestamps: Timestamps) -> Format<Full,Timer> {

	let description: &'static [FormatItem<'static>] = match timestamps {
		Timestamps::Dated => format_description!(
			version = 2,
			"[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3] [offset_hour sign:mandatory]:[offset_minute]"
		),
		Timestamps::Clock => format_description!(
			version = 2,
			"[hour]:[minute]:[second].[subsecond digits:3]"
		)
	};

	// the local offset isn't always knowable (eg, multi-threaded processes), fall back to UTC
	let offset = UtcOffset::current_local_offset()
		.unwrap_or(UtcOffset::UTC);

	Format::default()
		.with_timer(OffsetTime::new(offset, description))
		.with_target(false)
		.with_thread_names(true)
}


pub trait ResultExt<T> {
	fn log_err(self) -> Result<T,()>;
	fn warn_err(self) -> Result<T,()>;
	fn debug_err(self) -> Result<T,()>;
}

impl<T> ResultExt<T> for Result<T,anyhow::Error> {

	fn log_err(self) -> Result<T,()> {
		self.map_err(|e| error!("{}", e.deref().chain()))
	}

	fn warn_err(self) -> Result<T,()> {
		self.map_err(|e| warn!("{}", e.deref().chain()))
	}

	fn debug_err(self) -> Result<T,()> {
		self.map_err(|e| debug!("{}", e.deref().chain()))
	}
}
