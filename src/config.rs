
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use toml::{Table, Value};

use crate::error::ReelError;
use crate::logging;


pub const FILENAME: &str = "session.toml";


/// Settings for a session folder, read from `session.toml` when it exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
	pub cache: ConfigCache,
	pub progress: ConfigProgress,
	pub log: ConfigLog
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigCache {
	/// relative to the session folder, unless absolute
	pub dir: PathBuf,
	/// number of hex characters of each hash used in cache file names
	pub hash_prefix: usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigProgress {
	pub poll_interval: Duration
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLog {
	pub filter: String
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			cache: ConfigCache {
				dir: PathBuf::from("cache"),
				hash_prefix: 5
			},
			progress: ConfigProgress {
				poll_interval: Duration::from_millis(10)
			},
			log: ConfigLog {
				filter: logging::DEFAULT_FILTER.to_string()
			}
		}
	}
}

impl SessionConfig {

	/// Reads the config in the session folder, or returns the defaults if there is none.
	pub fn read(session_dir: impl AsRef<Path>) -> Result<Self> {

		let path = session_dir.as_ref().join(FILENAME);
		let exists = path.try_exists()
			.with_context(|| format!("Failed to check for config file at: {}", path.to_string_lossy()))?;
		if !exists {
			return Ok(Self::default());
		}

		let toml = fs::read_to_string(&path)
			.with_context(|| format!("Failed to read config file at: {}", path.to_string_lossy()))?;
		Self::parse(&toml)
			.with_context(|| format!("Failed to parse config file at: {}", path.to_string_lossy()))
	}

	pub fn parse(toml: &str) -> Result<Self> {

		let toml = toml.parse::<Table>()
			.map_err(|e| ReelError::config(e.to_string()))?;

		let mut config = Self::default();

		if let Some(cache) = section(&toml, "cache")? {
			if let Some(dir) = cache.get("dir") {
				config.cache.dir = PathBuf::from(as_str(dir, "cache.dir")?);
			}
			if let Some(prefix) = cache.get("hash_prefix") {
				let prefix = as_int(prefix, "cache.hash_prefix")?;
				// a sha256 digest has 64 hex characters
				if !(1 ..= 64).contains(&prefix) {
					return Err(ReelError::config(format!("cache.hash_prefix must be in [1,64], not {}", prefix)).into());
				}
				config.cache.hash_prefix = prefix as usize;
			}
		}

		if let Some(progress) = section(&toml, "progress")? {
			if let Some(interval) = progress.get("poll_interval_ms") {
				let interval = as_int(interval, "progress.poll_interval_ms")?;
				if interval <= 0 {
					return Err(ReelError::config(format!("progress.poll_interval_ms must be positive, not {}", interval)).into());
				}
				config.progress.poll_interval = Duration::from_millis(interval as u64);
			}
		}

		if let Some(log) = section(&toml, "log")? {
			if let Some(filter) = log.get("filter") {
				config.log.filter = as_str(filter, "log.filter")?.to_string();
			}
		}

		Ok(config)
	}

	pub fn cache_dir(&self, session_dir: impl AsRef<Path>) -> PathBuf {
		session_dir.as_ref().join(&self.cache.dir)
	}
}


fn section<'t>(toml: &'t Table, name: &str) -> Result<Option<&'t Table>> {
	match toml.get(name) {
		None => Ok(None),
		Some(Value::Table(table)) => Ok(Some(table)),
		Some(_) => Err(ReelError::config(format!("[{}] is not a table", name)).into())
	}
}

fn as_str<'v>(value: &'v Value, key: &str) -> Result<&'v str> {
	value.as_str()
		.ok_or_else(|| ReelError::config(format!("{} was not a string", key)).into())
}

fn as_int(value: &Value, key: &str) -> Result<i64> {
	value.as_integer()
		.ok_or_else(|| ReelError::config(format!("{} was not an integer", key)).into())
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn empty_is_default() {
		let config = SessionConfig::parse("")
			.expect("Failed to parse");
		assert_that!(&config, eq(SessionConfig::default()));
	}

	#[test]
	fn overrides() {
		let config = SessionConfig::parse(r#"
			[cache]
			dir = "objcache"
			hash_prefix = 8

			[progress]
			poll_interval_ms = 25

			[log]
			filter = "sinoreel=trace"
		"#)
			.expect("Failed to parse");
		assert_that!(&config.cache.dir, eq(PathBuf::from("objcache")));
		assert_that!(&config.cache.hash_prefix, eq(8));
		assert_that!(&config.progress.poll_interval, eq(Duration::from_millis(25)));
		assert_that!(&config.log.filter.as_str(), eq("sinoreel=trace"));
	}

	#[test]
	fn bad_values() {
		for toml in [
			"cache = 5",
			"[cache]\nhash_prefix = 0",
			"[cache]\ndir = 7",
			"[progress]\npoll_interval_ms = -1",
		] {
			let e = SessionConfig::parse(toml)
				.expect_err(toml);
			assert_that!(&matches!(crate::error::categorize(&e), Some(ReelError::Configuration(_))), eq(true));
		}
	}
}
