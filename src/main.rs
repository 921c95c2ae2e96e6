
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Result};
use gumdrop::{Options, ParsingStyle};

use sinoreel::commands;
use sinoreel::config::SessionConfig;
use sinoreel::logging::{self, ResultExt};


#[derive(Options)]
struct Args {

	#[options(help_flag)]
	help: bool,

	/// settings for log output, defaults to the session config, then sinoreel=info
	log: Option<String>,

	#[options(command)]
	cmd: Option<Command>
}

#[derive(Options)]
enum Command {

	/// Describe a sinogram file
	Info(commands::info::Args),

	/// Show the angles of a rotation in a session
	Angles(commands::angles::Args),

	/// List the rotations in a session
	Rotations(commands::rotations::Args)
}

impl Command {

	fn session(&self) -> Option<&Path> {
		match self {
			Self::Info(_) => None,
			Self::Angles(args) => Some(args.session.as_path()),
			Self::Rotations(args) => Some(args.session.as_path())
		}
	}
}


fn main() -> ExitCode {

	// parse arguments
	let args = Args::parse_args_or_exit(ParsingStyle::StopAtFirstFree);

	// init logging
	let Ok(_) = logging::init(log_filter(&args))
		.log_err()
		else { return ExitCode::FAILURE; };

	let Ok(_) = run(args)
		.log_err()
		else { return ExitCode::FAILURE; };

	ExitCode::SUCCESS
}


fn log_filter(args: &Args) -> String {

	if let Some(filter) = &args.log {
		return filter.clone();
	}

	// logging isn't up yet, so a broken config is reported later, when the command opens the session
	args.cmd.as_ref()
		.and_then(|cmd| cmd.session())
		.and_then(|dir| SessionConfig::read(dir).ok())
		.map(|config| config.log.filter)
		.unwrap_or_else(|| logging::DEFAULT_FILTER.to_string())
}


#[tracing::instrument(skip_all, level = 5, name = "Sinoreel")]
fn run(args: Args) -> Result<()> {
	match args.cmd {
		Some(Command::Info(info_args)) => commands::info::run(info_args),
		Some(Command::Angles(angles_args)) => commands::angles::run(angles_args),
		Some(Command::Rotations(rotations_args)) => commands::rotations::run(rotations_args),
		None => bail!("No command, try one of:\n{}", Args::command_list().unwrap_or_default())
	}
}
