use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;

use s3bd::config::{Cli, Config};
use s3bd::engine::Engine;
use s3bd::mount::BlocksFs;

fn main() -> ExitCode {
	let cli = Cli::parse();

	let config = match Config::from_cli(cli) {
		Ok(config) => Arc::new(config),
		Err(err) => {
			eprintln!("s3bd: {err}");
			return ExitCode::FAILURE;
		}
	};

	let default_filter = if config.debug { "debug" } else { "info" };
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
		.init();

	log::info!(
		"mounting {} at {} (device size {})",
		config.blockdir,
		config.mountpoint.display(),
		s3bd::units::display_size(config.device_size as usize)
	);

	let engine = match Engine::new(config.clone()) {
		Ok(engine) => engine,
		Err(err) => {
			log::error!("failed to initialize storage engine: {err}");
			return ExitCode::FAILURE;
		}
	};

	let workers = engine.spawn_workers();

	let mut options = vec![MountOption::FSName("s3bd".to_string())];
	if config.readonly {
		options.push(MountOption::RO);
	} else {
		options.push(MountOption::RW);
	}
	if config.allow_other {
		options.push(MountOption::AllowOther);
	}

	let fs = BlocksFs::new(engine, config.readonly);
	let result = fuser::mount2(fs, &config.mountpoint, &options);

	workers.shutdown();

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			log::error!("mount failed: {err}");
			ExitCode::FAILURE
		}
	}
}
