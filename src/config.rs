//! Process configuration: CLI flags (via `clap`) layered over the four
//! environment variables the engine itself recognizes. Validated once at
//! startup into an immutable, `Arc`-shared [`Config`].

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::consts::{
	DEFAULT_CACHE_MEGABYTES, DEFAULT_DEVICE_SIZE, DEFAULT_SCRATCH_DIR, DEFAULT_SYNC_INTERVAL_SECS,
};
use crate::error::MountError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
	Local,
	Memory,
}

/// `s3bd blockdir mountpoint [options]`
#[derive(Debug, Parser)]
#[command(name = "s3bd", version, about = "Mount a sparse virtual block device backed by a remote object store")]
pub struct Cli {
	/// URI of the directory holding remote extent objects.
	pub blockdir: String,

	/// Directory to mount the virtual device at.
	pub mountpoint: PathBuf,

	/// Mount and expose the device read-only; rejects writes at the mount.
	#[arg(long, short = 'r', default_value_t = false)]
	pub readonly: bool,

	/// Selects the remote VFS backend.
	#[arg(long, value_enum, default_value_t = Backend::Local)]
	pub backend: Backend,

	/// Size of the virtual device, in bytes (accepts k/m/g suffixes).
	#[arg(long, value_parser = parse_byte_size, default_value_t = DEFAULT_DEVICE_SIZE)]
	pub device_size: u64,

	/// Pass `allow_other` through to the FUSE mount options.
	#[arg(long, default_value_t = false)]
	pub allow_other: bool,

	/// Raise the log filter to `debug` and keep the FUSE session foregrounded.
	#[arg(long, short = 'd', default_value_t = false)]
	pub debug: bool,
}

fn parse_byte_size(s: &str) -> Result<u64, String> {
	let s = s.trim();
	let (digits, multiplier) = match s.chars().last() {
		Some('k' | 'K') => (&s[..s.len() - 1], 1024u64),
		Some('m' | 'M') => (&s[..s.len() - 1], 1024 * 1024),
		Some('g' | 'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
		Some(_) => (s, 1),
		None => return Err("empty device size".to_string()),
	};
	digits
		.parse::<u64>()
		.map(|n| n * multiplier)
		.map_err(|e| format!("invalid device size {s:?}: {e}"))
}

#[derive(Debug, Clone)]
pub struct Config {
	pub blockdir: String,
	pub mountpoint: PathBuf,
	pub readonly: bool,
	pub backend: Backend,
	pub device_size: u64,
	pub allow_other: bool,
	pub debug: bool,
	pub cache_bytes: u64,
	pub keep_scratch_file: bool,
	pub scratch_dir: PathBuf,
	pub sync_interval_secs: u64,
}

impl Config {
	pub fn from_cli(cli: Cli) -> Result<Self, MountError> {
		let cache_megabytes = env_usize("CACHE_MEGABYTES", DEFAULT_CACHE_MEGABYTES)?;
		let keep_scratch_file = std::env::var_os("KEEP_SCRATCH_FILE").is_some();
		let scratch_dir = std::env::var("SCRATCH_DIR")
			.unwrap_or_else(|_| DEFAULT_SCRATCH_DIR.to_string())
			.into();
		let sync_interval_secs = env_u64("SYNC_INTERVAL", DEFAULT_SYNC_INTERVAL_SECS)?;

		if cli.device_size == 0 {
			return Err(MountError::Config("device-size must be nonzero".into()));
		}

		Ok(Self {
			blockdir: cli.blockdir,
			mountpoint: cli.mountpoint,
			readonly: cli.readonly,
			backend: cli.backend,
			device_size: cli.device_size,
			allow_other: cli.allow_other,
			debug: cli.debug,
			cache_bytes: (cache_megabytes as u64) * 1024 * 1024,
			keep_scratch_file,
			scratch_dir,
			sync_interval_secs,
		})
	}
}

fn env_usize(name: &str, default: usize) -> Result<usize, MountError> {
	match std::env::var(name) {
		Ok(v) => v
			.parse()
			.map_err(|_| MountError::Config(format!("{name} must be a non-negative integer, got {v:?}"))),
		Err(_) => Ok(default),
	}
}

fn env_u64(name: &str, default: u64) -> Result<u64, MountError> {
	match std::env::var(name) {
		Ok(v) => v
			.parse()
			.map_err(|_| MountError::Config(format!("{name} must be a non-negative integer, got {v:?}"))),
		Err(_) => Ok(default),
	}
}
