//! `eden` — the bundler CLI for `.edenite` app archives:
//! `build`, `validate`, `info`, `extract`.

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use colored::Colorize;

#[derive(Parser)]
#[clap(author, version, about = "Build, validate and inspect Eden app archives", arg_required_else_help(true))]
struct Cli {
	#[clap(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Packs a directory into a `.edenite` archive.
	Build {
		dir: PathBuf,
		#[clap(short, long)]
		out: Option<PathBuf>,
		#[clap(short, long)]
		verbose: bool,
		#[clap(short, long = "dry-run")]
		dry_run: bool,
		#[clap(short, long, default_value_t = 19, value_parser = clap::value_parser!(i32).range(1..=22))]
		compression: i32,
	},
	/// Checks that a directory is a well-formed archive source.
	Validate { dir: PathBuf },
	/// Prints an archive's metadata without extracting it.
	Info { archive: PathBuf },
	/// Extracts an archive's files into a directory.
	Extract {
		archive: PathBuf,
		dir: PathBuf,
		#[clap(long = "no-verify")]
		no_verify: bool,
	},
}

fn main() {
	env_logger::Builder::from_default_env().format_timestamp(None).init();

	let cli = Cli::parse();
	if let Err(err) = run(cli.command) {
		eprintln!("{} {err:#}", "error:".red().bold());
		exit(1);
	}
}

fn run(command: Commands) -> anyhow::Result<()> {
	match command {
		Commands::Build { dir, out, verbose, dry_run, compression } => build(&dir, out, verbose, dry_run, compression),
		Commands::Validate { dir } => validate(&dir),
		Commands::Info { archive } => info(&archive),
		Commands::Extract { archive, dir, no_verify } => extract(&archive, &dir, no_verify),
	}
}

fn build(dir: &std::path::Path, out: Option<PathBuf>, verbose: bool, dry_run: bool, compression: i32) -> anyhow::Result<()> {
	let manifest = eden_core::archive::validate_source(dir)?;
	if verbose {
		log::info!("validated manifest for `{}` ({})", manifest.id, manifest.version);
	}
	if dry_run {
		println!("{} {dir:?} would produce a valid archive for `{}`", "dry run:".yellow(), manifest.id);
		return Ok(());
	}

	let bytes = eden_core::archive::build(dir, compression)?;
	let out_path = out.unwrap_or_else(|| dir.join(format!("{}.{}", manifest.id, eden_core::archive::ARCHIVE_EXTENSION)));
	eden_core::archive::write_file(&out_path, &bytes)?;

	println!("{} wrote {} ({} bytes)", "built:".green().bold(), out_path.display(), bytes.len());
	Ok(())
}

fn validate(dir: &std::path::Path) -> anyhow::Result<()> {
	let manifest = eden_core::archive::validate_source(dir)?;
	println!("{} `{}` is a valid archive source", "ok:".green().bold(), manifest.id);
	Ok(())
}

fn info(archive: &std::path::Path) -> anyhow::Result<()> {
	let bytes = eden_core::archive::read_file(archive)?;
	let metadata = eden_core::archive::peek(&bytes)?;
	println!("{}", serde_json::to_string_pretty(&metadata)?);
	Ok(())
}

fn extract(archive: &std::path::Path, dir: &std::path::Path, no_verify: bool) -> anyhow::Result<()> {
	if no_verify {
		log::warn!("--no-verify has no effect: the archive format checksums the compressed block unconditionally");
	}
	let bytes = eden_core::archive::read_file(archive)?;
	let decoded = eden_core::archive::decode(&bytes)?;
	eden_core::archive::extract_files(&decoded.tar_bytes, dir)?;
	println!("{} `{}` into {}", "extracted:".green().bold(), decoded.metadata.manifest.id, dir.display());
	Ok(())
}
