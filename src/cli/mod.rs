mod scan;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

const INFO: &str = "
Drives resumable range scans, document scans, and speculative scans over a
synthetic tablet-partitioned table held in memory.
";

#[derive(Parser, Debug)]
#[command(name = "Tabletscan command-line interface", bin_name = "tabletscan")]
#[command(about = INFO, version)]
#[command(arg_required_else_help = true)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	#[command(about = "Scan a synthetic table, verifying the order and count of the results")]
	Scan(scan::ScanCommandArguments),
}

pub fn init() -> ExitCode {
	let args = Cli::parse();
	// Build the runtime which the scans run on
	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => runtime,
		Err(e) => {
			eprintln!("Unable to start the runtime: {e}");
			return ExitCode::FAILURE;
		}
	};
	let output = match args.command {
		Commands::Scan(args) => runtime.block_on(scan::init(args)),
	};
	if let Err(e) = output {
		error!("{e:#}");
		ExitCode::FAILURE
	} else {
		ExitCode::SUCCESS
	}
}
