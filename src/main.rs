//! The `tabletscan` command-line tool, which drives the scan layer against an
//! in-memory store.

#[macro_use]
extern crate tracing;

mod cli;
mod telemetry;

use std::process::ExitCode;

fn main() -> ExitCode {
	cli::init()
}
