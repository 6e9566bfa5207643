//! Offline CRS converter CLI.
//!
//! Reads a CRS source tree and writes one rule file per category plus
//! an index file into the destination directory:
//!
//! ```text
//! crs-parse coreruleset/rules parsed_rules
//! ```

use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <crs-rules-dir> <output-dir>", args[0]);
        return ExitCode::from(2);
    }

    match rampart::crs::convert(Path::new(&args[1]), Path::new(&args[2])) {
        Ok(summary) => {
            println!(
                "parsed {} conf files into {} rules across {} category files",
                summary.files, summary.rules, summary.categories
            );
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("conversion failed: {e}");
            ExitCode::FAILURE
        },
    }
}
