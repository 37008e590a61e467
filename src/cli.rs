use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Formats: binary STL\n",
    "Target:  ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Background loader for large binary model files
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Path to the binary STL file to load
    #[arg(value_name = "FILE")]
    pub file_path: PathBuf,

    /// Worker threads (default: auto from cores, file size and free memory)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Minimum progress delta between updates (0.001 - 0.1)
    #[arg(long = "step", value_name = "F")]
    pub step: Option<f64>,

    /// Cancel the load if it runs longer than SECS
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Enable logging to file (default: meshvault.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}
