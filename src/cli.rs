use std::path::PathBuf;
use std::process;
use clap::Parser;
use crate::models::{Error, WatchConfig};

type Result<T> = std::result::Result<T, Error>;

/// Directories excluded from watching no matter where they appear in the
/// tree. `.git` churns heavily during normal development, so it is always
/// appended to whatever the user passes.
const DEFAULT_IGNORED_DIRS: &[&str] = &[".git"];

#[derive(Parser)]
#[command(name = "dirwatch")]
#[command(version = env!["CARGO_PKG_VERSION"])]
#[command(author = "arm1nt")]
#[command(about = "Recursively watch a directory tree and log file system changes", long_about = None)]
#[command(next_line_help = true)]
pub(crate) struct Cli {
    /// Root directory whose subtree should be watched
    pub(crate) root: PathBuf,

    /// Base-names of directories to exclude from watching (e.g. 'target' 'node_modules')
    pub(crate) ignored: Vec<String>
}

fn validate_root(root: &PathBuf) -> Result<()> {
    if !root.exists() {
        return Err(Error::new(format!("'{}' does not exist!", root.display())));
    }

    if !root.is_dir() {
        return Err(Error::new(format!("'{}' does not reference a directory!", root.display())));
    }

    Ok(())
}

pub(crate) fn parse_cli_arguments() -> WatchConfig {
    let cli: Cli = Cli::parse();

    if let Err(e) = validate_root(&cli.root) {
        eprintln!("[INPUT VALIDATION ERROR] {}", e.msg);
        process::exit(1);
    }

    let mut ignored_dirs = cli.ignored;
    for default in DEFAULT_IGNORED_DIRS {
        if !ignored_dirs.iter().any(|d| d == default) {
            ignored_dirs.push((*default).to_string());
        }
    }

    WatchConfig { root: cli.root, ignored_dirs }
}
