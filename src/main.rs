use crate::models::WatchConfig;
use crate::util::error_exit;
use crate::util::log::setup_logging;

mod cli;
mod linux;
mod models;
mod util;

fn main() {
    setup_logging();

    let config: WatchConfig = cli::parse_cli_arguments();

    if let Err(e) = linux::run_fs_listener(config) {
        error_exit(Some(format!("{e}")));
    }
}
