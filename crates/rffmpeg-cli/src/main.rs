//! # rffmpeg-cli
//!
//! Binary entry point for rffmpeg.
//!
//! The binary picks its behaviour from the name it was invoked under:
//! - `ffmpeg` / `ffprobe` (usually symlinks): dispatch the tool to the least
//!   loaded remote host, or run it locally when none is usable
//! - `rffmpeg`: operator commands for inspecting and managing host state

mod admin;

use std::ffi::OsString;
use std::path::Path;

use clap::Parser;
use rffmpeg_core::{
    ConfigError, DirectoryTracker, Dispatcher, HostCatalog, RffmpegConfig, SignalListener,
    config_path, dispatch, logging,
};
use rffmpeg_proto::ToolInvocation;
use tracing::error;

/// Name under which the binary exposes operator commands.
const ADMIN_NAME: &str = "rffmpeg";

fn is_admin_invocation(program: Option<&OsString>) -> bool {
    program
        .and_then(|p| Path::new(p).file_name())
        .is_some_and(|name| name == ADMIN_NAME)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let argv: Vec<OsString> = std::env::args_os().collect();

    let code = if is_admin_invocation(argv.first()) {
        let cli = admin::Cli::parse_from(argv);
        match admin::execute(cli) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e:#}");
                1
            }
        }
    } else {
        run_dispatch(argv).await
    };

    std::process::exit(code);
}

/// Runs one ffmpeg or ffprobe invocation and returns its exit code.
///
/// Every guard (state record, signal streams) is dropped before this
/// returns, so the caller can exit immediately.
async fn run_dispatch(argv: Vec<OsString>) -> i32 {
    let mut signals = match SignalListener::install() {
        Ok(signals) => signals,
        Err(e) => {
            eprintln!("rffmpeg: failed to install signal handlers: {e}");
            return 1;
        }
    };

    let config = match RffmpegConfig::from_file(config_path()) {
        Ok(config) => config,
        Err(e) => {
            // No log file is known yet, so stderr is the only place to report this
            eprintln!("rffmpeg: {e}");
            return e.exit_code();
        }
    };

    // Stdout and stderr belong to the wrapped tool; without a log file we stay quiet
    logging::init_file_logging(&config.log_file(), false);

    let tracker = match DirectoryTracker::from_config(&config) {
        Ok(tracker) => tracker,
        Err(e) => {
            error!("Invalid state configuration: {}", e);
            eprintln!("rffmpeg: {e}");
            return ConfigError::EXIT_CODE;
        }
    };
    let catalog = HostCatalog::load(&config);
    let invocation = ToolInvocation::from_argv(argv);
    let dispatcher = Dispatcher::new(config);

    dispatch(
        &dispatcher,
        &catalog,
        &tracker,
        &invocation,
        std::process::id(),
        &mut signals,
    )
    .await
}
