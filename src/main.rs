//! ShellExec worker: runs a fixed local command for each message on
//! `worker.shellexec`

use reworker::observability::init_default_logging;
use reworker::runner;
use reworker::workers::ShellExec;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_default_logging();

    info!("Starting shellexec worker v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = runner::run(ShellExec::default()).await {
        error!("Worker failed: {}", e);
        process::exit(1);
    }

    info!("Exiting...");
}
