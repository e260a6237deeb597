// RustyKV server entry point.
//
// Initializes logging, boots the node from the configuration directory
// (first CLI argument, default `.`), and serves until interrupted. Fatal
// startup failures map to distinct exit codes: 1 configuration, 2 cluster
// handshake, 3 WAL recovery, 4 engine open.

use rustykv::{bootstrap, VERSION};
use std::path::PathBuf;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let conf_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2 * num_cpus::get())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        info!("RustyKV {} starting from {}", VERSION, conf_dir.display());
        match bootstrap::start_node(&conf_dir).await {
            Ok(node) => {
                info!(
                    "serving on {} (manager {})",
                    node.handle.service_addr, node.handle.manager_addr
                );
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("signal handler failed: {}", e);
                    return 1;
                }
                info!("shutting down");
                node.handle.shutdown();
                0
            }
            Err(e) => {
                error!("startup failed: {}", e);
                e.exit_code()
            }
        }
    });

    std::process::exit(code);
}
