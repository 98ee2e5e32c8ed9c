//! # Dashboard Mutation Test
//!
//! Blocks and unblocks an address, adds a sample attack log, and refreshes the
//! attack-log feed to observe the result without waiting for the next tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lib_feedsync::{ConfigOverrides, DashboardConfig, FeedSynchronizer};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Exercises the dashboard mutation endpoints", long_about = None)]
struct Args {
    #[clap(long, env = "FEEDSYNC_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    #[clap(long, env = "FEEDSYNC_API_URL")]
    api_url: Option<String>,

    /// Address to block and unblock again.
    #[clap(long, default_value = "203.0.113.7")]
    ip: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    lib_feedsync::loggers::setup_logging("test_dashboard_api", None, "debug")?;

    let cli = ConfigOverrides {
        api_base_url: args.api_url.clone(),
        ..Default::default()
    };
    let config = DashboardConfig::load(args.config_path.as_deref(), cli)?;
    let api = config.dashboard_api()?;

    let sync = FeedSynchronizer::new(Arc::new(config.network_transports()?));
    let logs = sync.subscribe(config.feed("attack-logs")?, |state| {
        println!(
            "[attack-logs] rev={} status={} seq={:?} error={:?}",
            state.revision,
            state.connection_status,
            state.last_sequence(),
            state.last_error
        );
    });

    match api.block_ip(&args.ip).await {
        Ok(resp) => println!("[SUCCESS] {} -> {}", resp.ip, resp.status),
        Err(e) => eprintln!("[ERROR] block failed: {}", e),
    }
    match api.unblock_ip(&args.ip).await {
        Ok(resp) => println!("[SUCCESS] {} -> {}", resp.ip, resp.status),
        Err(e) => eprintln!("[ERROR] unblock failed: {}", e),
    }

    match api.add_sample_log().await {
        Ok(()) => {
            println!("[SUCCESS] Sample log added, refreshing attack-logs.");
            sync.refresh(logs.feed_id());
        }
        Err(e) => eprintln!("[ERROR] add-sample failed: {}", e),
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    logs.unsubscribe();
    Ok(())
}
