//! # Live Feed Test
//!
//! Binds every configured feed (or the ones named on the command line) against a
//! running dashboard backend and prints each render until the duration elapses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lib_feedsync::dashboard::models::{AttackLogBook, ServerHealth, StatsSeries};
use lib_feedsync::loggers::setup_logging;
use lib_feedsync::{ConfigOverrides, DashboardConfig, FeedState, FeedSynchronizer};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Binds dashboard feeds and prints every render", long_about = None)]
struct Args {
    /// Path to a JSON5 configuration file.
    #[clap(long, env = "FEEDSYNC_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// REST base URL of the backend.
    #[clap(long, env = "FEEDSYNC_API_URL")]
    api_url: Option<String>,

    /// WebSocket base URL of the backend.
    #[clap(long, env = "FEEDSYNC_WS_URL")]
    ws_url: Option<String>,

    /// Base delay in milliseconds between reconnect attempts.
    #[clap(long, env = "FEEDSYNC_RECONNECT_BASE_DELAY_MS")]
    reconnect_base_delay_ms: Option<u64>,

    /// Feeds to bind; all configured feeds when omitted.
    #[clap(long = "feed")]
    feeds: Vec<String>,

    /// How long to stay bound, in seconds.
    #[clap(short, long, default_value_t = 30)]
    duration_secs: u64,

    /// Directory for log files; stdout only when omitted.
    #[clap(long, env = "FEEDSYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[clap(long, env = "FEEDSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn summarize(state: &FeedState) -> String {
    let head = format!(
        "[{}] rev={} status={} seq={:?} stale={} subs={}",
        state.feed_id,
        state.revision,
        state.connection_status,
        state.last_sequence(),
        state.stale_discarded,
        state.subscriber_count
    );
    let body = match state.feed_id.as_str() {
        "attack-stats" => StatsSeries::from_state(state).map(|s| format!("total={} points={:?}", s.total(), s.points().collect::<Vec<_>>())),
        "server-health" => ServerHealth::from_state(state).map(|rows| {
            rows.iter()
                .map(|r| format!("{}: {}% ({:?})", r.name, r.status, r.class()))
                .collect::<Vec<_>>()
                .join(", ")
        }),
        _ => Ok(state
            .last_update
            .as_ref()
            .map(|u| u.payload.to_string())
            .unwrap_or_default()),
    };
    match (body, &state.last_error) {
        (Ok(body), None) => format!("{} {}", head, body),
        (Ok(body), Some(err)) => format!("{} {} error={}", head, body, err),
        (Err(decode), _) => format!("{} decode error={}", head, decode),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging("test_live_feeds", args.log_dir.as_deref(), &args.log_level)?;

    let cli = ConfigOverrides {
        api_base_url: args.api_url.clone(),
        ws_base_url: args.ws_url.clone(),
        reconnect_base_delay_ms: args.reconnect_base_delay_ms,
        ..Default::default()
    };
    let config = DashboardConfig::load(args.config_path.as_deref(), cli).context("loading configuration")?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    let sync = FeedSynchronizer::new(Arc::new(config.network_transports()?));

    let feed_ids: Vec<String> = if args.feeds.is_empty() {
        config.feeds.iter().map(|f| f.feed_id.clone()).collect()
    } else {
        args.feeds.clone()
    };

    let mut bindings = Vec::new();
    for id in &feed_ids {
        let feed = config.feed(id)?;
        if id == "attack-logs" {
            let book = Arc::new(std::sync::Mutex::new(AttackLogBook::default()));
            bindings.push(sync.bind(feed, move |state| {
                let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
                match book.observe(state) {
                    Ok(true) => println!("{} logs={}", summarize(state), book.len()),
                    Ok(false) => println!("{}", summarize(state)),
                    Err(e) => println!("{} book error={}", summarize(state), e),
                }
            }));
        } else {
            bindings.push(sync.bind(feed, |state| println!("{}", summarize(state))));
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => println!("\n[*] Interrupted."),
    }

    for binding in &bindings {
        binding.teardown();
    }
    sync.shutdown();
    println!("[*] All feeds torn down: {:?}", sync.feed_ids());
    Ok(())
}
