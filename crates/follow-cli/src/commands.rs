//! Subcommand implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use follow_client::{follow, DatabaseAdmin, FeedConfig, RetryConfig, Since};
use tracing::{info, warn};

use crate::WatchArgs;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Build the feed configuration for `watch`.
pub fn feed_config(args: &WatchArgs) -> Result<FeedConfig, Box<dyn std::error::Error>> {
    let since: Since = args.since.parse()?;

    let mut retry = RetryConfig::new();
    if let Some(max) = args.max_retries {
        retry = retry.with_max_retries(max);
    }

    let mut config = FeedConfig::new(args.target.clone())
        .with_since(since)
        .with_include_docs(args.include_docs)
        .with_heartbeat(Duration::from_millis(args.heartbeat_ms))
        .with_retry(retry);
    if let Some(db) = &args.db {
        config = config.with_db_name(db.clone());
    }
    if let Some(filter) = &args.filter {
        config = config.with_remote_filter(filter.clone());
    }
    if let Some(only) = args.only_db.clone() {
        config = config.with_filter(move |change| change.is_for_database(&only));
    }
    Ok(config)
}

/// Tail a feed until Ctrl-C, the change limit, or a fatal error.
pub async fn watch(args: WatchArgs) -> CommandResult {
    let feed = follow(feed_config(&args)?)?;
    let printed = Arc::new(AtomicUsize::new(0));

    {
        let stopper = feed.clone();
        let printed = printed.clone();
        let limit = args.limit;
        feed.on_change(move |change| {
            match serde_json::to_string(change) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, seq = %change.seq, "failed to encode change"),
            }
            let count = printed.fetch_add(1, Ordering::SeqCst) + 1;
            if limit.is_some_and(|limit| count >= limit) {
                stopper.stop();
            }
        });
    }
    feed.on_catchup(|seq| info!(seq = %seq, "caught up"));
    feed.on_retry(|attempt, delay| {
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting")
    });
    feed.on_error(|err| warn!(error = %err, "feed error"));

    if args.limit == Some(0) {
        feed.stop();
        return Ok(feed.wait().await?);
    }
    feed.start()?;

    tokio::select! {
        result = feed.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping feed");
            feed.stop();
            feed.wait().await?;
        }
    }

    info!(
        changes = printed.load(Ordering::SeqCst),
        last_seq = ?feed.last_seq(),
        "done"
    );
    Ok(())
}

pub async fn create_db(server: &str, name: &str) -> CommandResult {
    let admin = DatabaseAdmin::new(server)?;
    let status = admin.create_database(name).await?;
    if status == 412 {
        println!("{} already exists", name);
    } else {
        println!("created {} ({})", name, status);
    }
    Ok(())
}

pub async fn delete_db(server: &str, name: &str) -> CommandResult {
    let admin = DatabaseAdmin::new(server)?;
    if admin.delete_database(name).await? {
        println!("deleted {}", name);
    } else {
        println!("{} does not exist", name);
    }
    Ok(())
}
