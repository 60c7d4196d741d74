//! `feed-tail`: follow a chunked JSON feed and print one item per line.
//!
//! Settings come from the layered feed configuration (see
//! `codex_feed_stream::config`); command-line flags win over both the file
//! and the `FEED_*` environment. Logs go to stderr so stdout stays
//! line-delimited JSON.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Parser;
use codex_feed_stream::ConfigLoader;
use codex_feed_stream::FeedConfig;
use codex_feed_stream::HttpTransport;
use codex_feed_stream::PersistentStreamIterator;
use codex_feed_stream::PullIterator;
use codex_feed_stream::PullIteratorExt;
use serde_json::Value;

#[derive(Parser, Debug, Default)]
#[command(about = "Tail a chunked JSON feed, one item per line")]
struct Args {
    /// Config file; defaults to ./feed.toml, then the user config dir
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Feed URL
    #[arg(long)]
    url: Option<String>,

    /// Query parameter, repeatable
    #[arg(short = 'q', long = "query", value_name = "KEY=VALUE", value_parser = parse_pair)]
    query: Vec<(String, String)>,

    /// Request header, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME=VALUE", value_parser = parse_pair)]
    headers: Vec<(String, String)>,

    /// Path of the items in the body, e.g. `results.*`
    #[arg(short = 's', long)]
    selector: Option<String>,

    /// Reconnect when the server closes the feed
    #[arg(long)]
    indefinite: bool,

    /// Items handled at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Recycle a connection this many milliseconds after its first data
    #[arg(long = "force-reconnect-ms", value_name = "MS")]
    force_reconnect_ms: Option<u64>,

    /// Stop after printing this many items
    #[arg(short = 'n', long)]
    limit: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut FeedConfig) {
        if let Some(url) = &self.url {
            config.request.url = url.clone();
        }
        for (key, value) in &self.query {
            config.request.query.insert(key.clone(), value.clone());
        }
        for (name, value) in &self.headers {
            config.request.headers.insert(name.clone(), value.clone());
        }
        if let Some(selector) = &self.selector {
            config.selector = selector.clone();
        }
        if self.indefinite {
            config.indefinite = true;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(ms) = self.force_reconnect_ms {
            config.force_reconnect_after_ms = Some(ms);
        }
    }
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn emit(item: &Value) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, item)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::load_default(),
    }
    .context("loading feed configuration")?;
    args.apply(&mut config);
    let options = config
        .to_options()
        .context("invalid feed configuration")?;

    tracing::info!(
        url = %options.request.url,
        selector = %options.selector,
        indefinite = options.indefinite,
        concurrency = config.concurrency,
        "tailing feed"
    );

    let mut feed: PersistentStreamIterator =
        PersistentStreamIterator::new(Arc::new(HttpTransport::new()), options)?;

    let abort = feed.abort_handle();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, closing feed");
                abort.abort();
            }
        });
    }

    let printed = Arc::new(AtomicUsize::new(0));
    let limit = args.limit;
    let on_item = {
        let printed = Arc::clone(&printed);
        move |item: Value| {
            let printed = Arc::clone(&printed);
            let abort = abort.clone();
            async move {
                let seen = printed.fetch_add(1, Ordering::SeqCst) + 1;
                if limit.is_some_and(|limit| seen > limit) {
                    return Ok(());
                }
                emit(&item)?;
                if limit == Some(seen) {
                    abort.abort();
                }
                anyhow::Ok(())
            }
        }
    };

    let had_items = if config.concurrency > 1 {
        feed.for_each_throttled(on_item, config.concurrency).await?
    } else {
        feed.for_each(on_item).await?
    };

    tracing::info!(
        items = printed.load(Ordering::SeqCst).min(limit.unwrap_or(usize::MAX)),
        requests = feed.requests(),
        forced_reconnects = feed.forced_reconnects(),
        had_items,
        "feed closed"
    );
    Ok(())
}
