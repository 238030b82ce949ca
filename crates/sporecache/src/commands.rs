use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use sporecache_service::caching::ResourceCache;
use sporecache_service::config::{CacheConfig, Config};
use sporecache_service::polling::{PollState, PollerOptions};
use sporecache_service::scheduler::{Scheduler, TokioScheduler};
use sporecache_service::utils::http::HttpFetcher;

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Fresh,
    Stale,
    Cold,
}

impl Served {
    fn as_str(self) -> &'static str {
        match self {
            Served::Fresh => "fresh",
            Served::Stale => "stale",
            Served::Cold => "cold",
        }
    }
}

/// Reads `url` through a resource cache `repeat` times and prints every result.
pub async fn get(config: &Config, url: Url, repeat: u32, interval: Duration) -> Result<()> {
    let stdout = std::io::stdout();
    let reads = load_repeatedly(config, url, repeat, interval).await?;
    for (read, (served, data)) in reads.into_iter().enumerate() {
        writeln!(stdout.lock(), "#{} {}: {}", read + 1, served.as_str(), data)?;
    }
    Ok(())
}

async fn load_repeatedly(
    config: &Config,
    url: Url,
    repeat: u32,
    interval: Duration,
) -> Result<Vec<(Served, Value)>> {
    let fetcher = HttpFetcher::new(&config.http)?;
    let scheduler = TokioScheduler::shared();
    let cache = ResourceCache::<Value>::new(config.cache, scheduler.clone());
    let query = config.cache.query();

    let mut reads = Vec::new();
    for read in 0..repeat {
        if read > 0 {
            tokio::time::sleep(interval).await;
        }

        let served = match cache.read(url.as_str()) {
            Some(entry) if entry.is_stale(query.stale_time, scheduler.now()) => Served::Stale,
            Some(_) => Served::Fresh,
            None => Served::Cold,
        };
        let data = cache
            .load(url.clone(), fetcher.json(url.clone()), &query)
            .await
            .with_context(|| format!("failed to load {url}"))?;
        tracing::debug!(%url, served = served.as_str(), "Loaded resource");
        reads.push((served, data));
    }

    Ok(reads)
}

/// Whether any of `pointers` is missing or `null` in `document`.
fn is_incomplete(document: &Value, pointers: &[String]) -> bool {
    pointers
        .iter()
        .any(|pointer| document.pointer(pointer).is_none_or(Value::is_null))
}

/// Polls `url` until all `pointers` are present, printing every state change.
pub async fn watch(config: &Config, url: Url, pointers: Vec<String>) -> Result<()> {
    let state = poll_until_settled(config, url, pointers, |state| {
        let status = describe(state);
        let data = state.data.as_ref().map(Value::to_string).unwrap_or_default();
        println!("attempt {} {status}: {data}", state.attempt);
    })
    .await?;

    if let Some(error) = state.error {
        return Err(error).context("the record could not be fetched");
    }
    if state.gave_up {
        tracing::warn!("Record is still incomplete, giving up");
    }
    Ok(())
}

async fn poll_until_settled(
    config: &Config,
    url: Url,
    pointers: Vec<String>,
    mut report: impl FnMut(&PollState<Value>),
) -> Result<PollState<Value>> {
    let fetcher = HttpFetcher::new(&config.http)?;
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

    let poller = fetcher.auto_fetch_detail(
        Some(url),
        move |document: &Value| is_incomplete(document, &pointers),
        config.poller,
        Ok,
        TokioScheduler::shared(),
        move |state: &PollState<Value>| {
            sender.send(state.clone()).ok();
        },
    );

    loop {
        let state = tokio::select! {
            state = receiver.recv() => state,
            _ = tokio::signal::ctrl_c() => {
                poller.unsubscribe();
                anyhow::bail!("interrupted");
            }
        };
        let Some(state) = state else {
            return Ok(poller.state());
        };

        report(&state);
        if state.is_settled() {
            return Ok(state);
        }
    }
}

fn describe<T>(state: &PollState<T>) -> &'static str {
    if state.loading {
        "loading"
    } else if state.error.is_some() && !state.retrying {
        "failed"
    } else if state.retrying {
        "incomplete, retrying"
    } else if state.gave_up {
        "incomplete, gave up"
    } else {
        "complete"
    }
}

#[derive(Debug, Serialize)]
struct EffectiveConfig<'a> {
    cache: &'a CacheConfig,
    poller: &'a PollerOptions,
}

/// Prints the cache and poller configuration as YAML.
pub fn print_config(config: &Config) -> Result<()> {
    let effective = EffectiveConfig {
        cache: &config.cache,
        poller: &config.poller,
    };
    let yaml = serde_yaml::to_string(&effective).context("failed to serialize configuration")?;
    print!("{yaml}");
    Ok(())
}
